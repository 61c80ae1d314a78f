//! Typed configuration consumed by the routing engine.
//!
//! The file format is YAML. Every section is optional except `routes`, which
//! must hold at least one route. The engine applies defaults where a value
//! is missing, but a value that is present and unparsable is always rejected.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Probe interval used when a route enables health checks without an interval.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// Probe timeout used when a route enables health checks without a timeout.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Root configuration object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and identity of this service.
    pub service: ServiceConfig,
    /// Optional TLS termination material.
    pub tls: Option<TlsConfig>,
    /// Log level and access log destination.
    pub logging: LoggingConfig,
    /// Administrative endpoint.
    pub admin: AdminConfig,
    /// Timeouts and connection settings shared by every route.
    pub defaults: Defaults,
    /// Named backend groups, each an ordered list of addresses.
    pub backends: HashMap<String, Vec<String>>,
    /// Ordered route list; earlier routes win when several match.
    pub routes: Vec<Route>,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Human-readable service name, used in logs.
    pub name: String,
    /// Deployment environment label.
    pub env: String,
    /// Listen address, either `host:port` or the `:port` shorthand.
    pub listen: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "meridian".to_string(),
            env: "dev".to_string(),
            listen: ":8080".to_string(),
        }
    }
}

/// TLS termination settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is terminated on the service listener.
    pub enabled: bool,
    /// PEM certificate chain.
    pub cert_path: String,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1).
    pub key_path: String,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// Access log file; empty or `-` means standard output.
    pub access_log: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            access_log: String::new(),
        }
    }
}

/// Administrative endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Whether the admin listener is started.
    pub enabled: bool,
    /// Admin listen address.
    pub listen: String,
    /// Path answering liveness checks.
    pub health_endpoint: String,
    /// Path serving the routing snapshot.
    pub metric_endpoint: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: ":9090".to_string(),
            health_endpoint: "/healthz".to_string(),
            metric_endpoint: "/metrics".to_string(),
        }
    }
}

/// Shared timeouts and connection behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Deadline for reading request headers from a client.
    pub read_timeout: String,
    /// Deadline for producing a response to a client.
    pub write_timeout: String,
    /// Deadline for establishing a backend connection.
    pub backend_connect_timeout: String,
    /// Deadline for a backend round-trip; falls back to `write_timeout`.
    pub backend_read_timeout: Option<String>,
    /// TCP keep-alive interval on backend connections.
    pub connection_keep_alive: String,
    /// Accepted for compatibility; retries are not performed.
    pub retry_on_5xx: bool,
    /// Accepted for compatibility; retries are not performed.
    pub max_retries: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            read_timeout: "10s".to_string(),
            write_timeout: "10s".to_string(),
            backend_connect_timeout: "5s".to_string(),
            backend_read_timeout: None,
            connection_keep_alive: "30s".to_string(),
            retry_on_5xx: false,
            max_retries: 0,
        }
    }
}

/// A backend reference: a single group name or address, or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BackendRef {
    /// One group name or address.
    One(String),
    /// Several group names and/or addresses, in order.
    Many(Vec<String>),
}

impl Default for BackendRef {
    fn default() -> Self {
        BackendRef::Many(Vec::new())
    }
}

/// One route: how to match a request and where to send it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Route {
    /// Registry key. Generated from the route position when empty.
    pub id: String,
    /// Host/path/method matchers.
    #[serde(rename = "match")]
    pub matcher: MatchConfig,
    /// Backend group names or literal addresses.
    pub backend: BackendRef,
    /// Balancing strategy name.
    pub lb: String,
    /// Cookie-based session affinity.
    pub sticky: Option<StickyConfig>,
    /// Active health checking.
    pub health: Option<HealthConfig>,
    /// Accepted and ignored.
    pub retry: Option<RetryConfig>,
    /// Accepted and ignored.
    pub rate_limit: Option<RateLimitConfig>,
}

/// Request matchers. Empty matchers match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Exact `Host` header value.
    pub host: String,
    /// Path prefix, matched on segment boundaries.
    pub path: String,
    /// Allowed HTTP methods.
    pub methods: Vec<String>,
}

/// Session affinity settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StickyConfig {
    /// Whether the affinity cookie is issued and honoured.
    pub enabled: bool,
    /// Cookie name.
    pub cookie_name: String,
    /// Cookie lifetime in seconds.
    pub ttl: u64,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: "meridian_affinity".to_string(),
            ttl: 3600,
        }
    }
}

/// Active health check settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Path probed on every backend.
    pub path: String,
    /// Time between probe cycles.
    pub interval: Option<String>,
    /// Per-probe deadline.
    pub timeout: Option<String>,
    /// Status code a healthy backend answers with.
    pub expected_status: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval: None,
            timeout: None,
            expected_status: 200,
        }
    }
}

impl HealthConfig {
    /// Probe interval, defaulting to [`DEFAULT_HEALTH_INTERVAL`].
    pub fn interval(&self) -> Result<Duration> {
        match &self.interval {
            Some(raw) => parse_duration("health.interval", raw),
            None => Ok(DEFAULT_HEALTH_INTERVAL),
        }
    }

    /// Probe timeout, defaulting to [`DEFAULT_HEALTH_TIMEOUT`].
    pub fn timeout(&self) -> Result<Duration> {
        match &self.timeout {
            Some(raw) => parse_duration("health.timeout", raw),
            None => Ok(DEFAULT_HEALTH_TIMEOUT),
        }
    }
}

/// Retry policy. Not enforced.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Whether retries were requested.
    pub enabled: bool,
    /// Requested retry budget.
    pub max_retries: u32,
    /// Requested per-attempt deadline.
    pub per_try_timeout: String,
}

/// Rate limit policy. Not enforced.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether rate limiting was requested.
    pub enabled: bool,
    /// Requested sustained rate.
    pub requests_per_second: u32,
    /// Requested burst size.
    pub burst: u32,
}

impl Config {
    /// Reads, parses and validates a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        parse_listen_addr(&self.service.listen)?;

        if self.routes.is_empty() {
            return Err(Error::Config("no routes configured".to_string()));
        }

        if let Some(tls) = self.tls.as_ref().filter(|tls| tls.enabled) {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                return Err(Error::Config(
                    "tls is enabled but cert_path or key_path is missing".to_string(),
                ));
            }
        }

        if self.admin.enabled {
            parse_listen_addr(&self.admin.listen)?;
        }

        let mut seen = HashSet::new();
        for (index, route) in self.routes.iter().enumerate() {
            let key = route.key(index);
            if !seen.insert(key.clone()) {
                return Err(Error::RouteExists(key));
            }
        }

        Ok(())
    }
}

impl Defaults {
    /// Client header read deadline.
    pub fn read_timeout(&self) -> Result<Duration> {
        parse_duration("read_timeout", &self.read_timeout)
    }

    /// Client response deadline.
    pub fn write_timeout(&self) -> Result<Duration> {
        parse_duration("write_timeout", &self.write_timeout)
    }

    /// Backend connect deadline.
    pub fn backend_connect_timeout(&self) -> Result<Duration> {
        parse_duration("backend_connect_timeout", &self.backend_connect_timeout)
    }

    /// Backend keep-alive interval.
    pub fn connection_keep_alive(&self) -> Result<Duration> {
        parse_duration("connection_keep_alive", &self.connection_keep_alive)
    }

    /// Backend round-trip deadline.
    pub fn backend_read_timeout(&self) -> Result<Duration> {
        match &self.backend_read_timeout {
            Some(raw) => parse_duration("backend_read_timeout", raw),
            None => self.write_timeout(),
        }
    }
}

impl Route {
    /// Registry key for the route at `index` in the configuration.
    pub fn key(&self, index: usize) -> String {
        if self.id.is_empty() {
            format!("route-{index}")
        } else {
            self.id.clone()
        }
    }

    /// Expands group names into their addresses.
    ///
    /// Entries that name a group are replaced by that group's members;
    /// anything else is taken as a literal address. Order is preserved and
    /// exact duplicates keep only their first occurrence.
    pub fn resolve_backends(&self, groups: &HashMap<String, Vec<String>>) -> Vec<String> {
        let entries: &[String] = match &self.backend {
            BackendRef::One(entry) => std::slice::from_ref(entry),
            BackendRef::Many(entries) => entries,
        };

        let mut seen = HashSet::new();
        entries
            .iter()
            .flat_map(|entry| match groups.get(entry) {
                Some(members) => members.clone(),
                None => vec![entry.clone()],
            })
            .filter(|addr| !addr.trim().is_empty())
            .filter(|addr| seen.insert(addr.clone()))
            .collect()
    }

    /// Returns the sticky policy if it is enabled.
    pub fn sticky(&self) -> Option<&StickyConfig> {
        self.sticky.as_ref().filter(|sticky| sticky.enabled)
    }
}

/// Parses a human duration such as `5s`, `250ms` or `1m`.
pub fn parse_duration(field: &'static str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).map_err(|source| Error::InvalidDuration {
        field,
        value: value.to_string(),
        source,
    })
}

/// Resolves a listen address, accepting the `:port` shorthand for all interfaces.
pub fn parse_listen_addr(listen: &str) -> Result<SocketAddr> {
    let candidate = match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_string(),
    };

    candidate
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::Config(format!("invalid listen address {listen:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
service:
  name: edge
  listen: ":8080"
logging:
  level: debug
  access_log: "-"
defaults:
  read_timeout: 5s
  write_timeout: 5s
  backend_connect_timeout: 500ms
  connection_keep_alive: 30s
backends:
  web:
    - http://10.0.0.1:80
    - http://10.0.0.2:80
routes:
  - id: api
    match:
      host: api.example.com
      path: /api
      methods: [GET, POST]
    backend: [web, http://10.0.0.3:80, http://10.0.0.1:80]
    lb: round-robin
    sticky:
      enabled: true
      cookie_name: SRV
      ttl: 600
    health:
      path: /healthz
      interval: 3s
    retry:
      enabled: true
      max_retries: 2
  - match:
      path: /
    backend: web
"#;

    #[test]
    fn parses_full_document() {
        let config = Config::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.service.name, "edge");
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].key(0), "api");
        assert_eq!(config.routes[1].key(1), "route-1");
        assert_eq!(config.routes[0].matcher.methods, vec!["GET", "POST"]);
        assert_eq!(config.routes[0].sticky().unwrap().cookie_name, "SRV");
        assert_eq!(
            config.routes[0].health.as_ref().unwrap().interval().unwrap(),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.defaults.backend_connect_timeout().unwrap(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn resolves_groups_in_order_without_duplicates() {
        let config = Config::from_yaml(SAMPLE).unwrap();

        let api = config.routes[0].resolve_backends(&config.backends);
        assert_eq!(
            api,
            vec!["http://10.0.0.1:80", "http://10.0.0.2:80", "http://10.0.0.3:80"]
        );

        let fallback = config.routes[1].resolve_backends(&config.backends);
        assert_eq!(fallback, vec!["http://10.0.0.1:80", "http://10.0.0.2:80"]);
    }

    #[test]
    fn literal_address_passes_through() {
        let route = Route {
            backend: BackendRef::One("127.0.0.1:9000".to_string()),
            ..Route::default()
        };
        assert_eq!(route.resolve_backends(&HashMap::new()), vec!["127.0.0.1:9000"]);
    }

    #[test]
    fn rejects_duplicate_route_ids() {
        let raw = r#"
routes:
  - id: a
    backend: x:1
  - id: a
    backend: y:1
"#;
        assert!(matches!(Config::from_yaml(raw), Err(Error::RouteExists(key)) if key == "a"));
    }

    #[test]
    fn rejects_missing_routes() {
        let raw = "service:\n  listen: \":8080\"\n";
        assert!(matches!(Config::from_yaml(raw), Err(Error::Config(msg)) if msg.contains("routes")));
        assert!(matches!(Config::from_yaml("routes: []\n"), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_bad_listen_address() {
        let raw = "service:\n  listen: not-an-address\n";
        assert!(matches!(Config::from_yaml(raw), Err(Error::Config(_))));
    }

    #[test]
    fn listen_shorthand_binds_all_interfaces() {
        let addr = parse_listen_addr(":80").unwrap();
        assert_eq!(addr, "0.0.0.0:80".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn bad_duration_names_the_field() {
        let defaults = Defaults {
            connection_keep_alive: "forever".to_string(),
            ..Defaults::default()
        };
        let err = defaults.connection_keep_alive().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidDuration { field: "connection_keep_alive", .. }
        ));
    }

    #[test]
    fn backend_read_timeout_falls_back_to_write_timeout() {
        let defaults = Defaults {
            write_timeout: "7s".to_string(),
            ..Defaults::default()
        };
        assert_eq!(defaults.backend_read_timeout().unwrap(), Duration::from_secs(7));
    }

    #[test]
    fn disabled_sticky_is_ignored() {
        let route = Route {
            sticky: Some(StickyConfig::default()),
            ..Route::default()
        };
        assert!(route.sticky().is_none());
    }
}
