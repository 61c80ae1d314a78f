//! Request matching rules.

use crate::config::MatchConfig;

/// Host, path and method matchers for one route.
///
/// Empty matchers accept anything. The path matcher is a prefix that only
/// matches on segment boundaries, so `/api` accepts `/api` and `/api/v1`
/// but not `/apix`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMatcher {
    host: String,
    path: String,
    methods: Vec<String>,
}

impl RouteMatcher {
    /// Build a matcher from its configuration.
    pub fn new(config: &MatchConfig) -> Self {
        Self {
            host: config.host.trim().to_string(),
            path: config.path.trim().to_string(),
            methods: config.methods.iter().map(|m| m.trim().to_ascii_uppercase()).collect(),
        }
    }

    /// Whether a request with this host, path and method belongs to the route.
    pub fn matches(&self, host: &str, path: &str, method: &str) -> bool {
        self.matches_host(host) && self.matches_path(path) && self.matches_method(method)
    }

    fn matches_host(&self, host: &str) -> bool {
        if self.host.is_empty() || self.host.eq_ignore_ascii_case(host) {
            return true;
        }
        // A matcher without a port accepts the host on any port.
        !self.host.contains(':')
            && host
                .rsplit_once(':')
                .is_some_and(|(name, _)| self.host.eq_ignore_ascii_case(name))
    }

    fn matches_path(&self, path: &str) -> bool {
        let prefix = self.path.as_str();
        if prefix.is_empty() || prefix == "/" {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }

    fn matches_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(host: &str, path: &str, methods: &[&str]) -> RouteMatcher {
        RouteMatcher::new(&MatchConfig {
            host: host.to_string(),
            path: path.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
        })
    }

    #[test]
    fn empty_matcher_accepts_everything() {
        let m = matcher("", "", &[]);
        assert!(m.matches("anything", "/deep/path", "DELETE"));
    }

    #[test]
    fn root_path_matches_every_path() {
        let m = matcher("", "/", &[]);
        for path in ["/", "/api", "/a/b/c", ""] {
            assert!(m.matches("h", path, "GET"), "{path}");
        }
    }

    #[test]
    fn path_prefix_respects_segment_boundary() {
        let m = matcher("", "/api", &[]);
        assert!(m.matches("h", "/api", "GET"));
        assert!(m.matches("h", "/api/", "GET"));
        assert!(m.matches("h", "/api/v1", "GET"));
        assert!(!m.matches("h", "/apix", "GET"));
        assert!(!m.matches("h", "/apiextra", "GET"));
        assert!(!m.matches("h", "/other", "GET"));
    }

    #[test]
    fn trailing_slash_prefix_matches_children() {
        let m = matcher("", "/static/", &[]);
        assert!(m.matches("h", "/static/app.js", "GET"));
        assert!(!m.matches("h", "/static", "GET"));
    }

    #[test]
    fn host_must_match_when_set() {
        let m = matcher("api.example.com", "", &[]);
        assert!(m.matches("api.example.com", "/", "GET"));
        assert!(m.matches("API.example.com", "/", "GET"));
        assert!(m.matches("api.example.com:8443", "/", "GET"));
        assert!(!m.matches("www.example.com", "/", "GET"));
    }

    #[test]
    fn host_with_port_is_exact() {
        let m = matcher("api.example.com:8080", "", &[]);
        assert!(m.matches("api.example.com:8080", "/", "GET"));
        assert!(!m.matches("api.example.com:9090", "/", "GET"));
        assert!(!m.matches("api.example.com", "/", "GET"));
    }

    #[test]
    fn method_list_is_checked() {
        let m = matcher("", "", &["get", "POST"]);
        assert!(m.matches("h", "/", "GET"));
        assert!(m.matches("h", "/", "POST"));
        assert!(!m.matches("h", "/", "DELETE"));
    }
}
