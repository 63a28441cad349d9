//! Policy for backends registered at run time.
//!
//! This module provides the [`BackendPolicy`] struct, which decides which
//! targets a dynamically registered backend may point at.

use std::collections::HashSet;

/// Which targets dynamic backends may reach.
///
/// # Security Philosophy
///
/// We follow the principle of least privilege:
/// - By default, dynamic backends are disabled
/// - Each allowed host must be listed explicitly
/// - Private and internal addresses are refused unless opted in
#[derive(Debug, Clone, Default)]
pub struct BackendPolicy {
    /// Allowed target hosts (domain patterns).
    ///
    /// Patterns can be:
    /// - Exact match: `api.example.com`
    /// - Wildcard subdomain: `*.example.com` (matches `api.example.com`, `www.example.com`)
    /// - All hosts: `*`
    pub allowed_hosts: HashSet<String>,

    /// Allow dynamic registration at all.
    pub dynamic_enabled: bool,

    /// Allow targets on loopback and private networks.
    pub allow_private: bool,
}

impl BackendPolicy {
    /// A policy refusing every dynamic backend.
    pub fn none() -> Self {
        Self::default()
    }

    /// A policy accepting any target, private addresses included.
    ///
    /// Intended for development and tests.
    pub fn all() -> Self {
        Self {
            allowed_hosts: HashSet::from(["*".to_string()]),
            dynamic_enabled: true,
            allow_private: true,
        }
    }

    pub fn builder() -> BackendPolicyBuilder {
        BackendPolicyBuilder::default()
    }

    /// Check whether a dynamic backend may target `target`.
    ///
    /// `target` is a URL or a bare `host[:port]`.
    pub fn is_target_allowed(&self, target: &str) -> bool {
        if !self.dynamic_enabled {
            return false;
        }

        let Some(url) = parse_target(target) else {
            return false;
        };
        let Some(host) = url.host_str().map(str::to_lowercase) else {
            return false;
        };

        if !self.allow_private && Self::is_private_address(url.as_str()) {
            tracing::warn!(target, "Dynamic backend refused: private address");
            return false;
        }

        if self.allowed_hosts.contains("*") {
            return true;
        }

        self.allowed_hosts
            .iter()
            .any(|pattern| Self::matches_pattern(pattern, &host))
    }

    /// Check if a host matches a permission pattern.
    fn matches_pattern(pattern: &str, host: &str) -> bool {
        let pattern = pattern.to_lowercase();

        if let Some(domain) = pattern.strip_prefix("*.") {
            host.ends_with(&pattern[1..]) || host == domain
        } else {
            pattern == host
        }
    }

    /// Check if the given URL points at a private or internal address.
    ///
    /// Covers:
    /// - localhost and 127.0.0.0/8
    /// - Private IP ranges (10.x.x.x, 172.16-31.x.x, 192.168.x.x)
    /// - Link-local addresses (169.254.x.x), including cloud metadata
    pub fn is_private_address(url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };

        match parsed.host() {
            Some(url::Host::Domain(domain)) => {
                let domain = domain.to_lowercase();
                domain == "localhost" || domain == "metadata.google.internal"
            }
            Some(url::Host::Ipv4(v4)) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_documentation()
                    || v4.is_unspecified()
            }
            Some(url::Host::Ipv6(v6)) => v6.is_loopback() || v6.is_unspecified(),
            None => false,
        }
    }
}

/// Parse a backend target, defaulting the scheme to `http`.
pub fn parse_target(target: &str) -> Option<url::Url> {
    if target.contains("://") {
        url::Url::parse(target).ok()
    } else {
        url::Url::parse(&format!("http://{target}")).ok()
    }
}

/// Builder for [`BackendPolicy`].
#[derive(Debug, Default)]
pub struct BackendPolicyBuilder {
    inner: BackendPolicy,
}

impl BackendPolicyBuilder {
    /// Allow dynamic backends targeting specific hosts.
    #[must_use]
    pub fn allow_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.dynamic_enabled = true;
        self.inner.allowed_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Allow loopback and private-network targets.
    #[must_use]
    pub fn allow_private_addresses(mut self) -> Self {
        self.inner.allow_private = true;
        self
    }

    #[must_use]
    pub fn build(self) -> BackendPolicy {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_none() {
        let policy = BackendPolicy::none();
        assert!(!policy.dynamic_enabled);
        assert!(!policy.is_target_allowed("https://api.example.com"));
    }

    #[test]
    fn test_policy_all() {
        let policy = BackendPolicy::all();
        assert!(policy.is_target_allowed("https://evil.com/path"));
        assert!(policy.is_target_allowed("127.0.0.1:9000"));
    }

    #[test]
    fn test_exact_match() {
        let policy = BackendPolicy::builder()
            .allow_hosts(["api.example.com"])
            .build();

        assert!(policy.is_target_allowed("https://api.example.com/path"));
        assert!(policy.is_target_allowed("api.example.com:443"));
        assert!(!policy.is_target_allowed("https://other.example.com/path"));
    }

    #[test]
    fn test_wildcard() {
        let policy = BackendPolicy::builder()
            .allow_hosts(["*.example.com"])
            .build();

        assert!(policy.is_target_allowed("https://api.example.com/path"));
        assert!(policy.is_target_allowed("https://example.com/path"));
        assert!(!policy.is_target_allowed("https://evil.com/path"));
        assert!(!policy.is_target_allowed("https://notexample.com/path"));
    }

    #[test]
    fn test_private_targets_refused_by_default() {
        let policy = BackendPolicy::builder().allow_hosts(["*"]).build();
        assert!(!policy.is_target_allowed("http://localhost:8080/"));
        assert!(!policy.is_target_allowed("http://192.168.1.1/"));

        let policy = BackendPolicy::builder()
            .allow_hosts(["*"])
            .allow_private_addresses()
            .build();
        assert!(policy.is_target_allowed("http://localhost:8080/"));
    }

    #[test]
    fn test_private_address_detection() {
        assert!(BackendPolicy::is_private_address("http://127.0.0.1:8080/"));
        assert!(BackendPolicy::is_private_address("http://[::1]:8080/"));
        assert!(BackendPolicy::is_private_address("http://10.0.0.1/"));
        assert!(BackendPolicy::is_private_address("http://172.16.0.1/"));
        assert!(BackendPolicy::is_private_address("http://169.254.169.254/"));
        assert!(BackendPolicy::is_private_address(
            "http://metadata.google.internal/"
        ));
        assert!(!BackendPolicy::is_private_address("https://api.example.com/"));
        assert!(!BackendPolicy::is_private_address("https://8.8.8.8/"));
    }

    #[test]
    fn test_parse_target_defaults_scheme() {
        let url = parse_target("example.com:8443").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.port(), Some(8443));
    }
}
