//! Destination Filter
//!
//! Allow/deny sets of `host:port` destinations shared by the CONNECT and the
//! WebSocket-upgrade paths.

use std::collections::HashSet;

/// Split `host:port` into its parts. IPv6 literals use brackets: `[::1]:443`.
pub fn split_destination(entry: &str) -> Option<(&str, u16)> {
    let entry = entry.trim();
    let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        entry.rsplit_once(':')?
    };
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host, port))
}

fn destination_key(host: &str, port: u16) -> String {
    format!("{}:{}", host.to_ascii_lowercase(), port)
}

/// Allow/deny decision for relay destinations
///
/// Evaluation order is fixed: a non-empty allow set must contain the
/// destination, then the deny set always rejects.
#[derive(Debug, Clone, Default)]
pub struct DestinationFilter {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl DestinationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config lists; malformed entries are skipped with a warning
    pub fn from_lists<A, D>(allow: A, deny: D) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let mut filter = Self::new();
        for entry in allow {
            match split_destination(entry.as_ref()) {
                Some((host, port)) => filter.allow(host, port),
                None => tracing::warn!("Ignoring malformed allow entry '{}'", entry.as_ref()),
            }
        }
        for entry in deny {
            match split_destination(entry.as_ref()) {
                Some((host, port)) => filter.deny(host, port),
                None => tracing::warn!("Ignoring malformed deny entry '{}'", entry.as_ref()),
            }
        }
        filter
    }

    pub fn allow(&mut self, host: &str, port: u16) {
        self.allow.insert(destination_key(host, port));
    }

    pub fn deny(&mut self, host: &str, port: u16) {
        self.deny.insert(destination_key(host, port));
    }

    pub fn permits(&self, host: &str, port: u16) -> bool {
        let key = destination_key(host, port);
        if !self.allow.is_empty() && !self.allow.contains(&key) {
            return false;
        }
        !self.deny.contains(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_destination() {
        assert_eq!(split_destination("example.com:443"), Some(("example.com", 443)));
        assert_eq!(split_destination("[::1]:8080"), Some(("::1", 8080)));
        assert_eq!(split_destination("example.com"), None);
        assert_eq!(split_destination(":80"), None);
        assert_eq!(split_destination("example.com:http"), None);
        assert_eq!(split_destination("example.com:70000"), None);
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let filter = DestinationFilter::new();
        assert!(filter.permits("example.com", 443));
        assert!(filter.permits("10.0.0.1", 22));
    }

    #[test]
    fn test_deny_always_wins() {
        let destinations = [("ads.example.com", 80), ("cdn.example.com", 443), ("Example.COM", 8080)];
        for (host, port) in destinations {
            // deny only
            let mut filter = DestinationFilter::new();
            filter.deny(host, port);
            assert!(!filter.permits(host, port));

            // deny and allow the same destination
            filter.allow(host, port);
            assert!(!filter.permits(host, port));

            // other allowed destinations do not change that
            filter.allow("other.example.com", 443);
            assert!(!filter.permits(host, port));
        }
    }

    #[test]
    fn test_non_empty_allow_is_strict() {
        let mut filter = DestinationFilter::new();
        filter.allow("hub.example.com", 443);

        assert!(filter.permits("hub.example.com", 443));
        assert!(!filter.permits("hub.example.com", 80));
        assert!(!filter.permits("elsewhere.example.com", 443));
    }

    #[test]
    fn test_port_is_part_of_the_key() {
        let filter = DestinationFilter::from_lists(Vec::<String>::new(), ["ads.example.com:80"]);
        assert!(!filter.permits("ads.example.com", 80));
        assert!(filter.permits("ads.example.com", 443));
    }

    #[test]
    fn test_host_match_is_case_insensitive() {
        let filter = DestinationFilter::from_lists(Vec::<String>::new(), ["ADS.example.com:80"]);
        assert!(!filter.permits("ads.EXAMPLE.com", 80));
    }

    #[test]
    fn test_from_lists_skips_malformed() {
        let filter = DestinationFilter::from_lists(["good.example.com:443", "bad"], ["nope"]);
        assert!(filter.permits("good.example.com", 443));
        assert!(!filter.permits("bad", 80));
    }
}
