//! Toolkit-scoped host allowlist.
//!
//! The sole authority for which upstream hosts a proxied request may
//! reach. Static configuration keyed by toolkit slug; patterns are exact
//! hosts or `*.suffix` wildcards.

use std::collections::HashMap;

/// Map from toolkit slug to permitted host patterns.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    map: HashMap<String, Vec<String>>,
}

impl Allowlist {
    /// Built-in allowlist for the toolkits the product ships with.
    pub fn builtin() -> Self {
        let mut list = Self::default();
        list.insert("gmail", &["gmail.googleapis.com", "www.googleapis.com"]);
        list.insert("googlecalendar", &["www.googleapis.com"]);
        list.insert("googledrive", &["www.googleapis.com", "*.googleusercontent.com"]);
        list.insert("github", &["api.github.com", "uploads.github.com"]);
        list.insert("slack", &["slack.com", "*.slack.com"]);
        list.insert("notion", &["api.notion.com"]);
        list.insert("linear", &["api.linear.app"]);
        list
    }

    pub fn insert(&mut self, toolkit: &str, hosts: &[&str]) {
        self.map.insert(
            toolkit.to_string(),
            hosts.iter().map(|host| host.to_string()).collect(),
        );
    }

    /// Is `host` reachable for `toolkit`? A `:port` suffix on the host
    /// is ignored for matching.
    pub fn allows(&self, toolkit: &str, host: &str) -> bool {
        let Some(patterns) = self.map.get(toolkit) else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let host = host.split(':').next().unwrap_or(&host);
        patterns.iter().any(|pattern| matches(pattern, host))
    }
}

fn matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        // Wildcard covers subdomains, never the bare apex.
        host.len() > suffix.len() + 1
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
    } else {
        pattern.eq_ignore_ascii_case(host)
    }
}
