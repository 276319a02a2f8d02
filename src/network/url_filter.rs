use crate::configuration::types::{url_matches, NetworkDetailOptions, UrlPattern};

/// Decides which request URLs may have their details captured.
///
/// A URL qualifies when it matches the allow list and does not match the
/// deny list. An empty allow list lets nothing through.
#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    allow: Vec<UrlPattern>,
    deny: Vec<UrlPattern>,
}

impl UrlFilter {
    pub fn new(options: &NetworkDetailOptions) -> Self {
        Self {
            allow: options.allow_urls.clone(),
            deny: options.deny_urls.clone(),
        }
    }

    pub fn has_urls(&self) -> bool {
        !self.allow.is_empty()
    }

    pub fn allows(&self, url: &str) -> bool {
        url_matches(url, &self.allow) && !url_matches(url, &self.deny)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(allow: &[&str], deny: &[&str]) -> UrlFilter {
        let parse = |list: &[&str]| list.iter().map(|p| UrlPattern::parse(p).unwrap()).collect();
        UrlFilter::new(&NetworkDetailOptions {
            allow_urls: parse(allow),
            deny_urls: parse(deny),
            ..Default::default()
        })
    }

    #[test]
    fn empty_allow_list_captures_nothing() {
        let filter = filter(&[], &[]);
        assert!(!filter.has_urls());
        assert!(!filter.allows("https://api.example.com"));
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let filter = filter(&["example.com"], &["/\\/auth\\//"]);
        assert!(filter.allows("https://example.com/api/users"));
        assert!(!filter.allows("https://example.com/auth/login"));
        assert!(!filter.allows("https://other.test/api"));
    }
}
