//! Invalidation Filters
//!
//! Keys are matched exactly, by literal prefix, or by a URL whose host
//! carries a `*` wildcard (`https://*.example.com/img/`).

use crate::error::{Error, Result};
use glob::{MatchOptions, Pattern};

const HOST_MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Split a URL-shaped key into `(scheme://, host[:port], remainder)`
///
/// Userinfo before `@` is not part of the host.
pub fn split_url(key: &str) -> Option<(&str, &str, &str)> {
    let scheme_end = key.find("://")? + 3;
    let after = &key[scheme_end..];
    let host_end = after.find(['/', '?', '#']).unwrap_or(after.len());
    let authority = &after[..host_end];
    let host = match authority.rfind('@') {
        Some(at) => &authority[at + 1..],
        None => authority,
    };
    Some((&key[..scheme_end], host, &after[host_end..]))
}

/// URL with a wildcard host
#[derive(Debug, Clone)]
pub struct WildcardKey {
    scheme: String,
    host: Pattern,
    host_text: String,
    rest: String,
    prefix: bool,
}

impl WildcardKey {
    /// Parse `raw` if its host contains `*`
    pub fn parse(raw: &str, prefix: bool) -> Result<Option<Self>> {
        let (scheme, host, rest) = match split_url(raw) {
            Some(parts) => parts,
            None => return Ok(None),
        };
        if !host.contains('*') {
            return Ok(None);
        }
        let pattern = Pattern::new(host)
            .map_err(|e| Error::Configuration(format!("invalid host pattern {}: {}", host, e)))?;
        Ok(Some(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: pattern,
            host_text: host.to_string(),
            rest: rest.to_string(),
            prefix,
        }))
    }

    /// Host glob as written, usable as an SQL `GLOB` prefilter
    pub fn host_glob(&self) -> &str {
        &self.host_text
    }

    pub fn matches(&self, key: &str) -> bool {
        let (scheme, host, rest) = match split_url(key) {
            Some(parts) => parts,
            None => return false,
        };
        if !scheme.eq_ignore_ascii_case(&self.scheme) {
            return false;
        }
        if !self.host.matches_with(host, HOST_MATCH) {
            return false;
        }
        if self.prefix {
            rest.starts_with(&self.rest)
        } else {
            rest == self.rest
        }
    }
}

/// Selects index rows for invalidation
#[derive(Debug, Clone)]
pub enum KeyFilter {
    Exact(String),
    Prefix(String),
    Wildcard(WildcardKey),
}

impl KeyFilter {
    /// Literal prefix
    pub fn prefix(prefix: impl Into<String>) -> Self {
        KeyFilter::Prefix(prefix.into())
    }

    /// Exact key, or wildcard host with exact remainder
    pub fn match_key(key: &str) -> Result<Self> {
        Ok(match WildcardKey::parse(key, false)? {
            Some(w) => KeyFilter::Wildcard(w),
            None => KeyFilter::Exact(key.to_string()),
        })
    }

    /// Prefix, or wildcard host with a remainder prefix
    pub fn match_prefix(prefix: &str) -> Result<Self> {
        Ok(match WildcardKey::parse(prefix, true)? {
            Some(w) => KeyFilter::Wildcard(w),
            None => KeyFilter::Prefix(prefix.to_string()),
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyFilter::Exact(k) => key == k,
            KeyFilter::Prefix(p) => key.starts_with(p.as_str()),
            KeyFilter::Wildcard(w) => w.matches(key),
        }
    }
}

/// Escape SQLite GLOB metacharacters
pub fn glob_escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len() + 2);
    for c in literal.chars() {
        match c {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_url() {
        assert_eq!(
            split_url("https://a.example.com/x?y"),
            Some(("https://", "a.example.com", "/x?y"))
        );
        assert_eq!(split_url("https://a.example.com"), Some(("https://", "a.example.com", "")));
        assert_eq!(split_url("no-scheme"), None);
        assert_eq!(
            split_url("https://user:pw@img.example.com/x"),
            Some(("https://", "img.example.com", "/x"))
        );
    }

    #[test]
    fn test_wildcard_host_prefix() {
        let filter = KeyFilter::match_prefix("https://*.example.com/a").unwrap();
        assert!(filter.matches("https://www.example.com/a/b.png"));
        assert!(filter.matches("https://img.cdn.example.com/a"));
        assert!(filter.matches("https://IMG.Example.com/a"));
        assert!(!filter.matches("https://example.com/a"));
        assert!(!filter.matches("https://www.example.org/a"));
        assert!(!filter.matches("http://www.example.com/a"));
        assert!(!filter.matches("https://www.example.com/b"));
        assert!(filter.matches("https://user@www.example.com/a/c"));
        assert!(!filter.matches("https://img.example.com@evil.org/a"));
    }

    #[test]
    fn test_wildcard_host_exact() {
        let filter = KeyFilter::match_key("https://*.example.com/a").unwrap();
        assert!(filter.matches("https://www.example.com/a"));
        assert!(!filter.matches("https://www.example.com/a/b"));
    }

    #[test]
    fn test_plain_filters() {
        assert!(matches!(KeyFilter::match_key("https://e.com/a").unwrap(), KeyFilter::Exact(_)));
        assert!(matches!(KeyFilter::match_prefix("https://e.com/a").unwrap(), KeyFilter::Prefix(_)));
        assert!(KeyFilter::prefix("https://e.com/").matches("https://e.com/x"));
        assert!(!KeyFilter::prefix("https://e.com/").matches("https://f.com/x"));
    }

    #[test]
    fn test_glob_escape() {
        assert_eq!(glob_escape("a*b?c[d"), "a[*]b[?]c[[]d");
        assert_eq!(glob_escape("https://e.com/"), "https://e.com/");
    }
}
