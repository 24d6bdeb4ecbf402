// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key namespacing and sanitization.
//!
//! Logical keys are validated, sanitized to `[A-Za-z0-9:_\-.]` (anything else
//! becomes `_`) and prefixed with `<namespace>:`. Callers only ever see the
//! logical form.

use super::CacheError;

/// Longest logical key accepted.
pub const MAX_KEY_LEN: usize = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    #[must_use]
    pub fn new(namespace: &str) -> Self {
        let clean: String = namespace.chars().map(|c| if is_safe(c) { c } else { '_' }).collect();
        Self {
            prefix: format!("{}:", clean),
        }
    }

    /// Physical key for a logical key.
    pub fn key(&self, logical: &str) -> Result<String, CacheError> {
        validate(logical)?;
        let mut out = String::with_capacity(self.prefix.len() + logical.len());
        out.push_str(&self.prefix);
        out.extend(logical.chars().map(|c| if is_safe(c) { c } else { '_' }));
        Ok(out)
    }

    /// Physical glob for a logical glob. Glob metacharacters are kept.
    pub fn pattern(&self, logical: &str) -> Result<String, CacheError> {
        validate(logical)?;
        let mut out = String::with_capacity(self.prefix.len() + logical.len());
        out.push_str(&self.prefix);
        out.extend(
            logical
                .chars()
                .map(|c| if is_safe(c) || matches!(c, '*' | '?' | '[' | ']' | '^' | '\\') { c } else { '_' }),
        );
        Ok(out)
    }

    /// Logical form of a physical key, if it belongs to this namespace.
    #[must_use]
    pub fn logical<'a>(&self, physical: &'a str) -> Option<&'a str> {
        physical.strip_prefix(self.prefix.as_str())
    }

    /// Glob matching every key in this namespace.
    #[must_use]
    pub fn all(&self) -> String {
        format!("{}*", self.prefix)
    }
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.')
}

fn validate(logical: &str) -> Result<(), CacheError> {
    if logical.trim().is_empty() {
        return Err(CacheError::InvalidKey("key must not be empty".into()));
    }
    if logical.chars().count() > MAX_KEY_LEN {
        return Err(CacheError::InvalidKey(format!("key exceeds {} characters", MAX_KEY_LEN)));
    }
    if logical.chars().any(char::is_control) {
        return Err(CacheError::InvalidKey("key contains control characters".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_sanitize() {
        let ks = KeySpace::new("app");
        assert_eq!(ks.key("user:1").unwrap(), "app:user:1");
        assert_eq!(ks.key("task list/42").unwrap(), "app:task_list_42");
        assert_eq!(ks.key("é").unwrap(), "app:_");
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let ks = KeySpace::new("app");
        assert!(matches!(ks.key(""), Err(CacheError::InvalidKey(_))));
        assert!(matches!(ks.key("   "), Err(CacheError::InvalidKey(_))));
        assert!(matches!(ks.key("a\nb"), Err(CacheError::InvalidKey(_))));
        assert!(matches!(ks.key(&"x".repeat(MAX_KEY_LEN + 1)), Err(CacheError::InvalidKey(_))));
        assert!(ks.key(&"x".repeat(MAX_KEY_LEN)).is_ok());
    }

    #[test]
    fn test_pattern_keeps_glob_syntax() {
        let ks = KeySpace::new("app");
        assert_eq!(ks.pattern("task:list:*").unwrap(), "app:task:list:*");
        assert_eq!(ks.pattern("user:[0-9]?").unwrap(), "app:user:[0-9]?");
        assert_eq!(ks.pattern("a b*").unwrap(), "app:a_b*");
        assert_eq!(ks.all(), "app:*");
    }

    #[test]
    fn test_logical_round_trip() {
        let ks = KeySpace::new("app");
        assert_eq!(ks.logical("app:user:1"), Some("user:1"));
        assert_eq!(ks.logical("other:user:1"), None);
    }
}
