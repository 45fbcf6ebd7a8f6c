//! Environment variable utilities
//!
//! Small parsing helpers used by the runtime configuration. Unparsable
//! values fall back to the provided default.

use std::str::FromStr;

/// Read and parse an environment variable, falling back to `default`.
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Read a boolean environment variable ("1", "true", "yes", "on").
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Check whether an environment variable is set at all.
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_when_unset() {
        assert_eq!(env_get("STRAND_TEST_UNSET_KEY", 7usize), 7);
        assert!(!env_get_bool("STRAND_TEST_UNSET_KEY", false));
        assert!(!env_is_set("STRAND_TEST_UNSET_KEY"));
    }

    #[test]
    fn test_parse_and_fallback() {
        std::env::set_var("STRAND_TEST_NUM", "42");
        assert_eq!(env_get("STRAND_TEST_NUM", 0usize), 42);

        std::env::set_var("STRAND_TEST_NUM", "not-a-number");
        assert_eq!(env_get("STRAND_TEST_NUM", 5usize), 5);

        std::env::set_var("STRAND_TEST_BOOL", "yes");
        assert!(env_get_bool("STRAND_TEST_BOOL", false));
        std::env::remove_var("STRAND_TEST_NUM");
        std::env::remove_var("STRAND_TEST_BOOL");
    }
}
