//! Environment variable parsing helpers used by the cmd tools.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean. Accepts "1", "true",
/// "yes", "on" (case-insensitive) as true.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get an environment variable as an optional value.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_when_unset() {
        assert_eq!(env_get("FLOWGEN_TEST_UNSET_VAR", 42usize), 42);
        assert!(env_get_bool("FLOWGEN_TEST_UNSET_VAR", true));
        assert_eq!(env_get_opt::<u16>("FLOWGEN_TEST_UNSET_VAR"), None);
    }
}
