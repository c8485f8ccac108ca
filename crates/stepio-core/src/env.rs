//! Environment variable utilities
//!
//! ```ignore
//! use stepio_core::env::{env_get, env_get_str};
//!
//! let entries: u32 = env_get("STEPIO_RING_ENTRIES", 256);
//! let backend = env_get_str("STEPIO_BACKEND", "auto");
//! ```

use std::str::FromStr;

/// Variable parsed as `T`, or `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// "1", "true", "yes", "on" (any case) are true; other set values are false.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
