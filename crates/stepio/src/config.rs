//! Service configuration
//!
//! Compiled defaults with runtime environment overrides.
//!
//! ```rust,ignore
//! use stepio::config::{BackendKind, ServiceConfig};
//!
//! // Defaults with env overrides
//! let config = ServiceConfig::from_env();
//!
//! // Or pin a backend programmatically
//! let config = ServiceConfig::new().backend(BackendKind::Poll);
//! ```

use std::fmt;
use std::str::FromStr;

use stepio_core::env::{env_get, env_get_str};
use stepio_core::kwarn;

/// Compiled defaults.
pub mod defaults {
    use super::BackendKind;

    pub const BACKEND: BackendKind = BackendKind::Auto;
    /// io_uring submission queue size. Power of two.
    pub const RING_ENTRIES: u32 = 256;
}

/// Which OS completion facility the service drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// io_uring, falling back to poll if the ring cannot be created.
    Auto,
    Uring,
    Poll,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "uring" | "io_uring" | "iouring" => Ok(Self::Uring),
            "poll" => Ok(Self::Poll),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Uring => "uring",
            Self::Poll => "poll",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub backend: BackendKind,
    pub ring_entries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServiceConfig {
    /// Compiled defaults, ignoring the environment.
    pub fn new() -> Self {
        Self {
            backend: defaults::BACKEND,
            ring_entries: defaults::RING_ENTRIES,
        }
    }

    /// Compiled defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `STEPIO_BACKEND` - auto | uring | poll
    /// - `STEPIO_RING_ENTRIES` - io_uring SQ entries
    pub fn from_env() -> Self {
        let raw = env_get_str("STEPIO_BACKEND", "auto");
        let backend = match raw.parse() {
            Ok(kind) => kind,
            Err(e) => {
                kwarn!("STEPIO_BACKEND: {}, using {}", e, defaults::BACKEND);
                defaults::BACKEND
            }
        };
        Self {
            backend,
            ring_entries: env_get("STEPIO_RING_ENTRIES", defaults::RING_ENTRIES),
        }
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = kind;
        self
    }

    pub fn ring_entries(mut self, n: u32) -> Self {
        self.ring_entries = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend() {
        assert_eq!("uring".parse::<BackendKind>(), Ok(BackendKind::Uring));
        assert_eq!(" Poll ".parse::<BackendKind>(), Ok(BackendKind::Poll));
        assert_eq!("".parse::<BackendKind>(), Ok(BackendKind::Auto));
        assert!("epoll".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_builder() {
        let cfg = ServiceConfig::new().backend(BackendKind::Poll).ring_entries(64);
        assert_eq!(cfg.backend, BackendKind::Poll);
        assert_eq!(cfg.ring_entries, 64);
    }

    #[test]
    fn test_defaults() {
        let cfg = ServiceConfig::new();
        assert_eq!(cfg.backend, BackendKind::Auto);
        assert_eq!(cfg.ring_entries, defaults::RING_ENTRIES);
    }
}
