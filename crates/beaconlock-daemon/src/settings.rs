//! Process-level settings read from the environment.
//!
//! These decide where configuration lives and how logging is set up, so they
//! are read before [`beaconlock_core::Config`] is loaded.

use std::path::PathBuf;

/// Environment variable names.
pub mod env_vars {
    /// Path to the TOML configuration file.
    pub const CONFIG: &str = "BEACONLOCK_CONFIG";
    /// `production` selects file + journald logging.
    pub const ENV: &str = "BEACONLOCK_ENV";
    /// Log filter used when `RUST_LOG` is unset.
    pub const LOG_LEVEL: &str = "BEACONLOCK_LOG_LEVEL";
}

/// Default values.
pub mod defaults {
    /// Log filter.
    pub const LOG_LEVEL: &str = "info";
}

/// Settings for one daemon process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Explicit configuration path; `None` uses the platform default.
    pub config_path: Option<PathBuf>,
    /// Production logging.
    pub production: bool,
    /// Fallback log filter.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: None,
            production: false,
            log_level: defaults::LOG_LEVEL.to_string(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            config_path: non_empty(env_vars::CONFIG).map(PathBuf::from),
            production: non_empty(env_vars::ENV)
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("production")),
            log_level: non_empty(env_vars::LOG_LEVEL)
                .unwrap_or_else(|| defaults::LOG_LEVEL.to_string()),
        }
    }
}
