//! Configuration Module
//!
//! Handles loading table defaults from environment variables.

use std::env;
use std::time::Duration;

/// Cache table configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Life span in seconds for entries inserted without an explicit one
    /// (data loader results and `CacheTable::add`). 0 = never expire.
    pub default_life_span: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_DEFAULT_LIFE_SPAN` - Default life span in seconds (default: 0)
    pub fn from_env() -> Self {
        Self {
            default_life_span: env::var("CACHE_DEFAULT_LIFE_SPAN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    /// Default life span as a `Duration`.
    pub fn life_span(&self) -> Duration {
        Duration::from_secs(self.default_life_span)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_life_span: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.default_life_span, 0);
        assert_eq!(config.life_span(), Duration::ZERO);
    }

    #[test]
    fn test_config_from_env() {
        env::remove_var("CACHE_DEFAULT_LIFE_SPAN");
        assert_eq!(Config::from_env().default_life_span, 0);

        env::set_var("CACHE_DEFAULT_LIFE_SPAN", "45");
        let config = Config::from_env();
        assert_eq!(config.life_span(), Duration::from_secs(45));

        env::set_var("CACHE_DEFAULT_LIFE_SPAN", "not-a-number");
        assert_eq!(Config::from_env().default_life_span, 0);

        env::remove_var("CACHE_DEFAULT_LIFE_SPAN");
    }
}
