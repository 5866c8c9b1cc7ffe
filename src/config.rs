//! Configuration for the wallet engine.
//!
//! Loads optional `sable.toml` from the wallet data directory. Host-supplied
//! overrides take precedence over config file values; if no config file
//! exists, defaults are used.

use serde::Deserialize;
use std::path::Path;

/// Engine configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Gap-limit window applied to every account.
    pub lookahead: u32,
    /// Ceiling on derivation depth; crossing it surfaces
    /// `LookaheadExhausted` and stalls discovery.
    pub lookahead_ceiling: u32,
    /// Recompute every touched scope after each event and compare against
    /// the incremental tuple. Meant for tests and debugging; production
    /// hosts schedule `recalculate_balances` instead.
    pub verify_balances: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            lookahead: crate::constants::DEFAULT_LOOKAHEAD,
            lookahead_ceiling: crate::constants::DEFAULT_LOOKAHEAD_CEILING,
            verify_balances: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `sable.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("sable.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Configuration used by the test suites: small window, every event
    /// cross-checked against the ground-truth recomputation.
    pub fn strict(lookahead: u32) -> Self {
        EngineConfig {
            lookahead,
            verify_balances: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.lookahead, crate::constants::DEFAULT_LOOKAHEAD);
        assert!(!config.verify_balances);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
lookahead = 20
verify_balances = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.lookahead, 20);
        assert!(config.verify_balances);
        assert_eq!(
            config.lookahead_ceiling,
            crate::constants::DEFAULT_LOOKAHEAD_CEILING
        );
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path());
        assert_eq!(config.lookahead, crate::constants::DEFAULT_LOOKAHEAD);
    }
}
