//! Engine configuration.
//!
//! Loads [`GemmConfig`] from a TOML file (`tilegemm.toml`) with environment
//! variable overrides via `TILEGEMM_*` prefixed variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::variant::TileShape;

/// Upper bound accepted for `max_tile_edge`.
pub const MAX_TILE_EDGE_LIMIT: usize = 16384;

/// Engine configuration loaded from TOML with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GemmConfig {
    /// Largest tile edge for buffer-resident operands. Must be a multiple
    /// of 8. Clamped to the device image limit at call time.
    /// Override: `TILEGEMM_MAX_TILE_EDGE`
    pub max_tile_edge: usize,

    /// Compute tile shape used when B is not a caller image.
    /// Override: `TILEGEMM_TILE_SHAPE`
    pub tile_shape: TileShape,

    /// Whether the inner-product layer takes the tiled route for M > 1.
    /// Override: `TILEGEMM_ENABLE_TILED_PATH`
    pub enable_tiled_path: bool,
}

impl Default for GemmConfig {
    fn default() -> Self {
        Self {
            max_tile_edge: 1024,
            tile_shape: TileShape::Image32x1,
            enable_tiled_path: true,
        }
    }
}

/// Errors that can occur when loading or validating a [`GemmConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride {
        key: String,
        value: String,
        reason: String,
    },
}

impl GemmConfig {
    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a TOML file, then apply environment
    /// variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string. Missing fields take their defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: GemmConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tile_edge < 8 {
            return Err(ConfigError::Validation(format!(
                "max_tile_edge must be >= 8, got {}",
                self.max_tile_edge
            )));
        }
        if self.max_tile_edge % 8 != 0 {
            return Err(ConfigError::Validation(format!(
                "max_tile_edge must be a multiple of 8, got {}",
                self.max_tile_edge
            )));
        }
        if self.max_tile_edge > MAX_TILE_EDGE_LIMIT {
            return Err(ConfigError::Validation(format!(
                "max_tile_edge must be <= {MAX_TILE_EDGE_LIMIT}, got {}",
                self.max_tile_edge
            )));
        }
        Ok(())
    }

    /// Apply `TILEGEMM_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("TILEGEMM_MAX_TILE_EDGE") {
            self.max_tile_edge = val.parse::<usize>().map_err(|e| ConfigError::EnvOverride {
                key: "TILEGEMM_MAX_TILE_EDGE".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Ok(val) = std::env::var("TILEGEMM_TILE_SHAPE") {
            self.tile_shape =
                val.parse::<TileShape>()
                    .map_err(|reason| ConfigError::EnvOverride {
                        key: "TILEGEMM_TILE_SHAPE".into(),
                        value: val.clone(),
                        reason,
                    })?;
        }

        if let Ok(val) = std::env::var("TILEGEMM_ENABLE_TILED_PATH") {
            self.enable_tiled_path = match val.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::EnvOverride {
                        key: "TILEGEMM_ENABLE_TILED_PATH".into(),
                        value: val,
                        reason: "expected a boolean".into(),
                    });
                }
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const ENV_KEYS: [&str; 3] = [
        "TILEGEMM_MAX_TILE_EDGE",
        "TILEGEMM_TILE_SHAPE",
        "TILEGEMM_ENABLE_TILED_PATH",
    ];

    fn cleared_env() -> Vec<(&'static str, Option<&'static str>)> {
        ENV_KEYS.iter().map(|k| (*k, None)).collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(GemmConfig::default().validate().is_ok());
    }

    #[test]
    #[serial(tilegemm_env)]
    fn test_default_toml_round_trips() {
        temp_env::with_vars(cleared_env(), || {
            let toml_str = GemmConfig::default_toml().unwrap();
            let cfg = GemmConfig::from_toml(&toml_str).unwrap();
            assert_eq!(cfg, GemmConfig::default());
        });
    }

    #[test]
    #[serial(tilegemm_env)]
    fn test_from_toml_partial_uses_defaults() {
        temp_env::with_vars(cleared_env(), || {
            let cfg = GemmConfig::from_toml("tile_shape = \"32x2\"\n").unwrap();
            assert_eq!(cfg.tile_shape, TileShape::Image32x2);
            assert_eq!(cfg.max_tile_edge, 1024);
            assert!(cfg.enable_tiled_path);
        });
    }

    #[test]
    #[serial(tilegemm_env)]
    fn test_load_from_file() {
        temp_env::with_vars(cleared_env(), || {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "max_tile_edge = 256").unwrap();
            writeln!(file, "enable_tiled_path = false").unwrap();
            let cfg = GemmConfig::load(file.path()).unwrap();
            assert_eq!(cfg.max_tile_edge, 256);
            assert!(!cfg.enable_tiled_path);
        });
    }

    #[test]
    fn test_validation_tile_edge() {
        let mut cfg = GemmConfig::default();
        cfg.max_tile_edge = 4;
        assert!(cfg.validate().unwrap_err().to_string().contains(">= 8"));

        cfg.max_tile_edge = 100;
        assert!(cfg.validate().unwrap_err().to_string().contains("multiple of 8"));

        cfg.max_tile_edge = MAX_TILE_EDGE_LIMIT + 8;
        assert!(cfg.validate().unwrap_err().to_string().contains("<= 16384"));
    }

    #[test]
    #[serial(tilegemm_env)]
    fn test_env_override_multiple_fields() {
        temp_env::with_vars(
            [
                ("TILEGEMM_MAX_TILE_EDGE", Some("64")),
                ("TILEGEMM_TILE_SHAPE", Some("32x2")),
                ("TILEGEMM_ENABLE_TILED_PATH", Some("off")),
            ],
            || {
                let cfg = GemmConfig::from_env().unwrap();
                assert_eq!(cfg.max_tile_edge, 64);
                assert_eq!(cfg.tile_shape, TileShape::Image32x2);
                assert!(!cfg.enable_tiled_path);
            },
        );
    }

    #[test]
    #[serial(tilegemm_env)]
    fn test_env_override_invalid_shape() {
        temp_env::with_vars(
            [
                ("TILEGEMM_MAX_TILE_EDGE", None::<&str>),
                ("TILEGEMM_TILE_SHAPE", Some("64x4")),
                ("TILEGEMM_ENABLE_TILED_PATH", None),
            ],
            || match GemmConfig::from_env().unwrap_err() {
                ConfigError::EnvOverride { key, .. } => assert_eq!(key, "TILEGEMM_TILE_SHAPE"),
                other => panic!("expected EnvOverride, got: {other}"),
            },
        );
    }

    #[test]
    #[serial(tilegemm_env)]
    fn test_env_override_fails_validation() {
        temp_env::with_vars(
            [
                ("TILEGEMM_MAX_TILE_EDGE", Some("12")),
                ("TILEGEMM_TILE_SHAPE", None::<&str>),
                ("TILEGEMM_ENABLE_TILED_PATH", None),
            ],
            || {
                let err = GemmConfig::from_env().unwrap_err();
                assert!(matches!(err, ConfigError::Validation(_)));
            },
        );
    }
}
