// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Instance lifecycle configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file from the `DYN_INSTANCES_CONFIG_PATH` environment variable
//! 3. Environment variables (`DYN_INSTANCES_GC_*`, `DYN_INSTANCES_COLLECTIVE_*`)

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

const CONFIG_PATH_ENV: &str = "DYN_INSTANCES_CONFIG_PATH";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Garbage collection settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GcConfig {
    /// Number of recorded instance uses between compactions of the
    /// outstanding-use set.
    #[validate(range(min = 1))]
    pub epoch_size: usize,

    /// Track valid references per source and check each source for underflow.
    pub debug_references: bool,

    /// Verify non-owner valid-reference resurrections with the owner node.
    pub verify_remote_acquires: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            epoch_size: 64,
            debug_references: false,
            verify_remote_acquires: false,
        }
    }
}

/// Chain topology settings for collective instances.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CollectiveConfig {
    /// Number of right children per chain member.
    #[validate(range(min = 1, max = 64))]
    pub radix: usize,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self { radix: 2 }
    }
}

/// Top-level configuration for an instance node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct InstancesConfig {
    #[validate(nested)]
    #[serde(default)]
    pub gc: GcConfig,

    #[validate(nested)]
    #[serde(default)]
    pub collective: CollectiveConfig,
}

impl InstancesConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(InstancesConfig::default()))
            .merge(Toml::file(&config_path))
            // DYN_INSTANCES_GC_EPOCH_SIZE, DYN_INSTANCES_GC_DEBUG_REFERENCES, ...
            .merge(
                Env::prefixed("DYN_INSTANCES_GC_")
                    .map(|k| format!("gc.{}", k.as_str().to_lowercase()).into()),
            )
            // DYN_INSTANCES_COLLECTIVE_RADIX
            .merge(
                Env::prefixed("DYN_INSTANCES_COLLECTIVE_")
                    .map(|k| format!("collective.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }
}

impl Provider for InstancesConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("InstancesConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_VARS: [&str; 5] = [
        CONFIG_PATH_ENV,
        "DYN_INSTANCES_GC_EPOCH_SIZE",
        "DYN_INSTANCES_GC_DEBUG_REFERENCES",
        "DYN_INSTANCES_GC_VERIFY_REMOTE_ACQUIRES",
        "DYN_INSTANCES_COLLECTIVE_RADIX",
    ];

    #[test]
    fn test_defaults() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let config = InstancesConfig::from_env().unwrap();
            assert_eq!(config.gc.epoch_size, 64);
            assert!(!config.gc.debug_references);
            assert!(!config.gc.verify_remote_acquires);
            assert_eq!(config.collective.radix, 2);
        });
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            vec![
                ("DYN_INSTANCES_GC_EPOCH_SIZE", Some("8")),
                ("DYN_INSTANCES_GC_DEBUG_REFERENCES", Some("true")),
                ("DYN_INSTANCES_COLLECTIVE_RADIX", Some("4")),
            ],
            || {
                let config = InstancesConfig::from_env().unwrap();
                assert_eq!(config.gc.epoch_size, 8);
                assert!(config.gc.debug_references);
                assert_eq!(config.collective.radix, 4);
            },
        );
    }

    #[test]
    fn test_programmatic_override() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let figment = InstancesConfig::figment_with(("gc.verify_remote_acquires", true));
            let config = InstancesConfig::extract_from(figment).unwrap();
            assert!(config.gc.verify_remote_acquires);
        });
    }

    #[test]
    fn test_zero_epoch_rejected() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let figment = InstancesConfig::figment_with(("gc.epoch_size", 0usize));
            let err = InstancesConfig::extract_from(figment).unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)));
        });
    }

    #[test]
    fn test_config_as_provider() {
        let original = InstancesConfig {
            gc: GcConfig {
                epoch_size: 3,
                ..Default::default()
            },
            collective: CollectiveConfig { radix: 1 },
        };
        let config = InstancesConfig::extract_from(original).unwrap();
        assert_eq!(config.gc.epoch_size, 3);
        assert_eq!(config.collective.radix, 1);
    }

    #[test]
    fn test_json_roundtrip_keeps_sections() {
        let json = serde_json::json!({ "gc": { "epoch_size": 16, "debug_references": true, "verify_remote_acquires": false } });
        let config: InstancesConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.gc.epoch_size, 16);
        assert!(config.gc.debug_references);
        // Missing section falls back to its default
        assert_eq!(config.collective.radix, 2);

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["collective"]["radix"], 2);
    }
}
