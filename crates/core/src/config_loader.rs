use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "MDP_";

pub struct ConfigLoader;

impl ConfigLoader {
    fn base() -> Figment {
        Figment::new().merge(Serialized::defaults(AppConfig::default()))
    }

    /// Loads configuration by layering defaults, TOML, environment variables and JSON.
    ///
    /// Environment variables use the `MDP_` prefix and `__` for nesting,
    /// e.g. `MDP_ROUTER__PROBE_INTERVAL_MS=5000`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load() -> Result<AppConfig> {
        Self::base()
            .merge(Toml::file("config/Config.toml"))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .join(Json::file("config/Config.json"))
            .extract()
            .context("failed to load configuration")
    }

    /// Loads configuration with a profile overlay (`config/Config.{profile}.toml`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        Self::base()
            .merge(Toml::file("config/Config.toml"))
            .merge(Toml::file(format!("config/Config.{profile}.toml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .join(Json::file("config/Config.json"))
            .extract()
            .with_context(|| format!("failed to load configuration for profile {profile}"))
    }

    /// Loads configuration from an explicit TOML file plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        anyhow::ensure!(path.exists(), "config file {} does not exist", path.display());
        Self::base()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))
    }
}
