//! Runtime configuration
//!
//! Loaded from an optional TOML file; every key has a default, and the data
//! directory and database path can be overridden from the environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

pub const ENV_DATA_DIR: &str = "PACKAGER_DATA_DIR";
pub const ENV_DATABASE: &str = "PACKAGER_DATABASE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of source extracts, packages and working directories
    pub data_dir: PathBuf,
    /// SQLite database file; relative paths are resolved against `data_dir`
    pub database: PathBuf,
    pub enabled_providers: Vec<String>,
    pub enabled_engines: Vec<String>,
    pub osmium: PathBuf,
    pub docker: PathBuf,
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub lease_ttl_secs: u64,
    pub lock_timeout_secs: u64,
    /// Engine name to container image
    pub images: BTreeMap<String, String>,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub from: String,
    /// When set, notifications are spooled here instead of only logged
    pub spool_dir: Option<PathBuf>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            from: "routing-packager@localhost".to_string(),
            spool_dir: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            database: PathBuf::from("packager.sqlite"),
            enabled_providers: vec!["osm".to_string()],
            enabled_engines: vec!["valhalla".to_string(), "osrm".to_string()],
            osmium: PathBuf::from("osmium"),
            docker: PathBuf::from("docker"),
            workers: 1,
            poll_interval_ms: 1000,
            lease_ttl_secs: 6 * 3600,
            lock_timeout_secs: 60,
            images: BTreeMap::from([
                ("valhalla".to_string(), "gisops/valhalla:latest".to_string()),
                ("osrm".to_string(), "osrm/osrm-backend:latest".to_string()),
            ]),
            notifications: NotificationConfig::default(),
        }
    }
}

/// Providers a deployment may enable
pub const KNOWN_PROVIDERS: [&str; 3] = ["osm", "tomtom", "here"];

impl Config {
    /// Load `path` if given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Config> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(db) = var(ENV_DATABASE).filter(|v| !v.is_empty()) {
            self.database = PathBuf::from(db);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(unknown) = self
            .enabled_providers
            .iter()
            .find(|p| !KNOWN_PROVIDERS.contains(&p.as_str()))
        {
            return Err(Error::Config(format!(
                "unknown provider '{unknown}', expected one of {}",
                KNOWN_PROVIDERS.join(", ")
            )));
        }
        if let Some(engine) = self
            .enabled_engines
            .iter()
            .find(|e| !self.images.contains_key(*e))
        {
            return Err(Error::Config(format!("no image configured for engine '{engine}'")));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        if self.database.is_absolute() {
            self.database.clone()
        } else {
            self.data_dir.join(&self.database)
        }
    }

    pub fn image(&self, engine: &str) -> Option<&str> {
        self.images.get(engine).map(String::as_str)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.image("valhalla"), Some("gisops/valhalla:latest"));
        assert_eq!(config.database_path(), Path::new("data/packager.sqlite"));
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            data_dir = "/srv/packager"
            enabled_providers = ["osm", "tomtom"]
            workers = 4

            [images]
            valhalla = "gisops/valhalla:3.4"
            osrm = "osrm/osrm-backend:v5.27"

            [notifications]
            spool_dir = "/var/spool/packager"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, Path::new("/srv/packager"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.image("valhalla"), Some("gisops/valhalla:3.4"));
        assert_eq!(config.notifications.from, "routing-packager@localhost");
        assert_eq!(
            config.notifications.spool_dir.as_deref(),
            Some(Path::new("/var/spool/packager"))
        );
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            (ENV_DATA_DIR, "/mnt/data".to_string()),
            (ENV_DATABASE, "/var/lib/packager.db".to_string()),
        ]);
        let mut config = Config::default();
        config.apply_env(|key| env.get(key).cloned());

        assert_eq!(config.data_dir, Path::new("/mnt/data"));
        assert_eq!(config.database_path(), Path::new("/var/lib/packager.db"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.enabled_providers.push("openmaps".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.images.remove("osrm");
        assert!(config.validate().is_err());

        assert!(Config::from_toml("workers = \"many\"").is_err());
    }
}
