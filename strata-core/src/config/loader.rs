//! # Configuration Loading
//!
//! Builds a [`StrataConfig`] from defaults, an optional TOML file and
//! `STRATA_*` environment variables, in that order of precedence.

use crate::{
    config::{schema::StrataConfig, validator::ConfigValidator},
    Error, Result,
};
use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// File names probed in every search path.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["strata.toml", "config.toml"];

/// Separator between nesting levels in environment variable names.
const ENV_NESTING: &str = "__";

/// Configuration loader with support for multiple sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    explicit_file: Option<PathBuf>,
    env_prefix: String,
    env_overrides: Option<BTreeMap<String, String>>,
}

impl ConfigLoader {
    /// Create a loader with the standard search paths and `STRATA` prefix.
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("."), PathBuf::from("./config")];
        if let Some(dir) = dirs::config_dir() {
            search_paths.push(dir.join("strata"));
        }
        Self {
            search_paths,
            explicit_file: None,
            env_prefix: "STRATA".to_string(),
            env_overrides: None,
        }
    }

    /// Add a search path for configuration files
    #[must_use]
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Use exactly this file instead of searching; it must exist.
    #[must_use]
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.explicit_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix
    #[must_use]
    pub fn with_env_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.as_ref().to_string();
        self
    }

    /// Read overrides from this map instead of the process environment.
    #[must_use]
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_overrides = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Load configuration from all available sources
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if a file cannot be read or parsed,
    /// or the merged result fails validation.
    pub fn load(&self) -> Result<StrataConfig> {
        info!("Loading configuration");

        let mut config_value = toml::Value::try_from(StrataConfig::default()).map_err(|e| {
            Error::Configuration { message: format!("Failed to serialize default config: {e}") }
        })?;
        debug!("Applied default configuration");

        if let Some(config_path) = self.find_config_file()? {
            let file_config = Self::load_config_file(&config_path)?;
            merge_config(&mut config_value, file_config);
            info!("Loaded configuration file: {}", config_path.display());
        } else {
            debug!("No configuration file found in search paths");
        }

        for (key, value) in self.collect_env_vars() {
            let parts: Vec<&str> = key.split('.').collect();
            set_nested_value(&mut config_value, &parts, &value);
        }

        let config: StrataConfig = config_value.try_into().map_err(|e| Error::Configuration {
            message: format!("Failed to deserialize config: {e}"),
        })?;

        ConfigValidator::validate(&config)?;
        info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] on I/O, parse or validation failure.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<StrataConfig> {
        let path = path.as_ref();
        info!("Loading configuration from file: {}", path.display());

        let mut config_value = toml::Value::try_from(StrataConfig::default()).map_err(|e| {
            Error::Configuration { message: format!("Failed to serialize default config: {e}") }
        })?;
        merge_config(&mut config_value, Self::load_config_file(path)?);

        let config: StrataConfig = config_value.try_into().map_err(|e| Error::Configuration {
            message: format!("Failed to parse config file {}: {e}", path.display()),
        })?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] on serialization or I/O failure.
    pub fn save_to_file<P: AsRef<Path>>(&self, config: &StrataConfig, path: P) -> Result<()> {
        let toml_string = toml::to_string_pretty(config).map_err(|e| Error::Configuration {
            message: format!("Failed to serialize config: {e}"),
        })?;

        std::fs::write(path.as_ref(), toml_string).map_err(|e| Error::Configuration {
            message: format!("Failed to write config to {}: {e}", path.as_ref().display()),
        })?;

        info!("Configuration saved to: {}", path.as_ref().display());
        Ok(())
    }

    /// Get the effective search paths being used
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Get the environment prefix being used
    #[must_use]
    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    fn find_config_file(&self) -> Result<Option<PathBuf>> {
        if let Some(file) = &self.explicit_file {
            if !file.exists() {
                return Err(Error::Configuration {
                    message: format!("Config file {} does not exist", file.display()),
                });
            }
            return Ok(Some(file.clone()));
        }

        for search_path in &self.search_paths {
            for config_name in CONFIG_FILE_NAMES {
                let config_path = search_path.join(config_name);
                if config_path.is_file() {
                    debug!("Found config file: {}", config_path.display());
                    return Ok(Some(config_path));
                }
            }
        }
        Ok(None)
    }

    fn load_config_file(path: &Path) -> Result<toml::Value> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Configuration {
            message: format!("Failed to read config file {}: {e}", path.display()),
        })?;

        content.parse::<toml::Value>().map_err(|e| Error::Configuration {
            message: format!("Failed to parse config file {}: {e}", path.display()),
        })
    }

    /// `STRATA_SERVER__MAX_PAYLOAD=2048` becomes `server.max_payload = 2048`.
    fn collect_env_vars(&self) -> BTreeMap<String, String> {
        let prefix = format!("{}_", self.env_prefix);
        let source: Box<dyn Iterator<Item = (String, String)>> = match &self.env_overrides {
            Some(vars) => Box::new(vars.clone().into_iter()),
            None => Box::new(env::vars()),
        };

        let vars: BTreeMap<String, String> = source
            .filter_map(|(key, value)| {
                let rest = key.strip_prefix(&prefix)?;
                if !rest.contains(ENV_NESTING) {
                    return None;
                }
                Some((rest.to_lowercase().replace(ENV_NESTING, "."), value))
            })
            .collect();

        debug!("Collected {} environment overrides", vars.len());
        vars
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursively overlay `override_value` onto `base`.
fn merge_config(base: &mut toml::Value, override_value: toml::Value) {
    match (base, override_value) {
        (toml::Value::Table(base_table), toml::Value::Table(override_table)) => {
            for (key, value) in override_table {
                match base_table.get_mut(&key) {
                    Some(existing) if existing.is_table() && value.is_table() => {
                        merge_config(existing, value);
                    },
                    _ => {
                        base_table.insert(key, value);
                    },
                }
            }
        },
        (base, value) => *base = value,
    }
}

fn set_nested_value(config: &mut toml::Value, parts: &[&str], value: &str) {
    let toml::Value::Table(table) = config else { return };
    match parts {
        [] => {},
        [last] => {
            table.insert((*last).to_string(), parse_env_value(value));
        },
        [head, rest @ ..] => {
            let entry = table
                .entry((*head).to_string())
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
            set_nested_value(entry, rest, value);
        },
    }
}

/// Parse environment variable value to the most specific TOML type.
fn parse_env_value(value: &str) -> toml::Value {
    if let Ok(b) = value.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = value.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use std::time::Duration;
    use tempfile::TempDir;

    fn isolated() -> ConfigLoader {
        let empty = TempDir::new().unwrap();
        ConfigLoader {
            search_paths: vec![empty.path().to_path_buf()],
            explicit_file: None,
            env_prefix: "STRATA".to_string(),
            env_overrides: Some(BTreeMap::new()),
        }
    }

    #[test]
    fn test_config_loader_creation() {
        let loader = ConfigLoader::new();
        assert!(!loader.search_paths().is_empty());
        assert_eq!(loader.env_prefix(), "STRATA");
    }

    #[test]
    fn test_load_defaults_without_sources() {
        let config = isolated().load().unwrap();
        assert_eq!(config, StrataConfig::default());
    }

    #[test]
    fn test_file_then_env_precedence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("strata.toml"),
            "[server]\nport = 5000\nserver_name = \"from-file\"\n\n[logging]\nformat = \"json\"\n",
        )
        .unwrap();

        let config = isolated()
            .with_path(dir.path())
            .with_env_vars([
                ("STRATA_SERVER__PORT", "6000"),
                ("STRATA_JETSTREAM__DEFAULT_PULL_WAIT", "1500"),
                ("OTHER_SERVER__PORT", "1"),
            ])
            .load()
            .unwrap();

        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.server_name, "from-file");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.jetstream.default_pull_wait, Duration::from_millis(1500));
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let result = isolated().with_file("/nonexistent/strata.toml").load();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server]\nmax_payload = 0\n").unwrap();
        assert!(isolated().load_from_file(&path).is_err());
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("saved.toml");
        let loader = isolated();

        let mut config = StrataConfig::default();
        config.jetstream.max_streams = 7;
        loader.save_to_file(&config, &path).unwrap();

        assert_eq!(loader.load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_merge_config() {
        let mut base: toml::Value = toml::from_str("[a]\nx = 1\ny = 2\n").unwrap();
        let over: toml::Value = toml::from_str("[a]\ny = 3\n[b]\nz = 4\n").unwrap();
        merge_config(&mut base, over);
        assert_eq!(base["a"]["x"].as_integer(), Some(1));
        assert_eq!(base["a"]["y"].as_integer(), Some(3));
        assert_eq!(base["b"]["z"].as_integer(), Some(4));
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(parse_env_value("true"), toml::Value::Boolean(true));
        assert_eq!(parse_env_value("42"), toml::Value::Integer(42));
        assert_eq!(parse_env_value("hello"), toml::Value::String("hello".to_string()));
    }
}
