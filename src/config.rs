use color_eyre::{eyre::eyre, Result};
use incstore::{Schema, StoreConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  pub store: StoreConfig,
  pub schema: Schema,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL every entity path is resolved against
  pub url: url::Url,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

impl RemoteConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/incstore/cache.db)
  pub path: Option<PathBuf>,
  /// Keep rows in memory only
  #[serde(default)]
  pub in_memory: bool,
}

impl Config {
  /// Read the config from `explicit_path`, or from the first of
  /// `./incstore.yaml` and `$XDG_CONFIG_HOME/incstore/config.yaml` that exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit_path {
      if !path.exists() {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      return Self::load_from_path(path);
    }

    let path = Self::candidates()
      .into_iter()
      .find(|p| p.exists())
      .ok_or_else(|| {
        eyre!(
          "No configuration file found. Create one at ~/.config/incstore/config.yaml\n\
           See incstore.example.yaml for the format."
        )
      })?;
    Self::load_from_path(&path)
  }

  fn candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("incstore.yaml")];
    if let Some(dir) = dirs::config_dir() {
      paths.push(dir.join("incstore").join("config.yaml"));
    }
    paths
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config
      .schema
      .validate()
      .map_err(|e| eyre!("invalid schema: {}", e))?;
    Ok(config)
  }

  /// Bearer token for the remote service, from INCSTORE_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("INCSTORE_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use incstore::{Cardinality, Freshness};

  const EXAMPLE: &str = include_str!("../incstore.example.yaml");

  #[test]
  fn test_example_config_parses() {
    let config = Config::parse(EXAMPLE).unwrap();
    assert_eq!(config.remote.url.as_str(), "https://api.example.com/v1/");
    assert_eq!(config.remote.timeout(), Duration::from_secs(15));
    assert_eq!(config.store.fetch.freshness, Freshness::StaleAfter { seconds: 300 });

    let user = config.schema.entity("user").unwrap();
    assert!(user.is_attribute("email"));
    assert_eq!(user.relationships["posts"].cardinality, Cardinality::ToMany);
    assert_eq!(config.schema.entity("post").unwrap().root_key.as_deref(), Some("post"));
  }

  #[test]
  fn test_schema_with_dangling_target_is_rejected() {
    let yaml = "remote:\n  url: http://localhost/\nstore:\n  fetch:\n    freshness:\n      policy: non_empty\nschema:\n  user:\n    relationships:\n      team:\n        target: team\n        cardinality: to_one\n";
    assert!(Config::parse(yaml).is_err());
  }
}
