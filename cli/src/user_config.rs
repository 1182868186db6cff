//! CLI user properties, a flat JSON map kept outside any feature repo.

use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const FEAST_CONFIG_ENV_VAR: &str = "FEAST_CONFIG";

#[derive(Debug, Default, PartialEq)]
pub struct UserConfig {
    path: PathBuf,
    properties: BTreeMap<String, String>,
}

pub fn default_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(FEAST_CONFIG_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }
    let home = std::env::var("HOME").map_err(|_| {
        anyhow!(
            "Neither {} nor HOME is set, can't locate the Feast config",
            FEAST_CONFIG_ENV_VAR
        )
    })?;
    Ok(Path::new(&home).join(".feast").join("config.json"))
}

impl UserConfig {
    /// Reads the properties at `path`; a missing file is an empty config.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let properties = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Invalid Feast config at {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        Ok(Self { path, properties })
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn set(&mut self, prop: &str, value: &str) -> Result<()> {
        let prop = prop.trim();
        if prop.is_empty() {
            return Err(anyhow!("Property name must not be empty"));
        }
        self.properties
            .insert(prop.to_string(), value.trim().to_string());
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&self.properties)?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}
