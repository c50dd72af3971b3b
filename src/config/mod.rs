mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("namespace not found: {0}")]
    NotFound(String),
}

/// Load the proxy configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ProxyConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: ProxyConfig = toml::from_str(&content)?;
    Ok(config)
}

/// File-backed namespace store: one `<name>.toml` per namespace under a
/// configured directory.
pub struct FileConfigStore {
    root: PathBuf,
}

impl FileConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Names of all namespaces present in the store
    pub fn list_namespaces(&self) -> Result<Vec<String>, ConfigError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load one namespace definition by name
    pub fn load_namespace(&self, name: &str) -> Result<NamespaceConfig, ConfigError> {
        let path = self.root.join(format!("{}.toml", name));
        if !path.exists() {
            return Err(ConfigError::NotFound(name.to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: NamespaceConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load every namespace in the store, skipping ones that fail to parse
    pub fn load_all(&self) -> Result<Vec<NamespaceConfig>, ConfigError> {
        let mut configs = Vec::new();
        for name in self.list_namespaces()? {
            match self.load_namespace(&name) {
                Ok(config) => configs.push(config),
                Err(e) => {
                    warn!(namespace = %name, error = %e, "failed to load namespace config");
                }
            }
        }
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_lists_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ns1.toml"),
            r#"
            name = "ns1"
            [[users]]
            username = "u"
            password = "p"
            "#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = FileConfigStore::new(dir.path());
        assert_eq!(store.list_namespaces().unwrap(), vec!["ns1"]);

        let ns = store.load_namespace("ns1").unwrap();
        assert_eq!(ns.name, "ns1");
        assert!(matches!(
            store.load_namespace("missing"),
            Err(ConfigError::NotFound(_))
        ));
    }
}
