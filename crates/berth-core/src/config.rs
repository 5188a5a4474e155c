use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine tuning, read from `~/.config/berth/engine.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on machines brought up at the same time.
    pub max_parallelism: usize,
    pub build_timeout_secs: u64,
    /// Bound for create, start, stop, and remove calls.
    pub operation_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            build_timeout_secs: 1800,
            operation_timeout_secs: 120,
            probe_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Load from `~/.config/berth/engine.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load_default() -> Result<Self, EngineError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("cannot serialize engine config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_parallelism == 0 {
            return Err(EngineError::Config(
                "max_parallelism must be at least 1".to_owned(),
            ));
        }
        for (name, value) in [
            ("build_timeout_secs", self.build_timeout_secs),
            ("operation_timeout_secs", self.operation_timeout_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
        ] {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn with_max_parallelism(mut self, n: usize) -> Self {
        self.max_parallelism = n;
        self
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".config/berth/engine.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/engine.toml");

        let config = EngineConfig {
            build_timeout_secs: 60,
            ..EngineConfig::default()
        }
        .with_max_parallelism(2);
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.build_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "max_parallelism = 8\n").unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.max_parallelism, 8);
        assert_eq!(loaded.operation_timeout_secs, 120);
        assert_eq!(loaded.probe_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_unknown_keys_and_zero_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "parallel = 3\n").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::Config(_))
        ));

        std::fs::write(&path, "max_parallelism = 0\n").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            EngineConfig::load(&dir.path().join("nope.toml")),
            Err(EngineError::Io(_))
        ));
    }
}
