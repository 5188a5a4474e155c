use crate::build::{AuthConfig, BuildError};
use crate::environment::{Environment, DEFAULT_ENV_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported manifest_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("environment must declare at least one machine")]
    EmptyEnvironment,
    #[error("machine name must not be empty")]
    EmptyMachineName,
    #[error("machine '{0}' declares both image and build; they are mutually exclusive")]
    ImageAndBuild(String),
    #[error("machine '{0}' declares neither image nor build")]
    MissingSource(String),
    #[error("machine '{0}': image must not be empty")]
    EmptyImage(String),
    #[error("machine '{machine}': invalid build section: {source}")]
    InvalidBuild {
        machine: String,
        #[source]
        source: BuildError,
    },
    #[error("machine '{machine}': invalid link '{spec}', expected '<machine>' or '<machine>:<alias>'")]
    InvalidLink { machine: String, spec: String },
    #[error("machine '{machine}' links to unknown machine '{target}'")]
    UnknownLinkTarget { machine: String, target: String },
    #[error("machine '{0}' links to itself")]
    SelfLink(String),
    #[error("dependency cycle between machines: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
    #[error("machine '{machine}': invalid memory limit: {detail}")]
    InvalidMemoryLimit { machine: String, detail: String },
    #[error("machine '{machine}': invalid environment variable name '{key}'")]
    InvalidEnvVar { machine: String, key: String },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestV1 {
    pub manifest_version: u32,
    #[serde(default)]
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub machines: BTreeMap<String, MachineSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSection {
    #[serde(default = "default_env_name")]
    pub name: String,
    #[serde(rename = "type", default = "default_env_type")]
    pub env_type: String,
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            name: default_env_name(),
            env_type: default_env_type(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MachineSection {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub build: Option<BuildSection>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    /// Memory plus swap in MiB, `-1` for unlimited swap.
    #[serde(default)]
    pub memory_swap_limit_mb: Option<i64>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub force_pull: bool,
    #[serde(default)]
    pub quiet: bool,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub rm: bool,
    #[serde(default)]
    pub force_rm: bool,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub memory_swap_limit_mb: Option<i64>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// Build args passed without a value, taken from the builder's environment.
    #[serde(default)]
    pub inherit_args: Vec<String>,
    #[serde(default)]
    pub auth: BTreeMap<String, AuthConfig>,
}

fn default_env_name() -> String {
    "default".to_owned()
}

fn default_env_type() -> String {
    DEFAULT_ENV_TYPE.to_owned()
}

pub fn parse_manifest_str(input: &str) -> Result<ManifestV1, ManifestError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<ManifestV1, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}

/// Parse a manifest file and normalize it into a validated [`Environment`].
///
/// Relative build file paths are resolved against the manifest's directory.
pub fn load_environment(path: impl AsRef<Path>) -> Result<Environment, ManifestError> {
    let path = path.as_ref();
    let manifest = parse_manifest_file(path)?;
    let base = path.parent().unwrap_or(Path::new("."));
    manifest.normalize_relative_to(base)
}
