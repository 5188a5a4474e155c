use crate::build::BuildRequest;
use crate::graph::StartPlan;
use crate::manifest::ManifestError;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Type tag used when a manifest does not name one.
pub const DEFAULT_ENV_TYPE: &str = "docker";

/// Named set of machine configurations that run together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    name: String,
    env_type: String,
    machines: BTreeMap<String, MachineConfig>,
}

impl Environment {
    pub fn new(name: impl Into<String>, env_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env_type: env_type.into(),
            machines: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_machine(mut self, name: impl Into<String>, config: MachineConfig) -> Self {
        self.machines.insert(name.into(), config);
        self
    }

    pub fn insert_machine(&mut self, name: impl Into<String>, config: MachineConfig) {
        self.machines.insert(name.into(), config);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag used to route this environment to an engine implementation.
    pub fn env_type(&self) -> &str {
        &self.env_type
    }

    pub fn machines(&self) -> &BTreeMap<String, MachineConfig> {
        &self.machines
    }

    pub fn machine(&self, name: &str) -> Option<&MachineConfig> {
        self.machines.get(name)
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Validate every machine and compute the start order.
    pub fn plan(&self) -> Result<StartPlan, ManifestError> {
        if self.machines.is_empty() {
            return Err(ManifestError::EmptyEnvironment);
        }
        for (name, config) in &self.machines {
            if name.trim().is_empty() {
                return Err(ManifestError::EmptyMachineName);
            }
            config.validate(name)?;
        }
        StartPlan::new(self)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        self.plan().map(|_| ())
    }
}

/// Where a machine's image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineSource {
    /// Build an image from a context before creating the machine.
    Build(BuildRequest),
    /// Use an existing image reference as-is.
    Image(String),
}

/// Dependency on another machine of the same environment, reachable under
/// `alias` (or the target name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Link {
    pub target: String,
    pub alias: Option<String>,
}

impl Link {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            alias: None,
        }
    }

    /// Parse `<machine>` or `<machine>:<alias>`.
    pub fn parse(spec: &str) -> Option<Self> {
        let (target, alias) = match spec.split_once(':') {
            Some((t, a)) => (t.trim(), Some(a.trim())),
            None => (spec.trim(), None),
        };
        if target.is_empty() || alias.is_some_and(str::is_empty) {
            return None;
        }
        Some(Self {
            target: target.to_owned(),
            alias: alias.map(str::to_owned),
        })
    }

    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.target)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{}:{alias}", self.target),
            None => f.write_str(&self.target),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineConfig {
    pub source: MachineSource,
    /// RAM limit in bytes.
    pub memory_limit: Option<u64>,
    /// Memory plus swap in bytes, `-1` for unlimited swap.
    pub memory_swap_limit: Option<i64>,
    pub env: BTreeMap<String, String>,
    pub links: BTreeSet<Link>,
}

impl MachineConfig {
    pub fn from_image(image: impl Into<String>) -> Self {
        Self::with_source(MachineSource::Image(image.into()))
    }

    pub fn from_build(request: BuildRequest) -> Self {
        Self::with_source(MachineSource::Build(request))
    }

    fn with_source(source: MachineSource) -> Self {
        Self {
            source,
            memory_limit: None,
            memory_swap_limit: None,
            env: BTreeMap::new(),
            links: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn link(mut self, link: Link) -> Self {
        self.links.insert(link);
        self
    }

    #[must_use]
    pub fn link_to(self, target: impl Into<String>) -> Self {
        self.link(Link::new(target))
    }

    #[must_use]
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    #[must_use]
    pub fn memory_swap_limit(mut self, bytes: i64) -> Self {
        self.memory_swap_limit = Some(bytes);
        self
    }

    pub fn build_request(&self) -> Option<&BuildRequest> {
        match &self.source {
            MachineSource::Build(request) => Some(request),
            MachineSource::Image(_) => None,
        }
    }

    /// Names of the machines this one links to.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.links.iter().map(|l| l.target.as_str())
    }

    fn validate(&self, name: &str) -> Result<(), ManifestError> {
        if let MachineSource::Image(image) = &self.source {
            if image.trim().is_empty() {
                return Err(ManifestError::EmptyImage(name.to_owned()));
            }
        }
        if let Some(swap) = self.memory_swap_limit {
            if swap < -1 {
                return Err(ManifestError::InvalidMemoryLimit {
                    machine: name.to_owned(),
                    detail: format!("swap limit {swap} is below -1"),
                });
            }
        }
        if let Some(key) = self.env.keys().find(|k| k.trim().is_empty() || k.contains('=')) {
            return Err(ManifestError::InvalidEnvVar {
                machine: name.to_owned(),
                key: key.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_parse_accepts_target_and_alias() {
        assert_eq!(Link::parse("db"), Some(Link::new("db")));
        let aliased = Link::parse("db:database").unwrap();
        assert_eq!(aliased.target, "db");
        assert_eq!(aliased.name(), "database");
        assert_eq!(aliased.to_string(), "db:database");
    }

    #[test]
    fn link_parse_rejects_blank_parts() {
        assert!(Link::parse("").is_none());
        assert!(Link::parse(":alias").is_none());
        assert!(Link::parse("db:").is_none());
    }

    #[test]
    fn empty_environment_is_invalid() {
        let env = Environment::new("dev", DEFAULT_ENV_TYPE);
        assert!(matches!(env.validate(), Err(ManifestError::EmptyEnvironment)));
    }

    #[test]
    fn blank_image_is_invalid() {
        let env =
            Environment::new("dev", DEFAULT_ENV_TYPE).with_machine("db", MachineConfig::from_image(" "));
        assert!(matches!(env.validate(), Err(ManifestError::EmptyImage(m)) if m == "db"));
    }

    #[test]
    fn env_var_with_equals_in_key_is_invalid() {
        let env = Environment::new("dev", DEFAULT_ENV_TYPE).with_machine(
            "app",
            MachineConfig::from_image("alpine").env_var("A=B", "c"),
        );
        assert!(matches!(
            env.validate(),
            Err(ManifestError::InvalidEnvVar { .. })
        ));
    }

    #[test]
    fn swap_below_unlimited_is_invalid() {
        let env = Environment::new("dev", DEFAULT_ENV_TYPE).with_machine(
            "app",
            MachineConfig::from_image("alpine").memory_swap_limit(-5),
        );
        assert!(matches!(
            env.validate(),
            Err(ManifestError::InvalidMemoryLimit { .. })
        ));
    }

    #[test]
    fn dependencies_follow_links() {
        let config = MachineConfig::from_image("app")
            .link_to("db")
            .link(Link::parse("cache:redis").unwrap());
        let deps: Vec<&str> = config.dependencies().collect();
        assert_eq!(deps, ["cache", "db"]);
    }

    #[test]
    fn build_request_accessor() {
        let req = BuildRequest::from_files(["Dockerfile"])
            .unwrap()
            .build()
            .unwrap();
        let config = MachineConfig::from_build(req.clone());
        assert_eq!(config.build_request(), Some(&req));
        assert!(MachineConfig::from_image("x").build_request().is_none());
    }
}
