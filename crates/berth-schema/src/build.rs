//! Immutable description of a single image build.
//!
//! A [`BuildRequest`] is produced by a [`BuildRequestBuilder`], which is seeded
//! with exactly one build context: an ordered list of source files or a remote
//! context URI (git or HTTP(S)). The context kind is fixed by the seed; asking
//! the builder for the other kind fails with [`BuildError::Conflict`].
//!
//! Construction performs structural validation only. Reading the files,
//! talking to registries, and streaming build output belong to the runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Name of the Dockerfile expected in a file context unless
/// [`BuildRequest::dockerfile_path`] overrides it.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} parameter is already set; remote and files parameters are mutually exclusive")]
    Conflict(&'static str),
}

/// Credentials for a single image registry.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl AuthConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            email: None,
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("email", &self.email)
            .finish()
    }
}

/// Registry host -> credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthConfigs(BTreeMap<String, AuthConfig>);

impl AuthConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, registry: impl Into<String>, config: AuthConfig) -> Self {
        self.0.insert(registry.into(), config);
        self
    }

    pub fn get(&self, registry: &str) -> Option<&AuthConfig> {
        self.0.get(registry)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AuthConfig)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, AuthConfig>> for AuthConfigs {
    fn from(map: BTreeMap<String, AuthConfig>) -> Self {
        Self(map)
    }
}

/// Where the build reads its sources from. Exactly one kind per request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildContext {
    /// Ordered files and directories making up the context.
    Files(Vec<PathBuf>),
    /// Git repository or HTTP(S) location of the context.
    Remote(String),
}

/// Build-time variables. A `None` value is passed to the build tool without a
/// value, which expands it from the tool's own environment.
pub type BuildArgs = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BuildRequest {
    repository: Option<String>,
    tag: Option<String>,
    auth_configs: AuthConfigs,
    force_pull: bool,
    memory_limit: Option<u64>,
    memory_swap_limit: Option<i64>,
    context: BuildContext,
    dockerfile_path: Option<String>,
    quiet: bool,
    no_cache: bool,
    remove_intermediate_containers: bool,
    force_remove_intermediate_containers: bool,
    build_args: Option<BuildArgs>,
}

impl BuildRequest {
    /// Start a request whose context is the given ordered file list.
    pub fn from_files<I, P>(files: I) -> Result<BuildRequestBuilder, BuildError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let files = collect_files(files)?;
        Ok(BuildRequestBuilder::seeded(BuildContext::Files(files)))
    }

    /// Start a request whose context lives at a remote URI.
    pub fn from_remote(remote: impl Into<String>) -> Result<BuildRequestBuilder, BuildError> {
        let remote = require_remote(remote.into())?;
        Ok(BuildRequestBuilder::seeded(BuildContext::Remote(remote)))
    }

    pub fn repository(&self) -> Option<&str> {
        self.repository.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn auth_configs(&self) -> &AuthConfigs {
        &self.auth_configs
    }

    pub fn force_pull(&self) -> bool {
        self.force_pull
    }

    /// RAM limit for the build in bytes.
    pub fn memory_limit(&self) -> Option<u64> {
        self.memory_limit
    }

    /// Memory plus swap in bytes; `-1` enables unlimited swap.
    pub fn memory_swap_limit(&self) -> Option<i64> {
        self.memory_swap_limit
    }

    pub fn context(&self) -> &BuildContext {
        &self.context
    }

    pub fn files(&self) -> Option<&[PathBuf]> {
        match &self.context {
            BuildContext::Files(files) => Some(files),
            BuildContext::Remote(_) => None,
        }
    }

    pub fn remote(&self) -> Option<&str> {
        match &self.context {
            BuildContext::Files(_) => None,
            BuildContext::Remote(remote) => Some(remote),
        }
    }

    /// Alternate Dockerfile location inside the context, if overridden.
    pub fn dockerfile_path(&self) -> Option<&str> {
        self.dockerfile_path.as_deref()
    }

    /// Dockerfile the build tool will look for.
    pub fn effective_dockerfile(&self) -> &str {
        self.dockerfile_path().unwrap_or(DEFAULT_DOCKERFILE)
    }

    pub fn quiet(&self) -> bool {
        self.quiet
    }

    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    pub fn remove_intermediate_containers(&self) -> bool {
        self.remove_intermediate_containers
    }

    pub fn force_remove_intermediate_containers(&self) -> bool {
        self.force_remove_intermediate_containers
    }

    /// Build arguments, or `None` if none were ever set.
    pub fn build_args(&self) -> Option<&BuildArgs> {
        self.build_args.as_ref()
    }

    /// `repository[:tag]`, when a repository was given.
    pub fn image_name(&self) -> Option<String> {
        let repository = self.repository.as_deref()?;
        Some(match self.tag.as_deref() {
            Some(tag) => format!("{repository}:{tag}"),
            None => repository.to_owned(),
        })
    }
}

/// Chainable construction of a [`BuildRequest`].
#[derive(Debug, Clone)]
#[must_use]
pub struct BuildRequestBuilder {
    inner: BuildRequest,
}

impl BuildRequestBuilder {
    fn seeded(context: BuildContext) -> Self {
        Self {
            inner: BuildRequest {
                repository: None,
                tag: None,
                auth_configs: AuthConfigs::default(),
                force_pull: false,
                memory_limit: None,
                memory_swap_limit: None,
                context,
                dockerfile_path: None,
                quiet: false,
                no_cache: false,
                remove_intermediate_containers: false,
                force_remove_intermediate_containers: false,
                build_args: None,
            },
        }
    }

    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.inner.repository = Some(repository.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.inner.tag = Some(tag.into());
        self
    }

    pub fn auth_configs(mut self, auth_configs: AuthConfigs) -> Self {
        self.inner.auth_configs = auth_configs;
        self
    }

    pub fn force_pull(mut self, force_pull: bool) -> Self {
        self.inner.force_pull = force_pull;
        self
    }

    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.inner.memory_limit = Some(bytes);
        self
    }

    pub fn memory_swap_limit(mut self, bytes: i64) -> Self {
        self.inner.memory_swap_limit = Some(bytes);
        self
    }

    pub fn dockerfile_path(mut self, path: impl Into<String>) -> Self {
        self.inner.dockerfile_path = Some(path.into());
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.inner.quiet = quiet;
        self
    }

    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.inner.no_cache = no_cache;
        self
    }

    pub fn remove_intermediate_containers(mut self, rm: bool) -> Self {
        self.inner.remove_intermediate_containers = rm;
        self
    }

    pub fn force_remove_intermediate_containers(mut self, force_rm: bool) -> Self {
        self.inner.force_remove_intermediate_containers = force_rm;
        self
    }

    /// Replace the file list. Fails if the context is remote.
    pub fn with_files<I, P>(mut self, files: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        if matches!(self.inner.context, BuildContext::Remote(_)) {
            return Err(BuildError::Conflict("remote"));
        }
        self.inner.context = BuildContext::Files(collect_files(files)?);
        Ok(self)
    }

    /// Append to the file list. Fails if the context is remote.
    pub fn add_files<I, P>(mut self, files: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        match &mut self.inner.context {
            BuildContext::Files(existing) => {
                existing.extend(files.into_iter().map(Into::into));
                Ok(self)
            }
            BuildContext::Remote(_) => Err(BuildError::Conflict("remote")),
        }
    }

    /// Replace the remote URI. Fails if the context is a file list.
    pub fn with_remote(mut self, remote: impl Into<String>) -> Result<Self, BuildError> {
        let remote = require_remote(remote.into())?;
        if matches!(self.inner.context, BuildContext::Files(_)) {
            return Err(BuildError::Conflict("files"));
        }
        self.inner.context = BuildContext::Remote(remote);
        Ok(self)
    }

    /// Replace all build arguments.
    pub fn build_args(mut self, args: BuildArgs) -> Result<Self, BuildError> {
        if let Some(key) = args.keys().find(|k| k.trim().is_empty()) {
            return Err(BuildError::InvalidArgument(format!(
                "build arg key must not be blank, got '{key}'"
            )));
        }
        self.inner.build_args = Some(args);
        Ok(self)
    }

    /// Add or overwrite a single build argument.
    pub fn add_build_arg(
        mut self,
        key: impl Into<String>,
        value: Option<String>,
    ) -> Result<Self, BuildError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(BuildError::InvalidArgument(
                "build arg key must not be blank".to_owned(),
            ));
        }
        self.inner
            .build_args
            .get_or_insert_with(BTreeMap::new)
            .insert(key, value);
        Ok(self)
    }

    pub fn build(self) -> Result<BuildRequest, BuildError> {
        if let Some(swap) = self.inner.memory_swap_limit {
            if swap < -1 {
                return Err(BuildError::InvalidArgument(format!(
                    "memory swap limit must be -1 (unlimited) or non-negative, got {swap}"
                )));
            }
        }
        if let Some(path) = &self.inner.dockerfile_path {
            if path.trim().is_empty() {
                return Err(BuildError::InvalidArgument(
                    "dockerfile path must not be blank".to_owned(),
                ));
            }
        }
        Ok(self.inner)
    }
}

fn collect_files<I, P>(files: I) -> Result<Vec<PathBuf>, BuildError>
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    let files: Vec<PathBuf> = files.into_iter().map(Into::into).collect();
    if files.is_empty() {
        return Err(BuildError::InvalidArgument(
            "build context file list must not be empty".to_owned(),
        ));
    }
    if files.iter().any(|f| f.as_os_str().is_empty()) {
        return Err(BuildError::InvalidArgument(
            "build context file path must not be empty".to_owned(),
        ));
    }
    Ok(files)
}

fn require_remote(remote: String) -> Result<String, BuildError> {
    let trimmed = remote.trim();
    if trimmed.is_empty() {
        return Err(BuildError::InvalidArgument(
            "remote build context must not be blank".to_owned(),
        ));
    }
    Ok(trimmed.to_owned())
}
