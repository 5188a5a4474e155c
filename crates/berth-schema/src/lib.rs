//! Build requests, environment descriptors, and manifests for Berth.
//!
//! This crate defines the schema layer: the immutable `BuildRequest` value and
//! its validating builder, the `Environment` descriptor mapping machine names
//! to `MachineConfig`s, TOML manifest parsing (`ManifestV1`) and normalization,
//! the link graph and start ordering (`StartPlan`), and deterministic build
//! fingerprints used to name locally built images.

pub mod build;
pub mod environment;
pub mod graph;
pub mod identity;
pub mod manifest;
pub mod normalize;
pub mod types;

pub use build::{
    AuthConfig, AuthConfigs, BuildArgs, BuildContext, BuildError, BuildRequest,
    BuildRequestBuilder, DEFAULT_DOCKERFILE,
};
pub use environment::{Environment, Link, MachineConfig, MachineSource, DEFAULT_ENV_TYPE};
pub use graph::StartPlan;
pub use identity::{compute_build_fingerprint, image_ref_for_build, BuildFingerprint};
pub use manifest::{
    load_environment, parse_manifest_file, parse_manifest_str, BuildSection, EnvironmentSection,
    MachineSection, ManifestError, ManifestV1,
};
pub use types::{ImageRef, MachineId, WorkspaceId};
