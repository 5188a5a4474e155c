use crate::build::{AuthConfigs, BuildRequest, BuildRequestBuilder};
use crate::environment::{Environment, Link, MachineConfig};
use crate::manifest::{BuildSection, MachineSection, ManifestError, ManifestV1};
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

impl ManifestV1 {
    /// Normalize the manifest into a validated environment, keeping build
    /// file paths exactly as written.
    pub fn normalize(&self) -> Result<Environment, ManifestError> {
        self.normalize_with(|p| PathBuf::from(p))
    }

    /// Like [`ManifestV1::normalize`], resolving relative build file paths
    /// against `base`.
    pub fn normalize_relative_to(&self, base: &Path) -> Result<Environment, ManifestError> {
        self.normalize_with(|p| base.join(p))
    }

    fn normalize_with(
        &self,
        resolve: impl Fn(&str) -> PathBuf,
    ) -> Result<Environment, ManifestError> {
        if self.manifest_version != 1 {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }

        let env_type = self.environment.env_type.trim().to_lowercase();
        let mut env = Environment::new(self.environment.name.trim(), env_type);

        for (raw_name, section) in &self.machines {
            let name = raw_name.trim();
            if name.is_empty() {
                return Err(ManifestError::EmptyMachineName);
            }
            let config = normalize_machine(name, section, &resolve)?;
            env.insert_machine(name, config);
        }

        env.validate()?;
        Ok(env)
    }
}

fn normalize_machine(
    name: &str,
    section: &MachineSection,
    resolve: &impl Fn(&str) -> PathBuf,
) -> Result<MachineConfig, ManifestError> {
    let mut config = match (&section.image, &section.build) {
        (Some(_), Some(_)) => return Err(ManifestError::ImageAndBuild(name.to_owned())),
        (None, None) => return Err(ManifestError::MissingSource(name.to_owned())),
        (Some(image), None) => MachineConfig::from_image(image.trim()),
        (None, Some(build)) => {
            let request =
                build_request(build, resolve).map_err(|source| ManifestError::InvalidBuild {
                    machine: name.to_owned(),
                    source,
                })?;
            MachineConfig::from_build(request)
        }
    };

    if let Some(mb) = section.memory_limit_mb {
        config.memory_limit = Some(mib_to_bytes(name, mb)?);
    }
    if let Some(mb) = section.memory_swap_limit_mb {
        config.memory_swap_limit = Some(swap_mib_to_bytes(name, mb)?);
    }

    for spec in &section.links {
        let link = Link::parse(spec).ok_or_else(|| ManifestError::InvalidLink {
            machine: name.to_owned(),
            spec: spec.clone(),
        })?;
        config.links.insert(link);
    }
    config.env.clone_from(&section.env);

    Ok(config)
}

fn build_request(
    section: &BuildSection,
    resolve: &impl Fn(&str) -> PathBuf,
) -> Result<BuildRequest, crate::build::BuildError> {
    let mut builder: BuildRequestBuilder = match &section.remote {
        Some(remote) => {
            let builder = BuildRequest::from_remote(remote.as_str())?;
            if section.files.is_empty() {
                builder
            } else {
                builder.with_files(section.files.iter().map(|f| resolve(f)))?
            }
        }
        None => BuildRequest::from_files(section.files.iter().map(|f| resolve(f)))?,
    };

    if let Some(repository) = &section.repository {
        builder = builder.repository(repository.trim());
    }
    if let Some(tag) = &section.tag {
        builder = builder.tag(tag.trim());
    }
    if let Some(dockerfile) = &section.dockerfile {
        builder = builder.dockerfile_path(dockerfile.as_str());
    }
    if let Some(mb) = section.memory_limit_mb {
        builder = builder.memory_limit(mb.saturating_mul(MIB));
    }
    if let Some(mb) = section.memory_swap_limit_mb {
        builder = builder.memory_swap_limit(if mb < 0 {
            mb
        } else {
            mb.saturating_mul(MIB as i64)
        });
    }
    if !section.auth.is_empty() {
        builder = builder.auth_configs(AuthConfigs::from(section.auth.clone()));
    }

    for (key, value) in &section.args {
        builder = builder.add_build_arg(key.as_str(), Some(value.clone()))?;
    }
    for key in &section.inherit_args {
        builder = builder.add_build_arg(key.as_str(), None)?;
    }

    builder
        .force_pull(section.force_pull)
        .quiet(section.quiet)
        .no_cache(section.no_cache)
        .remove_intermediate_containers(section.rm)
        .force_remove_intermediate_containers(section.force_rm)
        .build()
}

fn mib_to_bytes(machine: &str, mb: u64) -> Result<u64, ManifestError> {
    mb.checked_mul(MIB)
        .ok_or_else(|| ManifestError::InvalidMemoryLimit {
            machine: machine.to_owned(),
            detail: format!("{mb} MiB overflows"),
        })
}

fn swap_mib_to_bytes(machine: &str, mb: i64) -> Result<i64, ManifestError> {
    match mb {
        -1 => Ok(-1),
        m if m < -1 => Err(ManifestError::InvalidMemoryLimit {
            machine: machine.to_owned(),
            detail: format!("swap limit {m} MiB is below -1"),
        }),
        m => m
            .checked_mul(MIB as i64)
            .ok_or_else(|| ManifestError::InvalidMemoryLimit {
                machine: machine.to_owned(),
                detail: format!("{m} MiB overflows"),
            }),
    }
}
