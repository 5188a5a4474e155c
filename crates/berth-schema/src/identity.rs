use crate::build::{BuildContext, BuildRequest};
use crate::types::{ImageRef, WorkspaceId};
use serde::Serialize;

/// Deterministic identity of a build request, derived from every field.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BuildFingerprint {
    pub digest: String,
    pub short: String,
}

/// Hash all fields of a build request into a stable digest.
///
/// Two requests with identical field values always produce the same digest,
/// so the digest can tag images built for machines that name no repository.
/// Credentials are hashed too: a different login may see a different base
/// image.
pub fn compute_build_fingerprint(request: &BuildRequest) -> BuildFingerprint {
    let mut hasher = blake3::Hasher::new();

    match request.context() {
        BuildContext::Files(files) => {
            for file in files {
                hasher.update(format!("file:{}", file.to_string_lossy()).as_bytes());
            }
        }
        BuildContext::Remote(remote) => {
            hasher.update(format!("remote:{remote}").as_bytes());
        }
    }

    if let Some(repository) = request.repository() {
        hasher.update(format!("repo:{repository}").as_bytes());
    }
    if let Some(tag) = request.tag() {
        hasher.update(format!("tag:{tag}").as_bytes());
    }
    if let Some(dockerfile) = request.dockerfile_path() {
        hasher.update(format!("dockerfile:{dockerfile}").as_bytes());
    }
    for (registry, auth) in request.auth_configs().iter() {
        hasher.update(format!("auth:{registry}:{}", auth.username).as_bytes());
        hasher.update(blake3::hash(auth.password.as_bytes()).as_bytes());
    }
    if let Some(mem) = request.memory_limit() {
        hasher.update(format!("mem:{mem}").as_bytes());
    }
    if let Some(swap) = request.memory_swap_limit() {
        hasher.update(format!("swap:{swap}").as_bytes());
    }

    for (flag, set) in [
        ("pull", request.force_pull()),
        ("quiet", request.quiet()),
        ("nocache", request.no_cache()),
        ("rm", request.remove_intermediate_containers()),
        ("forcerm", request.force_remove_intermediate_containers()),
    ] {
        if set {
            hasher.update(format!("flag:{flag}").as_bytes());
        }
    }

    if let Some(args) = request.build_args() {
        hasher.update(b"args");
        for (key, value) in args {
            match value {
                Some(v) => hasher.update(format!("arg:{key}={v}").as_bytes()),
                None => hasher.update(format!("arg:{key}").as_bytes()),
            };
        }
    }

    let hex = hasher.finalize().to_hex().to_string();
    let short = hex[..12].to_owned();

    BuildFingerprint { digest: hex, short }
}

/// Image reference for a machine's build output.
///
/// Uses the request's `repository[:tag]` when present, otherwise a local name
/// scoped to the workspace and tagged with the request fingerprint.
pub fn image_ref_for_build(
    workspace: &WorkspaceId,
    machine: &str,
    request: &BuildRequest,
) -> ImageRef {
    if let Some(name) = request.image_name() {
        return ImageRef::new(name);
    }
    let fingerprint = compute_build_fingerprint(request);
    ImageRef::new(format!(
        "berth-{}-{}:{}",
        sanitize(workspace.as_str()),
        sanitize(machine),
        fingerprint.short
    ))
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(no_cache: bool) -> BuildRequest {
        BuildRequest::from_files(["Dockerfile", "src/"])
            .unwrap()
            .no_cache(no_cache)
            .build()
            .unwrap()
    }

    #[test]
    fn stable_fingerprint_for_equal_requests() {
        assert_eq!(
            compute_build_fingerprint(&request(true)),
            compute_build_fingerprint(&request(true))
        );
    }

    #[test]
    fn flag_change_changes_fingerprint() {
        assert_ne!(
            compute_build_fingerprint(&request(true)),
            compute_build_fingerprint(&request(false))
        );
    }

    #[test]
    fn absent_and_empty_build_arg_differ() {
        let absent = BuildRequest::from_files(["Dockerfile"])
            .unwrap()
            .add_build_arg("PROXY", None)
            .unwrap()
            .build()
            .unwrap();
        let empty = BuildRequest::from_files(["Dockerfile"])
            .unwrap()
            .add_build_arg("PROXY", Some(String::new()))
            .unwrap()
            .build()
            .unwrap();
        assert_ne!(
            compute_build_fingerprint(&absent),
            compute_build_fingerprint(&empty)
        );
    }

    #[test]
    fn short_fingerprint_is_12_chars() {
        let fp = compute_build_fingerprint(&request(false));
        assert_eq!(fp.short.len(), 12);
        assert!(fp.digest.starts_with(&fp.short));
    }

    #[test]
    fn image_ref_prefers_repository() {
        let req = BuildRequest::from_files(["Dockerfile"])
            .unwrap()
            .repository("registry.example.com/team/app")
            .tag("2.1")
            .build()
            .unwrap();
        let image = image_ref_for_build(&WorkspaceId::new("ws"), "app", &req);
        assert_eq!(image, "registry.example.com/team/app:2.1");
    }

    #[test]
    fn image_ref_without_repository_is_workspace_scoped() {
        let req = request(false);
        let image = image_ref_for_build(&WorkspaceId::new("Team WS"), "app", &req);
        let short = compute_build_fingerprint(&req).short;
        assert_eq!(image.as_str(), format!("berth-team-ws-app:{short}"));
    }
}
