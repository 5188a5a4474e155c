use super::{engine_error, load_manifest, make_engine, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use berth_core::{EngineConfig, EnvironmentEngine};
use berth_schema::WorkspaceId;
use std::path::Path;

pub fn run(
    manifest_path: &Path,
    workspace: &WorkspaceId,
    runtime: &str,
    config: &EngineConfig,
    json: bool,
) -> Result<u8, String> {
    let env = load_manifest(manifest_path)?;
    let engine = make_engine(runtime, config, None)?.with_type(env.env_type());

    let pb = (!json).then(|| spinner(&format!("stopping workspace {workspace}...")));
    match engine.down(workspace, &env) {
        Ok(count) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "workspace": workspace, "stopped": count })
                );
            } else if let Some(ref pb) = pb {
                spin_ok(pb, &format!("workspace {workspace}: stopped {count} machine(s)"));
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "stop failed");
            }
            Err(engine_error(&e))
        }
    }
}
