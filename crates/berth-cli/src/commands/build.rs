use super::{
    engine_error, json_pretty, load_manifest, make_engine, spin_fail, spin_ok, spinner, SpinnerProgress,
    EXIT_SUCCESS,
};
use berth_core::EngineConfig;
use berth_runtime::ProgressSink;
use berth_schema::WorkspaceId;
use std::path::Path;
use std::sync::Arc;

pub fn run(
    manifest_path: &Path,
    workspace: &WorkspaceId,
    runtime: &str,
    config: &EngineConfig,
    json: bool,
) -> Result<u8, String> {
    let env = load_manifest(manifest_path)?;

    let pb = (!json).then(|| spinner("building images..."));
    let progress = pb
        .as_ref()
        .map(|pb| Arc::new(SpinnerProgress::new(pb.clone())) as Arc<dyn ProgressSink>);
    let engine = make_engine(runtime, config, progress)?;

    let built = match engine.build_images(workspace, &env) {
        Ok(built) => built,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(engine_error(&e));
        }
    };

    if json {
        let payload: Vec<_> = built
            .iter()
            .map(|(machine, image)| serde_json::json!({ "machine": machine, "image": image }))
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        if let Some(ref pb) = pb {
            spin_ok(pb, &format!("built {} image(s)", built.len()));
        }
        for (machine, image) in &built {
            println!("  {machine}: {image}");
        }
    }
    Ok(EXIT_SUCCESS)
}
