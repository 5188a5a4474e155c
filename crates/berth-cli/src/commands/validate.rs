use super::{json_pretty, load_manifest, EXIT_SUCCESS};
use std::path::Path;

pub fn run(manifest_path: &Path, json: bool) -> Result<u8, String> {
    let env = load_manifest(manifest_path)?;
    let plan = env.plan().map_err(|e| format!("manifest error: {e}"))?;

    if json {
        let payload = serde_json::json!({
            "valid": true,
            "name": env.name(),
            "type": env.env_type(),
            "machines": plan.order(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "✓ {}: environment '{}' ({}) with {} machine(s)",
            manifest_path.display(),
            env.name(),
            env.env_type(),
            plan.len()
        );
    }
    Ok(EXIT_SUCCESS)
}
