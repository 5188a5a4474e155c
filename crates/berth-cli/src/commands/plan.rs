use super::{json_pretty, load_manifest, EXIT_SUCCESS};
use std::path::Path;

pub fn run(manifest_path: &Path, json: bool) -> Result<u8, String> {
    let env = load_manifest(manifest_path)?;
    let plan = env.plan().map_err(|e| format!("manifest error: {e}"))?;

    if json {
        let machines: Vec<_> = plan
            .order()
            .iter()
            .map(|name| {
                serde_json::json!({
                    "name": name,
                    "depends_on": plan.dependencies(name).cloned().unwrap_or_default(),
                })
            })
            .collect();
        let payload = serde_json::json!({
            "environment": env.name(),
            "type": env.env_type(),
            "levels": plan.levels(),
            "machines": machines,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("start plan for '{}' ({}):", env.name(), env.env_type());
    for (i, level) in plan.levels().iter().enumerate() {
        println!("  level {i}:");
        for name in level {
            match plan.dependencies(name) {
                Some(deps) if !deps.is_empty() => {
                    let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                    println!("    {name} (after {})", deps.join(", "));
                }
                _ => println!("    {name}"),
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
