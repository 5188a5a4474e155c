use super::{colorize_state, engine_error, json_pretty, make_engine, EXIT_SUCCESS};
use berth_core::{EngineConfig, EnvironmentEngine};
use berth_schema::WorkspaceId;

pub fn run(
    workspace: &WorkspaceId,
    runtime: &str,
    config: &EngineConfig,
    json: bool,
) -> Result<u8, String> {
    let engine = make_engine(runtime, config, None)?;
    let live = engine.probe(workspace).map_err(|e| engine_error(&e))?;

    if json {
        println!("{}", json_pretty(&live)?);
    } else if live.is_empty() {
        println!("no machines in workspace {workspace}");
    } else {
        println!("{:<16} {:<24} STATUS", "MACHINE", "ID");
        for m in &live {
            println!(
                "{:<16} {:<24} {}",
                m.display_name,
                m.machine_id,
                colorize_state(&m.status.to_string())
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
