use super::{
    colorize_state, engine_error, json_pretty, load_manifest, make_dispatcher, make_engine, spin_fail, spin_ok,
    spinner, SpinnerProgress, EXIT_SUCCESS,
};
use berth_core::{shutdown_requested, CancelToken, EngineConfig, Machine};
use berth_runtime::ProgressSink;
use berth_schema::{ImageRef, WorkspaceId};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct UpOptions {
    pub recover: bool,
    pub detach: bool,
}

pub fn run(
    manifest_path: &Path,
    workspace: &WorkspaceId,
    runtime: &str,
    config: &EngineConfig,
    options: UpOptions,
    json: bool,
) -> Result<u8, String> {
    let env = load_manifest(manifest_path)?;

    let pb = (!json).then(|| spinner(&format!("starting workspace {workspace}...")));
    let progress = pb
        .as_ref()
        .map(|pb| Arc::new(SpinnerProgress::new(pb.clone())) as Arc<dyn ProgressSink>);
    let dispatcher = make_dispatcher(make_engine(runtime, config, progress)?, &env);

    let cancel = CancelToken::from_shutdown();
    let machines = match dispatcher.start_with_cancel(workspace, &env, options.recover, &cancel) {
        Ok(machines) => machines,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "start failed");
            }
            return Err(engine_error(&e));
        }
    };

    if json {
        println!("{}", json_pretty(&machines)?);
    } else {
        if let Some(ref pb) = pb {
            spin_ok(
                pb,
                &format!("workspace {workspace}: {} machine(s) up", machines.len()),
            );
        }
        print_machines(&machines);
    }

    if options.detach {
        return Ok(EXIT_SUCCESS);
    }

    if !json {
        println!("press Ctrl-C to stop");
    }
    info!("waiting for Ctrl-C to stop workspace {workspace}");
    while !shutdown_requested() {
        std::thread::sleep(Duration::from_millis(200));
    }
    dispatcher
        .stop(workspace, env.env_type())
        .map_err(|e| engine_error(&e))?;
    if !json {
        println!("✓ workspace {workspace} stopped");
    }
    Ok(EXIT_SUCCESS)
}

fn print_machines(machines: &[Machine]) {
    println!("{:<16} {:<24} {:<10} IMAGE", "MACHINE", "ID", "STATUS");
    for m in machines {
        let image = m.image.as_ref().map_or("-", ImageRef::as_str);
        println!(
            "{:<16} {:<24} {:<10} {image}",
            m.display_name,
            m.id,
            colorize_state(&m.status.to_string())
        );
    }
}
