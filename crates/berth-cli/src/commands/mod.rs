pub mod build;
pub mod completions;
pub mod down;
pub mod plan;
pub mod ps;
pub mod up;
pub mod validate;

use berth_core::{ContainerEngine, EngineConfig, EngineDispatcher, EngineError, Registry};
use berth_runtime::{select_runtime, ProgressSink};
use berth_schema::{load_environment, Environment};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_RUNTIME_ERROR: u8 = 3;
pub const EXIT_TIMEOUT: u8 = 4;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Map an error message to the process exit code.
pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("manifest error:") || msg.starts_with("invalid environment:") {
        EXIT_MANIFEST_ERROR
    } else if msg.starts_with("runtime error:")
        || msg.starts_with("missing prerequisites")
        || msg.contains("cannot reach the container daemon")
    {
        EXIT_RUNTIME_ERROR
    } else if msg.contains("timed out after") {
        EXIT_TIMEOUT
    } else {
        EXIT_FAILURE
    }
}

/// Render an engine error for the user, prefixing runtime failures so
/// [`exit_code_for`] recognizes them.
pub fn engine_error(e: &EngineError) -> String {
    let msg = e.to_string();
    if e.is_runtime() && !msg.starts_with("runtime error:") {
        format!("runtime error: {msg}")
    } else {
        msg
    }
}

pub fn load_manifest(path: &Path) -> Result<Environment, String> {
    load_environment(path).map_err(|e| format!("manifest error: {e}"))
}

/// Engine over the named runtime, with its own registry.
pub fn make_engine(
    runtime: &str,
    config: &EngineConfig,
    progress: Option<Arc<dyn ProgressSink>>,
) -> Result<ContainerEngine, String> {
    let runtime = select_runtime(runtime).map_err(|e| format!("runtime error: {e}"))?;
    debug!(
        "using runtime '{}' with max_parallelism {}",
        runtime.name(),
        config.max_parallelism
    );
    let engine = ContainerEngine::new(runtime, Arc::new(Registry::new()), config.clone());
    Ok(match progress {
        Some(p) => engine.with_progress(p),
        None => engine,
    })
}

/// Dispatcher handling the environment's type with `engine`.
pub fn make_dispatcher(engine: ContainerEngine, env: &Environment) -> EngineDispatcher {
    EngineDispatcher::new().with(Arc::new(engine.with_type(env.env_type())))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Shows the latest build output line on a spinner.
pub struct SpinnerProgress {
    pb: ProgressBar,
}

impl SpinnerProgress {
    pub fn new(pb: ProgressBar) -> Self {
        Self { pb }
    }
}

impl ProgressSink for SpinnerProgress {
    fn on_line(&self, machine: &str, line: &str) {
        let line = line.trim();
        if !line.is_empty() {
            self.pb.set_message(format!("[{machine}] {line}"));
        }
    }
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "running" => Style::new().cyan().bold().apply_to(state).to_string(),
        "starting" | "created" | "restarting" => Style::new().yellow().apply_to(state).to_string(),
        "stopping" | "stopped" | "exited" => Style::new().dim().apply_to(state).to_string(),
        "failed" | "dead" => Style::new().red().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}
