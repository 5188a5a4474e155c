mod commands;

use berth_core::{install_signal_handler, EngineConfig};
use berth_schema::WorkspaceId;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use commands::{exit_code_for, up::UpOptions, EXIT_RUNTIME_ERROR};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "berth",
    version,
    about = "Dependency-ordered container environments for workspaces"
)]
struct Cli {
    /// Engine configuration file (defaults to ~/.config/berth/engine.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Target {
    /// Path to manifest TOML file.
    #[arg(default_value = "berth.toml")]
    manifest: PathBuf,
    /// Workspace the machines belong to.
    #[arg(long, short, default_value = "default")]
    workspace: String,
    /// Container runtime: docker, podman, or mock.
    #[arg(long, default_value = "docker")]
    runtime: String,
    /// Override max_parallelism from the engine configuration.
    #[arg(long)]
    parallelism: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check a manifest and its link graph without touching the runtime.
    Validate {
        /// Path to manifest TOML file.
        #[arg(default_value = "berth.toml")]
        manifest: PathBuf,
    },
    /// Show the order machines would be started in.
    Plan {
        /// Path to manifest TOML file.
        #[arg(default_value = "berth.toml")]
        manifest: PathBuf,
    },
    /// Build the images of machines that declare a build section.
    Build {
        #[command(flatten)]
        target: Target,
    },
    /// Start every machine of the environment in dependency order.
    Up {
        #[command(flatten)]
        target: Target,
        /// Reattach to machines left running instead of failing.
        #[arg(long, default_value_t = false)]
        recover: bool,
        /// Return once the machines are up instead of waiting for Ctrl-C.
        #[arg(short, long, default_value_t = false)]
        detach: bool,
    },
    /// Stop and remove the machines of a workspace.
    Down {
        #[command(flatten)]
        target: Target,
    },
    /// List the machines the runtime reports for a workspace.
    Ps {
        /// Workspace to inspect.
        #[arg(long, short, default_value = "default")]
        workspace: String,
        /// Container runtime: docker, podman, or mock.
        #[arg(long, default_value = "docker")]
        runtime: String,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

impl Commands {
    /// Runtime the command talks to, if any.
    fn runtime(&self) -> Option<&str> {
        match self {
            Self::Build { target } | Self::Up { target, .. } | Self::Down { target } => {
                Some(&target.runtime)
            }
            Self::Ps { runtime, .. } => Some(runtime),
            Self::Validate { .. } | Self::Plan { .. } | Self::Completions { .. } => None,
        }
    }
}

fn load_config(path: Option<&Path>, parallelism: Option<usize>) -> Result<EngineConfig, String> {
    let config = match path {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::load_default(),
    }
    .map_err(|e| e.to_string())?;
    let config = match parallelism {
        Some(n) => config.with_max_parallelism(n),
        None => config,
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BERTH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let runtime = cli.command.runtime().map(str::to_owned);
    if let Some(binary @ ("docker" | "podman")) = runtime.as_deref() {
        if std::env::var("BERTH_SKIP_PREREQS").as_deref() != Ok("1") {
            let missing = berth_runtime::check_docker_prereqs(binary);
            if !missing.is_empty() {
                eprintln!("error: {}", berth_runtime::format_missing(&missing));
                return ExitCode::from(EXIT_RUNTIME_ERROR);
            }
        }
    }

    let json = cli.json;
    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Validate { manifest } => commands::validate::run(&manifest, json),
        Commands::Plan { manifest } => commands::plan::run(&manifest, json),
        Commands::Build { target } => load_config(config_path, target.parallelism).and_then(|config| {
            commands::build::run(
                &target.manifest,
                &WorkspaceId::new(target.workspace),
                &target.runtime,
                &config,
                json,
            )
        }),
        Commands::Up {
            target,
            recover,
            detach,
        } => load_config(config_path, target.parallelism).and_then(|config| {
            commands::up::run(
                &target.manifest,
                &WorkspaceId::new(target.workspace),
                &target.runtime,
                &config,
                UpOptions { recover, detach },
                json,
            )
        }),
        Commands::Down { target } => load_config(config_path, target.parallelism).and_then(|config| {
            commands::down::run(
                &target.manifest,
                &WorkspaceId::new(target.workspace),
                &target.runtime,
                &config,
                json,
            )
        }),
        Commands::Ps { workspace, runtime } => load_config(config_path, None).and_then(|config| {
            commands::ps::run(&WorkspaceId::new(workspace), &runtime, &config, json)
        }),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}
