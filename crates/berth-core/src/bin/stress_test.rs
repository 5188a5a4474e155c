//! Long-running stress test for the Berth engine.
//!
//! Runs hundreds of start/stop cycles across several workspaces in parallel
//! with the mock runtime, injecting a start failure every few cycles, and
//! checks for leaks (registry entries or machines left behind) after every
//! cycle.
//!
//! Usage:
//!   cargo run --bin stress_test -- [--cycles N] [--workspaces N]

use berth_core::{ContainerEngine, EngineConfig, EnvironmentEngine, Registry};
use berth_runtime::{MachineRuntime, MockOp, MockRuntime};
use berth_schema::{Environment, MachineConfig, WorkspaceId};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn environment() -> Environment {
    Environment::new("stress", "docker")
        .with_machine("db", MachineConfig::from_image("postgres:16"))
        .with_machine("cache", MachineConfig::from_image("redis:7"))
        .with_machine(
            "api",
            MachineConfig::from_image("api:dev")
                .link_to("db")
                .link_to("cache"),
        )
        .with_machine("web", MachineConfig::from_image("web:dev").link_to("api"))
}

#[derive(Default)]
struct Timings {
    start: Duration,
    stop: Duration,
    failed_start: Duration,
}

fn run_cycle(
    engine: &ContainerEngine,
    runtime: &MockRuntime,
    env: &Environment,
    workspaces: &[WorkspaceId],
    cycle: usize,
    timings: &mut Timings,
) -> Result<(), String> {
    let inject = cycle.is_multiple_of(5);
    if inject {
        runtime.fail(MockOp::Start, "api", "injected start failure");
    }

    let t0 = Instant::now();
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = workspaces
            .iter()
            .map(|ws| s.spawn(move || engine.start(ws, env, false)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| "start thread panicked".to_owned()))
            .collect()
    });
    let elapsed = t0.elapsed();
    runtime.clear_failures();

    for (ws, result) in workspaces.iter().zip(results) {
        match result? {
            Ok(_) if inject => {
                return Err(format!("cycle {cycle}: {ws}: start succeeded despite failure"));
            }
            Ok(machines) if machines.len() != env.len() => {
                return Err(format!(
                    "cycle {cycle}: {ws}: expected {} machines, got {}",
                    env.len(),
                    machines.len()
                ));
            }
            Ok(_) => {}
            Err(_) if inject => {}
            Err(e) => return Err(format!("cycle {cycle}: {ws}: START FAILED: {e}")),
        }
    }
    if inject {
        timings.failed_start += elapsed;
        return Ok(());
    }
    timings.start += elapsed;

    let t0 = Instant::now();
    for ws in workspaces {
        engine
            .stop(ws)
            .map_err(|e| format!("cycle {cycle}: {ws}: STOP FAILED: {e}"))?;
    }
    timings.stop += t0.elapsed();
    Ok(())
}

fn check_health(
    registry: &Registry,
    runtime: &MockRuntime,
    workspaces: &[WorkspaceId],
    cycle: usize,
) -> u64 {
    let mut failures = 0u64;
    let registered = registry.workspaces();
    if !registered.is_empty() {
        eprintln!(
            "  cycle {cycle}: REGISTRY LEAK: {} entries remain",
            registered.len()
        );
        failures += 1;
    }
    for ws in workspaces {
        let left = runtime.machine_count(ws);
        if left > 0 {
            eprintln!("  cycle {cycle}: MACHINE LEAK: {left} machines in {ws}");
            failures += 1;
        }
    }
    failures
}

fn print_report(cycles: usize, failures: u64, timings: &Timings, runtime: &MockRuntime) {
    println!();
    println!("============================================");
    println!("Results: {cycles} cycles, {failures} failures");
    println!(
        "  start:        {:.3}s total, {:.3}ms avg",
        timings.start.as_secs_f64(),
        timings.start.as_secs_f64() * 1000.0 / cycles as f64
    );
    println!(
        "  failed start: {:.3}s total",
        timings.failed_start.as_secs_f64()
    );
    println!(
        "  stop:         {:.3}s total, {:.3}ms avg",
        timings.stop.as_secs_f64(),
        timings.stop.as_secs_f64() * 1000.0 / cycles as f64
    );
    println!("  runtime calls: {}", runtime.calls().len());
    println!("  peak concurrent calls: {}", runtime.max_concurrency());

    if failures > 0 {
        eprintln!("\nSTRESS TEST FAILED");
        std::process::exit(1);
    } else {
        println!("\nSTRESS TEST PASSED");
    }
}

fn arg_value(args: &[String], flag: &str) -> Option<usize> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let cycles = arg_value(&args, "--cycles").unwrap_or(500);
    let workspace_count = arg_value(&args, "--workspaces").unwrap_or(8);

    println!("Berth stress test: {cycles} cycles x {workspace_count} workspaces");
    println!("============================================");

    let runtime = Arc::new(MockRuntime::new());
    let registry = Arc::new(Registry::new());
    let engine = ContainerEngine::new(
        Arc::clone(&runtime) as Arc<dyn MachineRuntime>,
        Arc::clone(&registry),
        EngineConfig::default().with_max_parallelism(2),
    );
    let env = environment();
    let workspaces: Vec<WorkspaceId> = (0..workspace_count)
        .map(|i| WorkspaceId::new(format!("ws{i}")))
        .collect();

    let mut timings = Timings::default();
    let mut failures = 0u64;

    for cycle in 1..=cycles {
        if let Err(msg) = run_cycle(&engine, &runtime, &env, &workspaces, cycle, &mut timings) {
            eprintln!("  {msg}");
            failures += 1;
            for ws in &workspaces {
                let _ = engine.stop(ws);
            }
            continue;
        }
        failures += check_health(&registry, &runtime, &workspaces, cycle);
        if cycle.is_multiple_of(100) {
            let elapsed = timings.start + timings.stop + timings.failed_start;
            println!(
                "  cycle {cycle}/{cycles}: {:.1}s elapsed, {failures} failures",
                elapsed.as_secs_f64()
            );
        }
    }

    print_report(cycles, failures, &timings, &runtime);
}
