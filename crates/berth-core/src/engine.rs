use crate::concurrency::{run_tracked, run_with_timeout, CallFailed, CancelToken, LateCall};
use crate::config::EngineConfig;
use crate::machine::{Machine, MachineStatus};
use crate::registry::{Registry, RegistryEntry, SlotGuard};
use crate::EngineError;
use berth_runtime::{
    BuildSpec, LiveMachine, MachineLink, MachineRuntime, MachineSpec, ProgressSink,
    TracingProgress,
};
use berth_schema::{
    image_ref_for_build, Environment, ImageRef, MachineConfig, MachineId, MachineSource,
    StartPlan, WorkspaceId, DEFAULT_ENV_TYPE,
};
use crossbeam_channel::RecvTimeoutError;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the dispatcher wakes up to check for cancellation.
const DISPATCH_POLL: Duration = Duration::from_millis(50);

/// Starts and stops the machines of a workspace environment.
///
/// Implementations serialize `start` and `stop` per workspace and leave the
/// registry untouched when a start fails.
pub trait EnvironmentEngine: Send + Sync {
    /// Environment type tag this engine handles.
    fn engine_type(&self) -> &str;

    fn start(
        &self,
        workspace: &WorkspaceId,
        env: &Environment,
        recover: bool,
    ) -> Result<Vec<Machine>, EngineError> {
        self.start_with_cancel(workspace, env, recover, &CancelToken::never())
    }

    /// Start every machine of `env`, or with `recover` reattach to the ones
    /// the runtime still reports running. Returns machines in start order.
    fn start_with_cancel(
        &self,
        workspace: &WorkspaceId,
        env: &Environment,
        recover: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<Machine>, EngineError>;

    /// Register machines the runtime still reports running, never starting
    /// anything. Returns an empty list when nothing is live.
    fn attach(&self, workspace: &WorkspaceId, env: &Environment)
        -> Result<Vec<Machine>, EngineError>;

    /// Stop and remove the workspace's machines. A workspace without a
    /// running environment is left alone.
    fn stop(&self, workspace: &WorkspaceId) -> Result<(), EngineError>;

    /// Stop the workspace's machines, registered or only known to the
    /// runtime, and remove the ones the runtime reports as not running.
    /// Returns how many machines were cleaned up.
    fn down(&self, workspace: &WorkspaceId, env: &Environment) -> Result<usize, EngineError>;

    /// The runtime's current view of the workspace.
    fn probe(&self, workspace: &WorkspaceId) -> Result<Vec<LiveMachine>, EngineError>;
}

/// Engine for container environments over any [`MachineRuntime`].
pub struct ContainerEngine {
    engine_type: String,
    runtime: Arc<dyn MachineRuntime>,
    registry: Arc<Registry>,
    config: EngineConfig,
    progress: Arc<dyn ProgressSink>,
}

struct Job {
    name: String,
    config: MachineConfig,
    links: Vec<MachineLink>,
}

struct Outcome {
    name: String,
    result: Result<Machine, Failed>,
}

struct Failed {
    /// Set when the machine exists, or may yet exist, in the runtime.
    leftover: Option<Leftover>,
    error: EngineError,
}

impl Failed {
    fn before_create(error: EngineError) -> Self {
        Self {
            leftover: None,
            error,
        }
    }
}

/// What a machine that failed to come up left behind in the runtime.
enum Leftover {
    Created(MachineId),
    /// The create overran its timeout and may still produce a machine.
    LateCreate(LateCall<MachineId>),
    /// The start overran its timeout and may still bring the machine up.
    LateStart(MachineId, LateCall<()>),
}

impl ContainerEngine {
    pub fn new(
        runtime: Arc<dyn MachineRuntime>,
        registry: Arc<Registry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine_type: DEFAULT_ENV_TYPE.to_owned(),
            runtime,
            registry,
            config,
            progress: Arc::new(TracingProgress),
        }
    }

    #[must_use]
    pub fn with_type(mut self, engine_type: impl Into<String>) -> Self {
        self.engine_type = engine_type.into().to_lowercase();
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn MachineRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build the image of every machine that has a build context, in start
    /// order, without creating any machine.
    pub fn build_images(
        &self,
        workspace: &WorkspaceId,
        env: &Environment,
    ) -> Result<Vec<(String, ImageRef)>, EngineError> {
        let plan = env.plan()?;
        let mut built = Vec::new();
        for name in plan.order() {
            let Some(MachineSource::Build(request)) = env.machine(name).map(|m| &m.source) else {
                continue;
            };
            let spec = BuildSpec {
                workspace_id: workspace.clone(),
                machine: name.clone(),
                image: image_ref_for_build(workspace, name, request),
                request: request.clone(),
            };
            let image = self.build(spec)?;
            built.push((name.clone(), image));
        }
        Ok(built)
    }

    fn build(&self, spec: BuildSpec) -> Result<ImageRef, EngineError> {
        info!("building image {} for machine {}", spec.image, spec.machine);
        let runtime = Arc::clone(&self.runtime);
        let progress = Arc::clone(&self.progress);
        let machine = spec.machine.clone();
        run_with_timeout("build", &machine, self.config.build_timeout(), move || {
            runtime.build_image(&spec, progress.as_ref())
        })
    }

    fn start_locked(
        &self,
        guard: &mut SlotGuard<'_>,
        workspace: &WorkspaceId,
        env: &Environment,
        plan: &StartPlan,
        recover: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<Machine>, EngineError> {
        if let Some(entry) = guard.entry() {
            if recover {
                debug!("workspace {workspace} already registered, returning its machines");
                return Ok(entry.machines.clone());
            }
            return Err(EngineError::AlreadyRunning(workspace.to_string()));
        }

        if recover {
            let (machines, stale) = self.reattach(guard, workspace, plan)?;
            if !machines.is_empty() {
                return Ok(machines);
            }
            self.remove_stale(&stale);
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        info!(
            "starting environment '{}' ({} machine(s)) in workspace {workspace}",
            env.name(),
            plan.len()
        );
        let machines = self.launch(workspace, env, plan, cancel)?;
        guard.insert(RegistryEntry {
            engine_type: self.engine_type.clone(),
            machines: machines.clone(),
        });
        info!("workspace {workspace} running");
        Ok(machines)
    }

    /// Remove exited leftovers, then stop whatever is registered or live.
    fn down_locked(
        &self,
        guard: &mut SlotGuard<'_>,
        workspace: &WorkspaceId,
        plan: &StartPlan,
    ) -> Result<usize, EngineError> {
        let stale = if guard.is_occupied() {
            self.probe(workspace)?
                .into_iter()
                .filter(|m| !m.status.is_running())
                .collect()
        } else {
            self.reattach(guard, workspace, plan)?.1
        };
        self.remove_stale(&stale);

        let Some(entry) = guard.take() else {
            return Ok(stale.len());
        };
        let running = entry.machines.len();
        self.stop_entry(workspace, entry)?;
        Ok(running + stale.len())
    }

    /// Probe the runtime and register the running machines it reports.
    fn reattach(
        &self,
        guard: &mut SlotGuard<'_>,
        workspace: &WorkspaceId,
        plan: &StartPlan,
    ) -> Result<(Vec<Machine>, Vec<LiveMachine>), EngineError> {
        let live = self.probe(workspace)?;
        let (running, stale): (Vec<LiveMachine>, Vec<LiveMachine>) =
            live.into_iter().partition(|m| m.status.is_running());

        let rank = |name: &str| {
            plan.order()
                .iter()
                .position(|m| m == name)
                .unwrap_or(usize::MAX)
        };
        let mut machines: Vec<Machine> = running
            .into_iter()
            .map(|m| Machine::recovered(m.machine_id, m.display_name, workspace.clone()))
            .collect();
        machines.sort_by(|a, b| {
            rank(&a.display_name)
                .cmp(&rank(&b.display_name))
                .then_with(|| a.display_name.cmp(&b.display_name))
        });

        if !machines.is_empty() {
            info!(
                "recovered {} running machine(s) for workspace {workspace}",
                machines.len()
            );
            guard.insert(RegistryEntry {
                engine_type: self.engine_type.clone(),
                machines: machines.clone(),
            });
        }
        Ok((machines, stale))
    }

    /// Machines the probe reported as not running would collide with a fresh
    /// start, so they are removed first.
    fn remove_stale(&self, stale: &[LiveMachine]) {
        for machine in stale {
            debug!(
                "removing stale machine {} ({}, {})",
                machine.display_name, machine.machine_id, machine.status
            );
            if let Err(e) = self.remove_machine(&machine.machine_id, &machine.display_name) {
                warn!("failed to remove stale machine {}: {e}", machine.display_name);
            }
        }
    }

    /// Bring up every machine of `plan`, at most `max_parallelism` at a time,
    /// each once all of its link targets are running.
    #[allow(clippy::too_many_lines)]
    fn launch(
        &self,
        workspace: &WorkspaceId,
        env: &Environment,
        plan: &StartPlan,
        cancel: &CancelToken,
    ) -> Result<Vec<Machine>, EngineError> {
        let workers = self.config.max_parallelism.clamp(1, plan.len().max(1));
        let mut pending: HashMap<String, usize> = plan
            .order()
            .iter()
            .map(|m| (m.clone(), plan.dependencies(m).map_or(0, |d| d.len())))
            .collect();
        let mut ready: VecDeque<String> = plan
            .order()
            .iter()
            .filter(|m| pending.get(m.as_str()) == Some(&0))
            .cloned()
            .collect();
        let mut started: Vec<Machine> = Vec::with_capacity(plan.len());
        let mut orphans: Vec<(String, Leftover)> = Vec::new();
        let mut failure: Option<EngineError> = None;

        thread::scope(|scope| {
            let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
            let (done_tx, done_rx) = crossbeam_channel::unbounded::<Outcome>();
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for job in job_rx {
                        let result = self.bring_up(workspace, &job, cancel);
                        let outcome = Outcome {
                            name: job.name,
                            result,
                        };
                        if done_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(done_tx);

            let mut in_flight = 0usize;
            loop {
                if failure.is_none() && cancel.is_cancelled() {
                    info!("start of workspace {workspace} cancelled");
                    failure = Some(EngineError::Cancelled);
                }

                // Only hand out as many jobs as there are idle workers, so
                // nothing is left queued once a failure stops dispatching.
                while failure.is_none() && in_flight < workers {
                    let Some(name) = ready.pop_front() else {
                        break;
                    };
                    match job_for(env, &name, &started) {
                        Ok(job) => {
                            debug!("dispatching machine {name}");
                            if job_tx.send(job).is_err() {
                                failure = Some(EngineError::WorkerLost {
                                    op: "dispatch",
                                    target: name,
                                });
                                break;
                            }
                            in_flight += 1;
                        }
                        Err(e) => failure = Some(e),
                    }
                }

                if in_flight == 0 {
                    break;
                }

                match done_rx.recv_timeout(DISPATCH_POLL) {
                    Ok(Outcome { name, result }) => {
                        in_flight -= 1;
                        match result {
                            Ok(machine) => {
                                info!("machine {name} running ({})", machine.id);
                                started.push(machine);
                                for dependent in plan.dependents(&name) {
                                    if let Some(n) = pending.get_mut(dependent) {
                                        *n -= 1;
                                        if *n == 0 {
                                            ready.push_back(dependent.to_owned());
                                        }
                                    }
                                }
                            }
                            Err(Failed { leftover, error }) => {
                                warn!("machine {name} failed to start: {error}");
                                if let Some(leftover) = leftover {
                                    orphans.push((name, leftover));
                                }
                                if failure.is_none() {
                                    failure = Some(error);
                                }
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        if failure.is_none() {
                            failure = Some(EngineError::WorkerLost {
                                op: "start",
                                target: workspace.to_string(),
                            });
                        }
                        break;
                    }
                }
            }
            drop(job_tx);
        });

        if let Some(error) = failure {
            warn!(
                "start of workspace {workspace} failed, tearing down {} machine(s)",
                started.len() + orphans.len()
            );
            self.teardown(started, orphans);
            return Err(error);
        }
        Ok(started)
    }

    /// Build (when needed), create, and start one machine.
    fn bring_up(
        &self,
        workspace: &WorkspaceId,
        job: &Job,
        cancel: &CancelToken,
    ) -> Result<Machine, Failed> {
        let image = match &job.config.source {
            MachineSource::Image(image) => ImageRef::new(image.as_str()),
            MachineSource::Build(request) => {
                let spec = BuildSpec {
                    workspace_id: workspace.clone(),
                    machine: job.name.clone(),
                    image: image_ref_for_build(workspace, &job.name, request),
                    request: request.clone(),
                };
                self.build(spec).map_err(Failed::before_create)?
            }
        };

        if cancel.is_cancelled() {
            return Err(Failed::before_create(EngineError::Cancelled));
        }

        let spec = MachineSpec {
            workspace_id: workspace.clone(),
            name: job.name.clone(),
            image: image.clone(),
            memory_limit: job.config.memory_limit,
            memory_swap_limit: job.config.memory_swap_limit,
            env: job.config.env.clone(),
            links: job.links.clone(),
        };
        let runtime = Arc::clone(&self.runtime);
        let id = run_tracked(
            "create",
            &job.name,
            self.config.operation_timeout(),
            move || runtime.create(&spec),
        )
        .map_err(|CallFailed { error, late }| Failed {
            leftover: late.map(Leftover::LateCreate),
            error,
        })?;
        debug!("created machine {} as {id}", job.name);

        let failed = |error| Failed {
            leftover: Some(Leftover::Created(id.clone())),
            error,
        };
        if cancel.is_cancelled() {
            return Err(failed(EngineError::Cancelled));
        }

        let mut machine = Machine::new(id.clone(), job.name.clone(), workspace.clone(), Some(image));
        let runtime = Arc::clone(&self.runtime);
        let start_id = id.clone();
        run_tracked(
            "start",
            &job.name,
            self.config.operation_timeout(),
            move || runtime.start(&start_id),
        )
        .map_err(|CallFailed { error, late }| Failed {
            leftover: Some(match late {
                Some(late) => Leftover::LateStart(id.clone(), late),
                None => Leftover::Created(id.clone()),
            }),
            error,
        })?;
        machine.transition(MachineStatus::Running).map_err(failed)?;
        Ok(machine)
    }

    /// Undo a failed start: clean up machines that never reached running,
    /// then stop and remove started ones in reverse start order. Failures are
    /// logged.
    fn teardown(&self, mut started: Vec<Machine>, orphans: Vec<(String, Leftover)>) {
        for (name, leftover) in orphans.into_iter().rev() {
            if let Err(e) = self.clean_leftover(&name, leftover) {
                warn!("teardown: failed to remove machine {name}: {e}");
            }
        }
        for machine in started.iter_mut().rev() {
            if let Err(e) = self.stop_machine(machine) {
                warn!(
                    "teardown: failed to stop machine {}: {e}",
                    machine.display_name
                );
            }
        }
    }

    /// Overrunning calls get one more operation timeout to finish before the
    /// machine they produced is removed.
    fn clean_leftover(&self, name: &str, leftover: Leftover) -> Result<(), EngineError> {
        let grace = self.config.operation_timeout();
        match leftover {
            Leftover::Created(id) => self.remove_machine(&id, name),
            Leftover::LateCreate(late) => match late.settle(grace) {
                Some(id) => {
                    debug!("create of {name} finished late as {id}, removing it");
                    self.remove_machine(&id, name)
                }
                None => Ok(()),
            },
            Leftover::LateStart(id, late) => {
                if late.settle(grace).is_some() {
                    debug!("start of {name} finished late, stopping it");
                    let runtime = Arc::clone(&self.runtime);
                    let stop_id = id.clone();
                    run_with_timeout("stop", name, grace, move || runtime.stop(&stop_id))?;
                }
                self.remove_machine(&id, name)
            }
        }
    }

    /// Stop and remove every machine of a taken registry entry in reverse
    /// start order, collecting failures.
    fn stop_entry(
        &self,
        workspace: &WorkspaceId,
        mut entry: RegistryEntry,
    ) -> Result<(), EngineError> {
        info!(
            "stopping {} machine(s) in workspace {workspace}",
            entry.machines.len()
        );
        let mut failures = Vec::new();
        for machine in entry.machines.iter_mut().rev() {
            if let Err(e) = self.stop_machine(machine) {
                warn!("failed to stop machine {}: {e}", machine.display_name);
                failures.push((machine.display_name.clone(), e.to_string()));
            }
        }

        if failures.is_empty() {
            info!("workspace {workspace} stopped");
            Ok(())
        } else {
            Err(EngineError::StopFailed {
                workspace: workspace.to_string(),
                failures,
            })
        }
    }

    fn stop_machine(&self, machine: &mut Machine) -> Result<(), EngineError> {
        note_transition(machine, MachineStatus::Stopping);
        let runtime = Arc::clone(&self.runtime);
        let id = machine.id.clone();
        let result = run_with_timeout(
            "stop",
            &machine.display_name,
            self.config.operation_timeout(),
            move || runtime.stop(&id),
        )
        .and_then(|()| self.remove_machine(&machine.id, &machine.display_name));
        let status = if result.is_ok() {
            MachineStatus::Stopped
        } else {
            MachineStatus::Failed
        };
        note_transition(machine, status);
        result
    }

    fn remove_machine(&self, id: &MachineId, name: &str) -> Result<(), EngineError> {
        let runtime = Arc::clone(&self.runtime);
        let id = id.clone();
        run_with_timeout(
            "remove",
            name,
            self.config.operation_timeout(),
            move || runtime.remove(&id),
        )
    }
}

/// Status bookkeeping while stopping. A refused transition leaves the status
/// as it was and never aborts the stop.
fn note_transition(machine: &mut Machine, to: MachineStatus) {
    if let Err(e) = machine.transition(to) {
        debug!("machine {}: {e}", machine.display_name);
    }
}

/// Resolve `name`'s links to the ids of already running machines.
fn job_for(env: &Environment, name: &str, started: &[Machine]) -> Result<Job, EngineError> {
    let config = env
        .machine(name)
        .ok_or_else(|| EngineError::Validation(format!("unknown machine '{name}'")))?
        .clone();
    let links = config
        .links
        .iter()
        .map(|link| {
            started
                .iter()
                .find(|m| m.display_name == link.target)
                .map(|m| MachineLink {
                    target: m.id.clone(),
                    alias: link.name().to_owned(),
                })
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "machine '{name}' dispatched before its link target '{}'",
                        link.target
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Job {
        name: name.to_owned(),
        config,
        links,
    })
}

impl EnvironmentEngine for ContainerEngine {
    fn engine_type(&self) -> &str {
        &self.engine_type
    }

    fn start_with_cancel(
        &self,
        workspace: &WorkspaceId,
        env: &Environment,
        recover: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<Machine>, EngineError> {
        let plan = env.plan()?;

        let slot = self.registry.slot(workspace);
        let result = {
            let mut guard = slot.lock();
            self.start_locked(&mut guard, workspace, env, &plan, recover, cancel)
        };
        if result.is_err() {
            self.registry.prune(slot);
        }
        result
    }

    fn attach(
        &self,
        workspace: &WorkspaceId,
        env: &Environment,
    ) -> Result<Vec<Machine>, EngineError> {
        let plan = env.plan()?;
        let slot = self.registry.slot(workspace);
        let result = {
            let mut guard = slot.lock();
            match guard.entry() {
                Some(entry) => Ok(entry.machines.clone()),
                None => self
                    .reattach(&mut guard, workspace, &plan)
                    .map(|(machines, _)| machines),
            }
        };
        self.registry.prune(slot);
        result
    }

    fn stop(&self, workspace: &WorkspaceId) -> Result<(), EngineError> {
        let slot = self.registry.slot(workspace);
        let result = {
            let mut guard = slot.lock();
            match guard.take() {
                Some(entry) => self.stop_entry(workspace, entry),
                None => {
                    debug!("workspace {workspace} has no running environment");
                    Ok(())
                }
            }
        };
        self.registry.prune(slot);
        result
    }

    fn down(&self, workspace: &WorkspaceId, env: &Environment) -> Result<usize, EngineError> {
        let plan = env.plan()?;
        let slot = self.registry.slot(workspace);
        let result = {
            let mut guard = slot.lock();
            self.down_locked(&mut guard, workspace, &plan)
        };
        self.registry.prune(slot);
        result
    }

    fn probe(&self, workspace: &WorkspaceId) -> Result<Vec<LiveMachine>, EngineError> {
        let runtime = Arc::clone(&self.runtime);
        let ws = workspace.clone();
        run_with_timeout(
            "probe",
            workspace.as_str(),
            self.config.probe_timeout(),
            move || runtime.list_live(&ws),
        )
    }
}
