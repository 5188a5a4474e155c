use crate::backend::{BuildSpec, LiveMachine, LiveStatus, MachineRuntime, MachineSpec};
use crate::progress::ProgressSink;
use crate::RuntimeError;
use berth_schema::{ImageRef, MachineId, WorkspaceId};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Build,
    Create,
    Start,
    Stop,
    Remove,
    Probe,
}

/// One recorded runtime call. `target` is the machine name, or the
/// workspace id for [`MockOp::Probe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub target: String,
}

#[derive(Debug, Clone)]
struct Failure {
    message: String,
    transient: bool,
}

#[derive(Debug)]
struct MockMachine {
    workspace: WorkspaceId,
    name: String,
    running: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    machines: HashMap<MachineId, MockMachine>,
    images: BTreeSet<ImageRef>,
    calls: Vec<MockCall>,
    failures: HashMap<(MockOp, String), Failure>,
    delays: HashMap<MockOp, Duration>,
}

/// In-memory runtime that records every call.
///
/// Failures and delays can be injected per operation so engine scheduling,
/// timeout, and teardown paths are testable without a container daemon.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
    }

    /// Make `op` fail for `target` (machine name, or workspace id for probes).
    pub fn fail(&self, op: MockOp, target: &str, message: &str) {
        self.inject(op, target, message, false);
    }

    /// Like [`MockRuntime::fail`], but the error reports as transient.
    pub fn fail_transient(&self, op: MockOp, target: &str, message: &str) {
        self.inject(op, target, message, true);
    }

    fn inject(&self, op: MockOp, target: &str, message: &str, transient: bool) {
        if let Ok(mut state) = self.lock() {
            state.failures.insert(
                (op, target.to_owned()),
                Failure {
                    message: message.to_owned(),
                    transient,
                },
            );
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.lock() {
            state.failures.clear();
        }
    }

    /// Every call to `op` sleeps for `delay` before doing anything.
    pub fn delay(&self, op: MockOp, delay: Duration) {
        if let Ok(mut state) = self.lock() {
            state.delays.insert(op, delay);
        }
    }

    /// Register a running machine as if left over by an earlier process.
    pub fn seed_live(&self, workspace: &WorkspaceId, name: &str) -> MachineId {
        self.seed(workspace, name, true)
    }

    /// Register a stopped machine for `workspace`.
    pub fn seed_stopped(&self, workspace: &WorkspaceId, name: &str) -> MachineId {
        self.seed(workspace, name, false)
    }

    fn seed(&self, workspace: &WorkspaceId, name: &str, running: bool) -> MachineId {
        let Ok(mut state) = self.lock() else {
            return MachineId::new("");
        };
        let id = next_id(&mut state);
        state.machines.insert(
            id.clone(),
            MockMachine {
                workspace: workspace.clone(),
                name: name.to_owned(),
                running,
            },
        );
        id
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.lock()
            .map(|s| s.calls.iter().filter(|c| c.op == op).count())
            .unwrap_or_default()
    }

    /// Machine names in the order `op` was called on them.
    pub fn targets(&self, op: MockOp) -> Vec<String> {
        self.lock()
            .map(|s| {
                s.calls
                    .iter()
                    .filter(|c| c.op == op)
                    .map(|c| c.target.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_running(&self, id: &MachineId) -> bool {
        self.lock()
            .map(|s| s.machines.get(id).is_some_and(|m| m.running))
            .unwrap_or_default()
    }

    pub fn machine_count(&self, workspace: &WorkspaceId) -> usize {
        self.lock()
            .map(|s| {
                s.machines
                    .values()
                    .filter(|m| &m.workspace == workspace)
                    .count()
            })
            .unwrap_or_default()
    }

    pub fn has_image(&self, image: &ImageRef) -> bool {
        self.lock()
            .map(|s| s.images.contains(image))
            .unwrap_or_default()
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Record the call, apply the configured delay, then return any
    /// injected failure.
    fn enter(&self, op: MockOp, target: &str) -> Result<InFlight<'_>, RuntimeError> {
        let delay = {
            let mut state = self.lock()?;
            state.calls.push(MockCall {
                op,
                target: target.to_owned(),
            });
            state.delays.get(&op).copied()
        };

        let guard = InFlight::new(self);
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let state = self.lock()?;
        if let Some(failure) = state.failures.get(&(op, target.to_owned())) {
            return Err(if failure.transient {
                RuntimeError::Daemon(failure.message.clone())
            } else {
                RuntimeError::ExecFailed(failure.message.clone())
            });
        }
        Ok(guard)
    }

    fn name_of(&self, id: &MachineId) -> Result<String, RuntimeError> {
        self.lock()?
            .machines
            .get(id)
            .map(|m| m.name.clone())
            .ok_or_else(|| RuntimeError::MachineNotFound(id.to_string()))
    }
}

fn next_id(state: &mut MockState) -> MachineId {
    state.next_id += 1;
    MachineId::new(format!("mock-{:04}", state.next_id))
}

struct InFlight<'a> {
    runtime: &'a MockRuntime,
}

impl<'a> InFlight<'a> {
    fn new(runtime: &'a MockRuntime) -> Self {
        let now = runtime.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        runtime.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { runtime }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.runtime.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MachineRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn build_image(
        &self,
        spec: &BuildSpec,
        progress: &dyn ProgressSink,
    ) -> Result<ImageRef, RuntimeError> {
        let _guard = self.enter(MockOp::Build, &spec.machine)?;
        progress.on_line(&spec.machine, &format!("mock build {}", spec.image));
        self.lock()?.images.insert(spec.image.clone());
        Ok(spec.image.clone())
    }

    fn create(&self, spec: &MachineSpec) -> Result<MachineId, RuntimeError> {
        let _guard = self.enter(MockOp::Create, &spec.name)?;
        let mut state = self.lock()?;
        if let Some(link) = spec
            .links
            .iter()
            .find(|l| !state.machines.contains_key(&l.target))
        {
            return Err(RuntimeError::MachineNotFound(link.target.to_string()));
        }
        let id = next_id(&mut state);
        state.machines.insert(
            id.clone(),
            MockMachine {
                workspace: spec.workspace_id.clone(),
                name: spec.name.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    fn start(&self, id: &MachineId) -> Result<(), RuntimeError> {
        let name = self.name_of(id)?;
        let _guard = self.enter(MockOp::Start, &name)?;
        let mut state = self.lock()?;
        if let Some(machine) = state.machines.get_mut(id) {
            machine.running = true;
        }
        Ok(())
    }

    fn stop(&self, id: &MachineId) -> Result<(), RuntimeError> {
        let name = self.name_of(id)?;
        let _guard = self.enter(MockOp::Stop, &name)?;
        let mut state = self.lock()?;
        if let Some(machine) = state.machines.get_mut(id) {
            machine.running = false;
        }
        Ok(())
    }

    fn remove(&self, id: &MachineId) -> Result<(), RuntimeError> {
        let name = self.name_of(id)?;
        let _guard = self.enter(MockOp::Remove, &name)?;
        let mut state = self.lock()?;
        if state.machines.get(id).is_some_and(|m| m.running) {
            return Err(RuntimeError::ExecFailed(format!(
                "machine {name} is still running"
            )));
        }
        state.machines.remove(id);
        Ok(())
    }

    fn list_live(&self, workspace: &WorkspaceId) -> Result<Vec<LiveMachine>, RuntimeError> {
        let _guard = self.enter(MockOp::Probe, workspace.as_str())?;
        let state = self.lock()?;
        let mut live: Vec<LiveMachine> = state
            .machines
            .iter()
            .filter(|(_, m)| &m.workspace == workspace)
            .map(|(id, m)| LiveMachine {
                machine_id: id.clone(),
                display_name: m.name.clone(),
                status: if m.running {
                    LiveStatus::Running
                } else {
                    LiveStatus::Exited
                },
            })
            .collect();
        live.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        Ok(live)
    }
}
