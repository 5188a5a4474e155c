//! Process-wide table of running environments.
//!
//! Each workspace owns a [`WorkspaceSlot`]. The slot's mutex is the
//! per-workspace exclusivity lock: the entry can only be read or changed
//! through the [`SlotGuard`] returned by [`WorkspaceSlot::lock`], and an
//! engine holds that guard for the whole of a start or stop. The outer map
//! lock is held only long enough to find or create a slot, so workspaces never
//! wait on each other.

use crate::machine::Machine;
use berth_schema::WorkspaceId;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Engine type and machines (in start order) of one running environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub engine_type: String,
    pub machines: Vec<Machine>,
}

#[derive(Debug, Default)]
pub struct Registry {
    slots: Mutex<HashMap<WorkspaceId, Arc<WorkspaceSlot>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The workspace's slot, created on first use. Every caller for a
    /// workspace shares one lock until the slot is pruned.
    pub fn slot(&self, workspace: &WorkspaceId) -> Arc<WorkspaceSlot> {
        let mut slots = self.slots.lock();
        Arc::clone(
            slots
                .entry(workspace.clone())
                .or_insert_with(|| Arc::new(WorkspaceSlot::new(workspace.clone()))),
        )
    }

    /// Copy of the workspace's entry. Blocks while a start or stop is in progress.
    pub fn snapshot(&self, workspace: &WorkspaceId) -> Option<RegistryEntry> {
        let slot = self.slots.lock().get(workspace).cloned()?;
        let guard = slot.lock();
        guard.entry().cloned()
    }

    /// Workspaces that currently have an entry, sorted.
    pub fn workspaces(&self) -> Vec<WorkspaceId> {
        let slots: Vec<Arc<WorkspaceSlot>> = self.slots.lock().values().cloned().collect();
        let mut ids: Vec<WorkspaceId> = slots
            .iter()
            .filter(|slot| slot.lock().is_occupied())
            .map(|slot| slot.workspace().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_registered(&self, workspace: &WorkspaceId) -> bool {
        self.snapshot(workspace).is_some()
    }

    /// Drop `slot` from the table when it is empty and the caller's handle is
    /// the only one outside the map. Returns whether it was removed.
    ///
    /// Handles are only cloned under the map lock, so the count cannot grow
    /// while it is checked here.
    pub fn prune(&self, slot: Arc<WorkspaceSlot>) -> bool {
        let mut slots = self.slots.lock();
        let workspace = slot.workspace();
        let unused = slots
            .get(workspace)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
            && Arc::strong_count(&slot) == 2
            && slot.try_lock().is_some_and(|guard| !guard.is_occupied());
        if unused {
            slots.remove(workspace);
        }
        unused
    }

    /// Number of slots held, occupied or not.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct WorkspaceSlot {
    workspace: WorkspaceId,
    entry: Mutex<Option<RegistryEntry>>,
}

impl WorkspaceSlot {
    fn new(workspace: WorkspaceId) -> Self {
        Self {
            workspace,
            entry: Mutex::new(None),
        }
    }

    pub fn workspace(&self) -> &WorkspaceId {
        &self.workspace
    }

    /// Acquire the workspace's exclusive lock, blocking until it is free.
    pub fn lock(&self) -> SlotGuard<'_> {
        SlotGuard {
            entry: self.entry.lock(),
        }
    }

    pub fn try_lock(&self) -> Option<SlotGuard<'_>> {
        self.entry.try_lock().map(|entry| SlotGuard { entry })
    }
}

/// Exclusive access to one workspace's entry.
pub struct SlotGuard<'a> {
    entry: MutexGuard<'a, Option<RegistryEntry>>,
}

impl SlotGuard<'_> {
    pub fn entry(&self) -> Option<&RegistryEntry> {
        self.entry.as_ref()
    }

    pub fn is_occupied(&self) -> bool {
        self.entry.is_some()
    }

    /// Store `entry`, returning any previous one.
    pub fn insert(&mut self, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.entry.replace(entry)
    }

    pub fn take(&mut self) -> Option<RegistryEntry> {
        self.entry.take()
    }
}
