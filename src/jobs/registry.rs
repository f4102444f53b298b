//! In-process registries: active workspace workers and running CLI processes.
//!
//! These only stop this process from double-scheduling; cross-worker
//! exclusivity on queue items comes from the store's claim.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use uuid::Uuid;

use crate::cli::ProcessHandle;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Workspaces that currently have a worker running.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker for `workspace_id`, unless one is already running.
    ///
    /// The registration lasts as long as the returned guard.
    pub fn try_register(&self, workspace_id: Uuid) -> Option<WorkerGuard> {
        if !lock(&self.active).insert(workspace_id) {
            return None;
        }
        Some(WorkerGuard {
            registry: self.clone(),
            workspace_id,
        })
    }

    pub fn is_active(&self, workspace_id: Uuid) -> bool {
        lock(&self.active).contains(&workspace_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases a workspace registration on drop, including on panic.
pub struct WorkerGuard {
    registry: WorkerRegistry,
    workspace_id: Uuid,
}

impl WorkerGuard {
    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        lock(&self.registry.active).remove(&self.workspace_id);
    }
}

/// Running CLI subprocesses keyed by the task or chat they work for.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    processes: Arc<Mutex<HashMap<Uuid, ProcessHandle>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner_id: Uuid, handle: ProcessHandle) {
        debug!(owner_id = %owner_id, pid = ?handle.pid(), "Tracking CLI process");
        lock(&self.processes).insert(owner_id, handle);
    }

    pub fn unregister(&self, owner_id: Uuid) {
        lock(&self.processes).remove(&owner_id);
    }

    /// Kill the process working on `owner_id`. Returns false if none is tracked.
    pub fn kill(&self, owner_id: Uuid) -> bool {
        match lock(&self.processes).remove(&owner_id) {
            Some(handle) => {
                handle.kill();
                true
            }
            None => false,
        }
    }

    /// Kill every tracked process. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let handles: Vec<ProcessHandle> = lock(&self.processes)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &handles {
            handle.kill();
        }
        if !handles.is_empty() {
            info!(count = handles.len(), "Killed tracked CLI processes");
        }
        handles.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.processes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
