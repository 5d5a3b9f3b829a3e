//! Round-robin pool of supervised workers sharing one script workspace.

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::worker::Worker;
use crate::workspace::ScriptBundle;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tracing::{info, warn};

/// A fixed set of workers running the same entry script.
///
/// Calls are spread across workers with a shared counter. Concurrent calls
/// that land on the same worker queue behind its call lock, so the counter
/// only affects throughput, never correctness.
pub struct Pool {
    workers: Vec<Worker>,
    next: AtomicUsize,
    // Dropped after `workers`, so processes are gone before the directory is.
    workspace: TempDir,
}

impl Pool {
    /// Materialize `bundle`, then start `config.workers` processes.
    ///
    /// Every worker must complete its handshake. If any fails, all started
    /// processes are stopped and the workspace is removed before returning.
    pub async fn create(bundle: &ScriptBundle, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        if !bundle.contains(&config.entry_script) {
            return Err(PoolError::Config {
                message: format!(
                    "entry script {} is not part of the script bundle",
                    config.entry_script.display()
                ),
            });
        }

        let workspace = bundle.materialize_in(config.workspace_root.as_deref())?;
        let workers: Vec<Worker> = (0..config.workers)
            .map(|index| Worker::new(index, config.worker_config(workspace.path())))
            .collect();

        info!(
            "Starting pool of {} workers: {} {}",
            workers.len(),
            config.executable.display(),
            config.entry_script.display()
        );

        // Every init runs to completion so no start is abandoned half way.
        let started: Result<Vec<_>> = futures::future::join_all(workers.iter().map(Worker::init))
            .await
            .into_iter()
            .collect();
        if let Err(e) = started {
            warn!("Pool startup failed: {}", e);
            futures::future::join_all(workers.iter().map(Worker::close)).await;
            drop(workers);
            remove_workspace(workspace);
            return Err(e);
        }

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            workspace,
        })
    }

    fn next_worker(&self) -> &Worker {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    /// Call `function` on the next worker in round-robin order.
    pub async fn call<T, A>(&self, function: &str, argument: &A) -> Result<T>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        self.next_worker().call(function, argument).await
    }

    /// Raw-payload variant of [`Pool::call`].
    pub async fn call_raw(&self, function: &str, payload: &[u8]) -> Result<Vec<u8>> {
        self.next_worker().call_raw(function, payload).await
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker(&self, index: usize) -> Option<&Worker> {
        self.workers.get(index)
    }

    /// Directory every worker runs in.
    pub fn workspace_dir(&self) -> &Path {
        self.workspace.path()
    }

    /// Stop every worker, then remove the workspace.
    pub async fn close(self) {
        let Self {
            workers, workspace, ..
        } = self;
        futures::future::join_all(workers.iter().map(Worker::close)).await;
        drop(workers);
        remove_workspace(workspace);
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("workers", &self.workers)
            .field("workspace", &self.workspace.path())
            .finish()
    }
}

fn remove_workspace(workspace: TempDir) {
    let path = workspace.path().to_path_buf();
    match workspace.close() {
        Ok(()) => info!("Removed workspace {}", path.display()),
        Err(e) => warn!("Failed to remove workspace {}: {}", path.display(), e),
    }
}
