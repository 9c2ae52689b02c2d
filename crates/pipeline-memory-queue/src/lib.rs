//! In-process task queue
//!
//! A `TaskQueue` backed by a handle store and a bounded worker pool. A
//! dispatcher task pulls stage invocations off a channel, waits for a free
//! worker slot (a semaphore permit), and spawns the unit on its own tokio
//! task. Stage N+1 is only put on the channel from stage N's successful
//! completion, so the completion itself is the synchronization point between
//! stages.

mod config;

pub use config::QueueConfig;

use async_trait::async_trait;
use chrono::Utc;
use pipeline_common::{ExecutionHandle, HandleId, HandleState, StageError};
use pipeline_core::{
    ChainError, ChainSpec, Context, Job, QueueError, Registry, TaskQueue, UnitError, UnitRequest,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A stage invocation waiting for a worker slot
struct Dispatch {
    id: HandleId,
    arg: Value,
}

/// Queue-side record of one handle
struct Record {
    handle: ExecutionHandle,
    chain: Arc<ChainSpec>,
    /// Next stage, enqueued when this one succeeds
    child: Option<HandleId>,
    /// Cooperative abort flag handed to the unit
    cancel: CancellationToken,
    /// Set while the unit is executing
    abort_handle: Option<AbortHandle>,
    /// Revoked without terminate while running
    revoke_requested: bool,
    state_tx: watch::Sender<HandleState>,
}

impl Record {
    fn set_state(&mut self, state: HandleState) {
        let now = Utc::now();
        match state {
            HandleState::Started => self.handle.started_at = Some(now),
            s if s.is_terminal() => self.handle.finished_at = Some(now),
            _ => {}
        }
        self.handle.state = state;
        self.state_tx.send_replace(state);
    }
}

#[derive(Default)]
struct Store {
    records: HashMap<HandleId, Record>,
    /// Handle ids of each submitted chain, oldest first
    chains: Vec<Vec<HandleId>>,
    /// Handles handed to the pool, in order. Pruned with their chain.
    enqueued: Vec<HandleId>,
}

impl Store {
    /// Drop every chain whose handles all finished at least `ttl` ago.
    /// Returns the number of handles removed.
    fn purge_expired(&mut self, ttl: Duration) -> usize {
        let now = Utc::now();
        let records = &self.records;
        let expired = |id: &HandleId| {
            records.get(id).map_or(true, |r| {
                r.handle.state.is_terminal()
                    && r.handle
                        .finished_at
                        .is_some_and(|at| (now - at).to_std().is_ok_and(|age| age >= ttl))
            })
        };
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.chains)
            .into_iter()
            .partition(|ids| ids.iter().all(expired));
        self.chains = kept;

        let removed = gone
            .iter()
            .flatten()
            .filter(|id| self.records.remove(*id).is_some())
            .count();
        if removed > 0 {
            self.enqueued.retain(|id| self.records.contains_key(id));
            debug!("Expired {} handles from {} chains", removed, gone.len());
        }
        removed
    }
}

struct Inner {
    registry: Arc<Registry>,
    config: QueueConfig,
    store: Mutex<Store>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    shutdown: CancellationToken,
}

/// In-process task queue with a bounded worker pool
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    /// Create the queue and start its dispatcher. Must be called inside a tokio runtime.
    pub fn new(registry: Arc<Registry>, config: QueueConfig) -> Self {
        let workers = config.workers.max(1);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            registry,
            config,
            store: Mutex::new(Store::default()),
            dispatch_tx,
            shutdown: shutdown.clone(),
        });

        info!(workers, "Starting in-process task queue");
        let semaphore = Arc::new(Semaphore::new(workers));
        tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            dispatch_rx,
            semaphore,
            shutdown,
        ));

        Self { inner }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Handles handed to the worker pool so far, in dispatch order
    pub async fn enqueue_log(&self) -> Vec<HandleId> {
        self.inner.store.lock().await.enqueued.clone()
    }

    /// Drop finished chains older than the configured expiry
    pub async fn purge_expired(&self) -> usize {
        let ttl = self.inner.config.result_expires();
        self.inner.store.lock().await.purge_expired(ttl)
    }

    /// Stop dispatching. Units already running are left to finish.
    pub fn shutdown(&self) {
        info!("Shutting down in-process task queue");
        self.inner.shutdown.cancel();
    }

    /// Move a pending handle to STARTED and spawn its unit
    async fn launch(&self, dispatch: Dispatch, permit: OwnedSemaphorePermit) {
        let mut store = self.inner.store.lock().await;
        let Some(record) = store.records.get_mut(&dispatch.id) else {
            warn!("Dispatched unknown handle {}", dispatch.id);
            return;
        };

        if record.handle.state != HandleState::Pending {
            debug!(
                "Skipping {} ({}): already {}",
                dispatch.id, record.handle.unit, record.handle.state
            );
            return;
        }

        let stage_index = record.handle.stage_index;
        let Some(stage) = record.chain.stage(stage_index) else {
            error!("Handle {} points past the end of its chain", dispatch.id);
            record.handle.error = Some(StageError {
                unit: record.handle.unit.clone(),
                stage_index,
                message: "stage index out of range".to_string(),
            });
            record.set_state(HandleState::Failure);
            return;
        };

        let request = stage.request(dispatch.arg);
        let unit_name = stage.unit.clone();
        let token = record.cancel.clone();
        record.set_state(HandleState::Started);

        debug!("Starting {} ({}) stage {}", dispatch.id, unit_name, stage_index);

        let id = dispatch.id;
        let queue = self.clone();
        let exec = tokio::spawn(async move {
            let _permit = permit;
            queue
                .execute_unit(id, &unit_name, stage_index, request, token)
                .await
        });
        record.abort_handle = Some(exec.abort_handle());

        let queue = self.clone();
        tokio::spawn(async move {
            let outcome = match exec.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => Err(UnitError::Cancelled("terminated".to_string())),
                Err(e) => Err(UnitError::ExecutionFailed(format!("unit panicked: {e}"))),
            };
            queue.complete(id, outcome).await;
        });
    }

    async fn execute_unit(
        &self,
        id: HandleId,
        unit_name: &str,
        stage_index: usize,
        request: UnitRequest,
        token: CancellationToken,
    ) -> Result<Value, UnitError> {
        let unit = self.inner.registry.get(unit_name).ok_or_else(|| {
            UnitError::ExecutionFailed(format!("unit '{unit_name}' is not registered"))
        })?;

        let ctx = Context::new(id, stage_index)
            .with_token(token)
            .with_work_dir(&self.inner.config.work_dir)
            .with_queue(Arc::new(self.clone()));

        unit.execute(&ctx, request).await
    }

    /// Record a unit's outcome and, on success, enqueue the next stage
    async fn complete(&self, id: HandleId, outcome: Result<Value, UnitError>) {
        let mut store = self.inner.store.lock().await;

        let next = {
            let Some(record) = store.records.get_mut(&id) else {
                return;
            };
            record.abort_handle = None;

            if record.handle.state.is_terminal() {
                debug!("{} finished after reaching {}", id, record.handle.state);
                return;
            }

            match outcome {
                Ok(value) if record.revoke_requested => {
                    // Kept so a caller can still find work this unit queued
                    record.handle.result = Some(value);
                    record.set_state(HandleState::Revoked);
                    None
                }
                Ok(value) => {
                    info!("{} ({}) succeeded", id, record.handle.unit);
                    record.handle.result = Some(value.clone());
                    record.set_state(HandleState::Success);
                    record.child.map(|child| (child, value))
                }
                Err(e) if e.is_cancelled() || record.revoke_requested => {
                    info!("{} ({}) cancelled: {}", id, record.handle.unit, e);
                    record.set_state(HandleState::Revoked);
                    None
                }
                Err(e) => {
                    warn!("{} ({}) failed: {}", id, record.handle.unit, e);
                    record.handle.error = Some(StageError {
                        unit: record.handle.unit.clone(),
                        stage_index: record.handle.stage_index,
                        message: e.to_string(),
                    });
                    record.set_state(HandleState::Failure);
                    None
                }
            }
        };

        if let Some((child, value)) = next {
            let pending = store
                .records
                .get(&child)
                .is_some_and(|r| r.handle.state == HandleState::Pending);
            if pending {
                store.enqueued.push(child);
                if self
                    .inner
                    .dispatch_tx
                    .send(Dispatch { id: child, arg: value })
                    .is_err()
                {
                    warn!("Dispatcher is gone, {} will not run", child);
                }
            } else {
                debug!("Not enqueueing {}: no longer pending", child);
            }
        }
    }
}

async fn dispatch_loop(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let dispatch = tokio::select! {
            _ = shutdown.cancelled() => break,
            dispatch = rx.recv() => match dispatch {
                Some(dispatch) => dispatch,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        MemoryQueue { inner }.launch(dispatch, permit).await;
    }
    debug!("Dispatcher stopped");
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn submit(&self, job: Job) -> Result<HandleId, QueueError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        if job.chain.is_empty() {
            return Err(QueueError::Rejected(ChainError::EmptyChain));
        }
        if let Some(stage) = job
            .chain
            .stages()
            .iter()
            .find(|s| !self.inner.registry.contains(&s.unit))
        {
            return Err(QueueError::Rejected(ChainError::UnknownUnit(
                stage.unit.clone(),
            )));
        }

        let chain = Arc::new(job.chain);
        let ids: Vec<HandleId> = (0..chain.len()).map(|_| HandleId::new()).collect();
        let now = Utc::now();

        let mut store = self.inner.store.lock().await;
        store.purge_expired(self.inner.config.result_expires());
        for (index, (&id, stage)) in ids.iter().zip(chain.stages()).enumerate() {
            let (state_tx, _) = watch::channel(HandleState::Pending);
            let record = Record {
                handle: ExecutionHandle {
                    id,
                    state: HandleState::Pending,
                    parent: index.checked_sub(1).map(|p| ids[p]),
                    unit: stage.unit.clone(),
                    stage_index: index,
                    result: None,
                    error: None,
                    submitted_at: now,
                    started_at: None,
                    finished_at: None,
                },
                chain: Arc::clone(&chain),
                child: ids.get(index + 1).copied(),
                cancel: CancellationToken::new(),
                abort_handle: None,
                revoke_requested: false,
                state_tx,
            };
            store.records.insert(id, record);
        }

        let first = ids[0];
        let last = ids[ids.len() - 1];
        store.chains.push(ids);
        store.enqueued.push(first);
        self.inner
            .dispatch_tx
            .send(Dispatch {
                id: first,
                arg: job.arg,
            })
            .map_err(|_| QueueError::Closed)?;

        info!(
            "Submitted chain '{}' ({} stages), last handle {}",
            chain.name(),
            chain.len(),
            last
        );
        Ok(last)
    }

    async fn get_state(&self, id: HandleId) -> Result<HandleState, QueueError> {
        let store = self.inner.store.lock().await;
        store
            .records
            .get(&id)
            .map(|r| r.handle.state)
            .ok_or(QueueError::UnknownHandle(id))
    }

    async fn get_result(&self, id: HandleId, timeout: Duration) -> Result<Value, QueueError> {
        let mut rx = {
            let store = self.inner.store.lock().await;
            store
                .records
                .get(&id)
                .ok_or(QueueError::UnknownHandle(id))?
                .state_tx
                .subscribe()
        };

        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| state.is_terminal()).await.map(|_| ())
        })
        .await;

        match waited {
            Err(_) => return Err(QueueError::Timeout { id, waited: timeout }),
            Ok(Err(_)) => return Err(QueueError::Closed),
            Ok(Ok(())) => {}
        }

        let store = self.inner.store.lock().await;
        let record = store.records.get(&id).ok_or(QueueError::UnknownHandle(id))?;
        match record.handle.state {
            HandleState::Success => Ok(record.handle.result.clone().unwrap_or(Value::Null)),
            HandleState::Failure => Err(QueueError::Stage(record.handle.error.clone().unwrap_or(
                StageError {
                    unit: record.handle.unit.clone(),
                    stage_index: record.handle.stage_index,
                    message: "unknown failure".to_string(),
                },
            ))),
            _ => Err(QueueError::Revoked(id)),
        }
    }

    async fn get_parent(&self, id: HandleId) -> Result<Option<HandleId>, QueueError> {
        let store = self.inner.store.lock().await;
        store
            .records
            .get(&id)
            .map(|r| r.handle.parent)
            .ok_or(QueueError::UnknownHandle(id))
    }

    async fn get_handle(&self, id: HandleId) -> Result<ExecutionHandle, QueueError> {
        let store = self.inner.store.lock().await;
        store
            .records
            .get(&id)
            .map(|r| r.handle.clone())
            .ok_or(QueueError::UnknownHandle(id))
    }

    async fn revoke(&self, id: HandleId, terminate: bool) -> Result<(), QueueError> {
        let mut store = self.inner.store.lock().await;
        let record = store
            .records
            .get_mut(&id)
            .ok_or(QueueError::UnknownHandle(id))?;

        match record.handle.state {
            state if state.is_terminal() => {
                debug!("Revoke of {} ignored: already {}", id, state);
            }
            HandleState::Pending => {
                info!("Revoked pending {} ({})", id, record.handle.unit);
                record.cancel.cancel();
                record.set_state(HandleState::Revoked);
            }
            _ => {
                record.revoke_requested = true;
                record.cancel.cancel();
                if terminate {
                    if let Some(abort_handle) = record.abort_handle.take() {
                        abort_handle.abort();
                    }
                    info!("Terminated running {} ({})", id, record.handle.unit);
                    record.set_state(HandleState::Revoked);
                } else {
                    info!("Revoke requested for running {} ({})", id, record.handle.unit);
                }
            }
        }
        Ok(())
    }

    async fn abort(&self, id: HandleId) -> Result<(), QueueError> {
        let store = self.inner.store.lock().await;
        let record = store
            .records
            .get(&id)
            .ok_or(QueueError::UnknownHandle(id))?;
        if !record.handle.state.is_terminal() {
            debug!("Abort flag raised for {} ({})", id, record.handle.unit);
            record.cancel.cancel();
        }
        Ok(())
    }
}
