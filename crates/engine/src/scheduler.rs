//! Task scheduler: admission, grouping and control of transfer tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cloudxfer_client::{ObjectClient, PartExecutor};
use cloudxfer_protocol::{TaskStatus, TransferDirection, TransferEvent, TransferTask};
use cloudxfer_transfer::{remove_staging, validate_object_key};

use crate::machine::{EngineContext, RunControl, RunOutcome, TransferStateMachine};
use crate::{EngineConfig, EngineError, TaskStore};

/// Providers reject multipart sessions with more parts than this.
const MAX_PARTS: u64 = 10_000;

/// Snapshot of task ids per group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskGroups {
    /// Admission order; paused tasks keep their place.
    pub pending: Vec<String>,
    pub in_progress: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

/// Handle to the transfer engine.
///
/// Cheap to clone; every clone drives the same task set. Pending tasks are
/// admitted in FIFO order while fewer than `max_concurrent_tasks` are
/// running, and every run that ends frees its slot for the next one.
///
/// Observers read [`TransferEvent`]s from the receiver returned by
/// [`take_events`](Self::take_events). The channel is unbounded, so a slow
/// or absent observer never holds up a run; events buffer until read.
#[derive(Clone)]
pub struct TransferScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    config: EngineConfig,
    ctx: Arc<EngineContext>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransferEvent>>>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<String, TransferTask>,
    pending: VecDeque<String>,
    running: HashMap<String, RunControl>,
    completed: Vec<String>,
    failed: Vec<String>,
    /// Running tasks asked to pause and then resumed before the pause landed.
    resume_after_pause: HashSet<String>,
}

impl TransferScheduler {
    /// Creates an empty scheduler.
    pub fn new(config: EngineConfig, client: Arc<ObjectClient>) -> Result<Self, EngineError> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = EngineContext {
            executor: PartExecutor::new(client, config.retry.policy()),
            store: TaskStore::new(&config.state_dir),
            events: tx,
            progress_interval: config.progress_interval(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                ctx: Arc::new(ctx),
                events_rx: Mutex::new(Some(rx)),
                state: Mutex::new(State::default()),
            }),
        })
    }

    /// Creates a scheduler from the task records under `config.state_dir`
    /// and admits pending tasks up to the cap.
    ///
    /// Tasks that were running or pending when the process stopped are
    /// queued again in creation order. Cancelled records are deleted.
    pub async fn restore(
        config: EngineConfig,
        client: Arc<ObjectClient>,
    ) -> Result<Self, EngineError> {
        let scheduler = Self::new(config, client)?;
        let ctx = &scheduler.shared.ctx;

        let mut records = ctx.store.load_all().await?;
        records.sort_by_key(|t| t.created_at);

        let mut restored = Vec::with_capacity(records.len());
        for mut task in records {
            match task.status {
                TaskStatus::Running | TaskStatus::Pending => {
                    if task.status == TaskStatus::Running {
                        task.set_status(TaskStatus::Pending);
                        ctx.persist(&task).await;
                    }
                    restored.push(task);
                }
                TaskStatus::Paused | TaskStatus::Failed | TaskStatus::Completed => {
                    restored.push(task)
                }
                TaskStatus::Cancelled => {
                    if let Err(e) = ctx.store.delete(&task.id).await {
                        warn!(task = %task.id, error = %e, "failed to delete cancelled record");
                    }
                }
            }
        }

        {
            let mut state = scheduler.lock();
            for task in restored {
                let id = task.id.clone();
                match task.status {
                    TaskStatus::Pending | TaskStatus::Paused => state.pending.push_back(id.clone()),
                    TaskStatus::Failed => state.failed.push(id.clone()),
                    _ => state.completed.push(id.clone()),
                }
                state.tasks.insert(id, task);
            }
            info!(
                pending = state.pending.len(),
                completed = state.completed.len(),
                failed = state.failed.len(),
                "task records restored"
            );
        }

        scheduler.admit();
        Ok(scheduler)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Queues an upload of `local_path` to `bucket/key`.
    pub async fn submit_upload(
        &self,
        local_path: impl Into<PathBuf>,
        bucket: &str,
        key: &str,
        total_size: u64,
        chunk_size: Option<u64>,
    ) -> Result<String, EngineError> {
        let task = self.new_task(
            TransferDirection::Upload,
            local_path.into(),
            bucket,
            key,
            total_size,
            chunk_size,
        )?;
        self.enqueue(task).await
    }

    /// Queues a download of `bucket/key` into `destination`.
    pub async fn submit_download(
        &self,
        bucket: &str,
        key: &str,
        total_size: u64,
        destination: impl Into<PathBuf>,
        chunk_size: Option<u64>,
    ) -> Result<String, EngineError> {
        let task = self.new_task(
            TransferDirection::Download,
            destination.into(),
            bucket,
            key,
            total_size,
            chunk_size,
        )?;
        self.enqueue(task).await
    }

    /// Pauses a task. A running task stops dispatching parts and settles as
    /// paused once its in-flight parts finish.
    pub async fn pause(&self, id: &str) -> Result<(), EngineError> {
        let paused = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some(control) = state.running.get(id) {
                control.pause();
                state.resume_after_pause.remove(id);
                debug!(task = %id, "pause requested");
                return Ok(());
            }
            let task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            match task.status {
                TaskStatus::Paused => return Ok(()),
                TaskStatus::Pending => {
                    task.set_status(TaskStatus::Paused);
                    task.clone()
                }
                status => {
                    return Err(EngineError::InvalidState {
                        id: id.to_string(),
                        status,
                        action: "pause",
                    });
                }
            }
        };

        self.shared.ctx.persist(&paused).await;
        self.shared.ctx.emit_status(&paused);
        Ok(())
    }

    /// Returns a paused task to the pending group.
    pub async fn resume(&self, id: &str) -> Result<(), EngineError> {
        let resumed = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some(control) = state.running.get(id) {
                if control.is_paused() {
                    state.resume_after_pause.insert(id.to_string());
                }
                return Ok(());
            }
            let task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            match task.status {
                TaskStatus::Pending => return Ok(()),
                TaskStatus::Paused => {
                    task.set_status(TaskStatus::Pending);
                    task.clone()
                }
                status => {
                    return Err(EngineError::InvalidState {
                        id: id.to_string(),
                        status,
                        action: "resume",
                    });
                }
            }
        };

        self.shared.ctx.persist(&resumed).await;
        self.shared.ctx.emit_status(&resumed);
        self.admit();
        Ok(())
    }

    /// Cancels a task and forgets it.
    ///
    /// A running task is interrupted and cleans up after itself. For any
    /// other task the upload session is aborted (best effort) and the
    /// staging file removed here.
    pub async fn cancel(&self, id: &str) -> Result<(), EngineError> {
        let mut task = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some(control) = state.running.get(id) {
                control.cancel();
                state.resume_after_pause.remove(id);
                debug!(task = %id, "cancel requested");
                return Ok(());
            }
            let status = state
                .tasks
                .get(id)
                .map(|t| t.status)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            if status == TaskStatus::Completed {
                return Err(EngineError::InvalidState {
                    id: id.to_string(),
                    status,
                    action: "cancel",
                });
            }
            state.forget(id)
        }
        .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

        self.release_resources(&mut task).await;
        self.shared.ctx.store.delete(id).await?;
        task.clear_parts();
        task.set_status(TaskStatus::Cancelled);
        info!(task = %id, "task cancelled");
        self.shared.ctx.emit_status(&task);
        Ok(())
    }

    /// Queues a failed task again. Recorded parts are reused where they
    /// are still valid.
    pub async fn retry(&self, id: &str) -> Result<(), EngineError> {
        let task = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            if task.status != TaskStatus::Failed {
                return Err(EngineError::InvalidState {
                    id: id.to_string(),
                    status: task.status,
                    action: "retry",
                });
            }
            task.error = None;
            task.set_status(TaskStatus::Pending);
            let snapshot = task.clone();
            state.failed.retain(|f| f != id);
            state.pending.push_back(id.to_string());
            snapshot
        };

        info!(task = %id, "task queued for retry");
        self.shared.ctx.persist(&task).await;
        self.shared.ctx.emit_status(&task);
        self.admit();
        Ok(())
    }

    /// Removes a completed or failed task and its record.
    pub async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let mut task = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let status = state
                .tasks
                .get(id)
                .map(|t| t.status)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            if !status.is_terminal() || state.running.contains_key(id) {
                return Err(EngineError::InvalidState {
                    id: id.to_string(),
                    status,
                    action: "remove",
                });
            }
            state.forget(id)
        }
        .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

        if task.status == TaskStatus::Failed {
            self.release_resources(&mut task).await;
        }
        self.shared.ctx.store.delete(id).await?;
        debug!(task = %id, "task removed");
        Ok(())
    }

    /// Drops every completed task. Returns how many were removed.
    pub async fn clear_completed(&self) -> Result<usize, EngineError> {
        let ids: Vec<String> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let ids = std::mem::take(&mut state.completed);
            for id in &ids {
                state.tasks.remove(id);
            }
            ids
        };
        for id in &ids {
            self.shared.ctx.store.delete(id).await?;
        }
        debug!(count = ids.len(), "completed tasks cleared");
        Ok(ids.len())
    }

    /// Snapshot of one task.
    pub fn task(&self, id: &str) -> Option<TransferTask> {
        self.lock().tasks.get(id).cloned()
    }

    /// Snapshot of every task, oldest first.
    pub fn tasks(&self) -> Vec<TransferTask> {
        let mut tasks: Vec<TransferTask> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn groups(&self) -> TaskGroups {
        let state = self.lock();
        let mut in_progress: Vec<String> = state.running.keys().cloned().collect();
        in_progress.sort();
        TaskGroups {
            pending: state.pending.iter().cloned().collect(),
            in_progress,
            completed: state.completed.clone(),
            failed: state.failed.clone(),
        }
    }

    /// Takes the observer stream. Only the first call returns `Some`.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransferEvent>> {
        self.shared
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// `true` when nothing is running and nothing admissible is queued.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.running.is_empty() && state.next_admissible().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn new_task(
        &self,
        direction: TransferDirection,
        local_path: PathBuf,
        bucket: &str,
        key: &str,
        total_size: u64,
        chunk_size: Option<u64>,
    ) -> Result<TransferTask, EngineError> {
        if bucket.is_empty() {
            return Err(EngineError::InvalidRequest("bucket must not be empty".into()));
        }
        validate_object_key(key).map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        if local_path.as_os_str().is_empty() {
            return Err(EngineError::InvalidRequest("local path must not be empty".into()));
        }

        let chunk_size = chunk_size.unwrap_or(self.shared.config.chunk_size);
        if chunk_size == 0 {
            return Err(EngineError::InvalidRequest(
                "chunk size must be greater than zero".into(),
            ));
        }
        let parts = total_size.div_ceil(chunk_size);
        if parts > MAX_PARTS {
            return Err(EngineError::InvalidRequest(format!(
                "{total_size} bytes in {chunk_size}-byte chunks needs {parts} parts, limit is {MAX_PARTS}"
            )));
        }

        Ok(TransferTask::new(
            direction,
            local_path,
            bucket,
            key,
            total_size,
            chunk_size,
            self.shared.config.part_concurrency,
        ))
    }

    async fn enqueue(&self, task: TransferTask) -> Result<String, EngineError> {
        self.shared.ctx.store.save(&task).await?;
        let id = task.id.clone();
        info!(
            task = %id,
            direction = ?task.direction,
            bucket = %task.bucket,
            key = %task.key,
            size = task.total_size,
            "task submitted"
        );
        self.shared.ctx.emit_status(&task);
        {
            let mut state = self.lock();
            state.pending.push_back(id.clone());
            state.tasks.insert(id.clone(), task);
        }
        self.admit();
        Ok(id)
    }

    /// Starts pending tasks while slots are free.
    fn admit(&self) {
        let cap = self.shared.config.max_concurrent_tasks;
        let mut starts = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            while state.running.len() < cap {
                let Some(pos) = state.next_admissible() else {
                    break;
                };
                let Some(id) = state.pending.remove(pos) else {
                    break;
                };
                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                task.set_status(TaskStatus::Running);
                let control = RunControl::new();
                state.running.insert(id.clone(), control.clone());
                starts.push((task.clone(), control));
            }
        }

        for (task, control) in starts {
            debug!(task = %task.id, "task admitted");
            self.shared.ctx.emit_status(&task);
            self.spawn_run(task, control);
        }
    }

    fn spawn_run(&self, task: TransferTask, control: RunControl) {
        let scheduler = self.clone();
        let fallback = task.clone();
        let machine = TransferStateMachine::new(task, Arc::clone(&self.shared.ctx), control);
        let handle = tokio::spawn(machine.run());
        tokio::spawn(async move {
            match handle.await {
                Ok((task, outcome)) => scheduler.finish(task, outcome).await,
                Err(e) => {
                    error!(task = %fallback.id, error = %e, "transfer worker died");
                    let mut task = fallback;
                    let message = format!("worker failed: {e}");
                    task.error = Some(message.clone());
                    task.set_status(TaskStatus::Failed);
                    scheduler.shared.ctx.persist(&task).await;
                    scheduler.finish(task, RunOutcome::Failed(message)).await;
                }
            }
        });
    }

    /// Files a finished run into its group and admits the next task.
    async fn finish(&self, mut task: TransferTask, outcome: RunOutcome) {
        let id = task.id.clone();
        let requeued = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.running.remove(&id);
            let resume = state.resume_after_pause.remove(&id);
            let mut requeued = false;
            match &outcome {
                RunOutcome::Completed => state.completed.push(id.clone()),
                RunOutcome::Failed(_) => state.failed.push(id.clone()),
                RunOutcome::Paused => {
                    if resume {
                        task.set_status(TaskStatus::Pending);
                        requeued = true;
                    }
                    state.pending.push_front(id.clone());
                }
                RunOutcome::Cancelled => {}
            }
            if outcome == RunOutcome::Cancelled {
                state.tasks.remove(&id);
            } else {
                state.tasks.insert(id.clone(), task.clone());
            }
            requeued
        };

        if outcome == RunOutcome::Cancelled {
            if let Err(e) = self.shared.ctx.store.delete(&id).await {
                warn!(task = %id, error = %e, "failed to delete cancelled record");
            }
        } else if requeued {
            self.shared.ctx.persist(&task).await;
        }

        self.shared.ctx.emit_status(&task);
        self.admit();
    }

    /// Best-effort cleanup of provider and local state for a task that is
    /// not running.
    async fn release_resources(&self, task: &mut TransferTask) {
        match task.direction {
            TransferDirection::Upload => {
                if let Some(upload_id) = task.session_id.take() {
                    let client = self.shared.ctx.executor.client();
                    if let Err(e) = client
                        .abort_multipart(&task.bucket, &task.key, &upload_id)
                        .await
                    {
                        warn!(
                            task = %task.id,
                            upload_id = %upload_id,
                            error = %e,
                            "failed to abort upload session"
                        );
                    }
                }
            }
            TransferDirection::Download => {
                if let Err(e) = remove_staging(&task.local_path).await {
                    warn!(task = %task.id, error = %e, "failed to remove staging file");
                }
            }
        }
    }
}

impl State {
    /// Position in `pending` of the first task that is not paused.
    fn next_admissible(&self) -> Option<usize> {
        self.pending.iter().position(|id| {
            self.tasks
                .get(id)
                .is_some_and(|t| t.status == TaskStatus::Pending)
        })
    }

    /// Removes `id` from every group and returns its task.
    fn forget(&mut self, id: &str) -> Option<TransferTask> {
        self.pending.retain(|p| p != id);
        self.completed.retain(|c| c != id);
        self.failed.retain(|f| f != id);
        self.resume_after_pause.remove(id);
        self.tasks.remove(id)
    }
}
