//! Per-task transfer state machine.
//!
//! One [`TransferStateMachine`] drives one attempt of one task:
//!
//! ```text
//! Idle -> Initiating -> Transferring -> Completing -> Completed
//!              |              |              |
//!              +--------------+--------------+--> Failed | Cancelled
//!                             +--> Paused
//! ```
//!
//! The task record is persisted on every transition and after every part,
//! so a later attempt (or a restarted process) only transfers what is
//! missing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cloudxfer_client::PartExecutor;
use cloudxfer_protocol::{
    ChunkDescriptor, PartResult, TaskStatus, TransferDirection, TransferEvent, TransferTask,
};
use cloudxfer_transfer::{
    ChunkReader, ChunkWriter, ProgressThrottler, TransferError, plan_chunks, remove_staging,
    staging_path,
};

use crate::{EngineError, TaskStore};

/// How one run of a state machine ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Paused,
    Cancelled,
    Failed(String),
}

impl RunOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            RunOutcome::Completed => TaskStatus::Completed,
            RunOutcome::Paused => TaskStatus::Paused,
            RunOutcome::Cancelled => TaskStatus::Cancelled,
            RunOutcome::Failed(_) => TaskStatus::Failed,
        }
    }
}

/// Pause and cancel signals for one run.
///
/// Pause is cooperative: parts already in flight finish and are recorded.
/// Cancel interrupts in-flight parts.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    pause: CancellationToken,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.pause.cancel();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Shared services every state machine runs against.
pub struct EngineContext {
    pub executor: PartExecutor,
    pub store: TaskStore,
    pub events: mpsc::UnboundedSender<TransferEvent>,
    pub progress_interval: Duration,
}

impl EngineContext {
    /// Emits a status event for `task`. Never blocks.
    pub fn emit_status(&self, task: &TransferTask) {
        let event = TransferEvent::Status {
            task_id: task.id.clone(),
            status: task.status,
            error: task.error.clone(),
        };
        if self.events.send(event).is_err() {
            debug!(task = %task.id, status = %task.status, "no event receiver");
        }
    }

    /// Saves `task`, logging instead of failing.
    pub async fn persist(&self, task: &TransferTask) {
        if let Err(e) = self.store.save(task).await {
            warn!(task = %task.id, error = %e, "failed to persist task record");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Initiating,
    Transferring,
    Completing,
}

/// Result of the transferring phase when no error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Done,
    Paused,
    Cancelled,
}

/// What a part worker does with its descriptor.
#[derive(Clone)]
enum PartJob {
    Upload {
        reader: Arc<ChunkReader>,
        upload_id: Arc<str>,
    },
    Download {
        writer: Arc<ChunkWriter>,
    },
}

impl PartJob {
    async fn run(
        self,
        executor: PartExecutor,
        bucket: Arc<str>,
        key: Arc<str>,
        chunk: ChunkDescriptor,
        cancel: CancellationToken,
    ) -> Result<PartResult, EngineError> {
        match self {
            PartJob::Upload { reader, upload_id } => {
                let body = reader.read_chunk(&chunk).await?;
                let part = executor
                    .upload_part(&bucket, &key, &upload_id, &chunk, body, &cancel)
                    .await?;
                Ok(part)
            }
            PartJob::Download { writer } => {
                let (part, data) = executor
                    .download_part(&bucket, &key, &chunk, &cancel)
                    .await?;
                writer.write_chunk(&chunk, &data).await?;
                Ok(part)
            }
        }
    }
}

/// Drives one task through a single attempt.
pub struct TransferStateMachine {
    task: TransferTask,
    ctx: Arc<EngineContext>,
    control: RunControl,
    phase: Phase,
}

impl TransferStateMachine {
    pub fn new(task: TransferTask, ctx: Arc<EngineContext>, control: RunControl) -> Self {
        Self {
            task,
            ctx,
            control,
            phase: Phase::Idle,
        }
    }

    /// Runs until the task completes, fails, pauses or is cancelled, and
    /// returns the final record.
    pub async fn run(mut self) -> (TransferTask, RunOutcome) {
        self.normalize_resume_state().await;

        let throttler = ProgressThrottler::start(
            self.task.id.clone(),
            self.task.transferred_bytes,
            self.task.total_size,
            self.ctx.progress_interval,
            self.ctx.events.clone(),
        );

        self.task.error = None;
        self.task.set_status(TaskStatus::Running);
        self.ctx.persist(&self.task).await;
        info!(
            task = %self.task.id,
            direction = ?self.task.direction,
            bucket = %self.task.bucket,
            key = %self.task.key,
            size = self.task.total_size,
            resumed_parts = self.task.parts.len(),
            "transfer started"
        );

        let result = if self.control.is_cancelled() {
            Ok(Flow::Cancelled)
        } else {
            match self.task.direction {
                TransferDirection::Upload => self.run_upload(&throttler).await,
                TransferDirection::Download => self.run_download(&throttler).await,
            }
        };

        // Settling may clear the part records; the stream keeps what it reported.
        let streamed = throttler.transferred();
        let outcome = self.settle(result).await;
        let final_bytes = match outcome {
            RunOutcome::Completed => self.task.total_size,
            _ => streamed.max(self.task.transferred_bytes),
        };
        throttler.finish(final_bytes).await;
        self.ctx.persist(&self.task).await;

        (self.task, outcome)
    }

    fn enter(&mut self, phase: Phase) {
        debug!(task = %self.task.id, from = ?self.phase, to = ?phase, "phase change");
        self.phase = phase;
    }

    /// Drops part records that can no longer be trusted.
    async fn normalize_resume_state(&mut self) {
        match self.task.direction {
            TransferDirection::Upload => {
                if self.task.session_id.is_none() && !self.task.parts.is_empty() {
                    debug!(task = %self.task.id, "no upload session on record, restarting parts");
                    self.task.clear_parts();
                }
            }
            TransferDirection::Download => {
                if !self.task.parts.is_empty() {
                    let staged = tokio::fs::try_exists(staging_path(&self.task.local_path))
                        .await
                        .unwrap_or(false);
                    if !staged {
                        debug!(task = %self.task.id, "staging file missing, restarting parts");
                        self.task.clear_parts();
                    }
                }
            }
        }
        self.task.transferred_bytes = self.task.completed_bytes();
    }

    async fn run_upload(&mut self, throttler: &ProgressThrottler) -> Result<Flow, EngineError> {
        self.enter(Phase::Initiating);
        let client = Arc::clone(self.ctx.executor.client());

        let reader = ChunkReader::open(&self.task.local_path).await?;
        if reader.file_size() != self.task.total_size {
            return Err(EngineError::Consistency(format!(
                "{} is {} bytes, task declares {}",
                self.task.local_path.display(),
                reader.file_size(),
                self.task.total_size
            )));
        }

        if self.task.total_size == 0 {
            client
                .put_object(&self.task.bucket, &self.task.key, Vec::new(), None)
                .await?;
            return Ok(Flow::Done);
        }

        let upload_id = match self.task.session_id.clone() {
            Some(id) => {
                debug!(task = %self.task.id, upload_id = %id, "resuming upload session");
                id
            }
            None => {
                let id = client
                    .initiate_multipart(&self.task.bucket, &self.task.key)
                    .await?;
                debug!(task = %self.task.id, upload_id = %id, "upload session started");
                self.task.clear_parts();
                self.task.session_id = Some(id.clone());
                self.ctx.persist(&self.task).await;
                id
            }
        };
        if self.control.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        let plan = plan_chunks(self.task.total_size, self.task.chunk_size)?;
        self.enter(Phase::Transferring);
        let job = PartJob::Upload {
            reader: Arc::new(reader),
            upload_id: Arc::from(upload_id.as_str()),
        };
        let flow = self.transfer_parts(&plan, job, throttler).await?;
        if flow != Flow::Done {
            return Ok(flow);
        }

        self.enter(Phase::Completing);
        let parts = ordered_parts(&self.task.parts, &plan)?;
        let etag = client
            .complete_multipart(&self.task.bucket, &self.task.key, &upload_id, &parts)
            .await?;
        self.task.parts = parts;
        debug!(task = %self.task.id, etag = %etag, "multipart upload completed");
        Ok(Flow::Done)
    }

    async fn run_download(&mut self, throttler: &ProgressThrottler) -> Result<Flow, EngineError> {
        self.enter(Phase::Initiating);
        let client = Arc::clone(self.ctx.executor.client());

        let meta = client.head_object(&self.task.bucket, &self.task.key).await?;
        let remote = meta.size.ok_or_else(|| {
            EngineError::Consistency(format!(
                "HEAD {}/{} returned no Content-Length",
                self.task.bucket, self.task.key
            ))
        })?;
        if remote == 0 && self.task.total_size != 0 {
            return Err(EngineError::Consistency(format!(
                "remote object is empty, expected {} bytes",
                self.task.total_size
            )));
        }
        if remote != self.task.total_size {
            return Err(EngineError::Consistency(format!(
                "remote object is {remote} bytes, task declares {}",
                self.task.total_size
            )));
        }
        if self.control.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        let dest = self.task.local_path.clone();
        if self.task.total_size == 0 {
            if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, b"").await?;
            remove_staging(&dest).await?;
            return Ok(Flow::Done);
        }

        let writer = ChunkWriter::create(&dest, self.task.total_size, self.task.parts.is_empty())
            .await?;
        let plan = plan_chunks(self.task.total_size, self.task.chunk_size)?;
        self.enter(Phase::Transferring);
        let job = PartJob::Download {
            writer: Arc::new(writer.clone()),
        };
        let flow = self.transfer_parts(&plan, job, throttler).await?;
        if flow != Flow::Done {
            return Ok(flow);
        }

        self.enter(Phase::Completing);
        let parts = ordered_parts(&self.task.parts, &plan)?;
        writer.verify(&plan, &parts).await?;
        writer.finalize().await?;
        self.task.parts = parts;
        Ok(Flow::Done)
    }

    /// Transfers every planned part not yet on record through a bounded pool.
    async fn transfer_parts(
        &mut self,
        plan: &[ChunkDescriptor],
        job: PartJob,
        throttler: &ProgressThrottler,
    ) -> Result<Flow, EngineError> {
        let mut pending: VecDeque<ChunkDescriptor> = plan
            .iter()
            .filter(|c| !self.task.has_part(c.part_number))
            .copied()
            .collect();
        debug!(
            task = %self.task.id,
            planned = plan.len(),
            pending = pending.len(),
            "dispatching parts"
        );

        let limit = self.task.part_concurrency.max(1);
        let workers = self.control.cancel.child_token();
        let bucket: Arc<str> = Arc::from(self.task.bucket.as_str());
        let key: Arc<str> = Arc::from(self.task.key.as_str());
        let mut set = JoinSet::new();
        let mut failure: Option<EngineError> = None;

        loop {
            while failure.is_none()
                && set.len() < limit
                && !self.control.is_paused()
                && !self.control.is_cancelled()
            {
                let Some(chunk) = pending.pop_front() else {
                    break;
                };
                set.spawn(job.clone().run(
                    self.ctx.executor.clone(),
                    Arc::clone(&bucket),
                    Arc::clone(&key),
                    chunk,
                    workers.clone(),
                ));
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok(part)) => self.record_part(part, throttler).await,
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => {
                    if failure.is_none() {
                        warn!(task = %self.task.id, error = %e, "part failed, stopping workers");
                        workers.cancel();
                        failure = Some(e);
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        workers.cancel();
                        failure = Some(EngineError::Worker(e.to_string()));
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if self.control.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        if !pending.is_empty() {
            return Ok(Flow::Paused);
        }
        Ok(Flow::Done)
    }

    async fn record_part(&mut self, part: PartResult, throttler: &ProgressThrottler) {
        let part_number = part.part_number;
        let length = part.length;
        if !self.task.record_part(part) {
            return;
        }
        throttler.record(length);
        debug!(
            task = %self.task.id,
            part = part_number,
            transferred = self.task.transferred_bytes,
            "part recorded"
        );
        self.ctx.persist(&self.task).await;
    }

    async fn settle(&mut self, result: Result<Flow, EngineError>) -> RunOutcome {
        match result {
            Ok(Flow::Done) => {
                self.task.transferred_bytes = self.task.total_size;
                self.task.error = None;
                self.task.set_status(TaskStatus::Completed);
                info!(task = %self.task.id, bytes = self.task.total_size, "transfer completed");
                RunOutcome::Completed
            }
            Ok(Flow::Paused) => {
                self.task.set_status(TaskStatus::Paused);
                info!(
                    task = %self.task.id,
                    parts = self.task.parts.len(),
                    transferred = self.task.transferred_bytes,
                    "transfer paused"
                );
                RunOutcome::Paused
            }
            Ok(Flow::Cancelled) => self.cancelled().await,
            Err(e) if e.is_cancelled() => self.cancelled().await,
            Err(e) => self.failed(e).await,
        }
    }

    async fn cancelled(&mut self) -> RunOutcome {
        match self.task.direction {
            TransferDirection::Upload => self.abort_session().await,
            TransferDirection::Download => {
                if let Err(e) = remove_staging(&self.task.local_path).await {
                    warn!(task = %self.task.id, error = %e, "failed to remove staging file");
                }
            }
        }
        self.task.clear_parts();
        self.task.session_id = None;
        self.task.set_status(TaskStatus::Cancelled);
        info!(task = %self.task.id, "transfer cancelled");
        RunOutcome::Cancelled
    }

    async fn failed(&mut self, err: EngineError) -> RunOutcome {
        let message = err.to_string();
        error!(task = %self.task.id, phase = ?self.phase, error = %message, "transfer failed");

        match self.task.direction {
            TransferDirection::Upload => {
                self.abort_session().await;
                self.task.clear_parts();
            }
            TransferDirection::Download => {
                // Staged bytes that fail verification cannot seed a resume.
                if matches!(
                    err,
                    EngineError::Transfer(TransferError::ChecksumMismatch { .. })
                ) {
                    self.task.clear_parts();
                    if let Err(e) = remove_staging(&self.task.local_path).await {
                        warn!(task = %self.task.id, error = %e, "failed to remove staging file");
                    }
                }
            }
        }

        self.task.error = Some(message.clone());
        self.task.set_status(TaskStatus::Failed);
        RunOutcome::Failed(message)
    }

    /// Aborts the recorded upload session, if any. Failures are logged only.
    async fn abort_session(&mut self) {
        let Some(upload_id) = self.task.session_id.take() else {
            return;
        };
        let client = self.ctx.executor.client();
        match client
            .abort_multipart(&self.task.bucket, &self.task.key, &upload_id)
            .await
        {
            Ok(()) => debug!(task = %self.task.id, upload_id = %upload_id, "upload session aborted"),
            Err(e) => warn!(
                task = %self.task.id,
                upload_id = %upload_id,
                error = %e,
                "failed to abort upload session"
            ),
        }
    }
}

/// Sorts the recorded parts and checks they cover `plan` exactly.
fn ordered_parts(
    parts: &[PartResult],
    plan: &[ChunkDescriptor],
) -> Result<Vec<PartResult>, EngineError> {
    let mut sorted: Vec<PartResult> = parts.iter().filter(|p| p.succeeded).cloned().collect();
    sorted.sort_by_key(|p| p.part_number);
    sorted.dedup_by_key(|p| p.part_number);

    if sorted.len() != plan.len() {
        return Err(EngineError::Consistency(format!(
            "{} of {} parts recorded",
            sorted.len(),
            plan.len()
        )));
    }
    for (part, chunk) in sorted.iter().zip(plan) {
        if part.part_number != chunk.part_number || part.length != chunk.length {
            return Err(EngineError::Consistency(format!(
                "part {} does not match planned part {}",
                part.part_number, chunk.part_number
            )));
        }
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(n: u32, length: u64) -> PartResult {
        PartResult {
            part_number: n,
            tag: format!("\"{n}\""),
            length,
            succeeded: true,
            degraded: false,
        }
    }

    #[test]
    fn ordered_parts_sorts_out_of_order_completions() {
        let plan = plan_chunks(25, 10).unwrap();
        let parts = vec![part(3, 5), part(1, 10), part(2, 10)];
        let ordered = ordered_parts(&parts, &plan).unwrap();
        let numbers: Vec<u32> = ordered.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn ordered_parts_rejects_gaps() {
        let plan = plan_chunks(25, 10).unwrap();
        let parts = vec![part(1, 10), part(3, 5)];
        assert!(matches!(
            ordered_parts(&parts, &plan),
            Err(EngineError::Consistency(_))
        ));
    }

    #[test]
    fn ordered_parts_rejects_length_mismatch() {
        let plan = plan_chunks(25, 10).unwrap();
        let parts = vec![part(1, 10), part(2, 10), part(3, 4)];
        assert!(ordered_parts(&parts, &plan).is_err());
    }

    #[test]
    fn ordered_parts_ignores_unsuccessful_records() {
        let plan = plan_chunks(20, 10).unwrap();
        let mut failed = part(2, 10);
        failed.succeeded = false;
        assert!(ordered_parts(&[part(1, 10), failed], &plan).is_err());
    }

    #[test]
    fn run_control_signals() {
        let control = RunControl::new();
        let other = control.clone();
        assert!(!control.is_paused());
        other.pause();
        assert!(control.is_paused());
        assert!(!control.is_cancelled());
        other.cancel();
        assert!(control.is_cancelled());
    }

    #[test]
    fn outcome_status_mapping() {
        assert_eq!(RunOutcome::Completed.status(), TaskStatus::Completed);
        assert_eq!(RunOutcome::Paused.status(), TaskStatus::Paused);
        assert_eq!(RunOutcome::Failed("x".into()).status(), TaskStatus::Failed);
    }
}
