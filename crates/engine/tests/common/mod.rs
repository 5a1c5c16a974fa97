#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use cloudxfer_client::ObjectClient;
use cloudxfer_client::testing::MemoryStore;
use cloudxfer_engine::{EngineConfig, RetryConfig, TransferScheduler};
use cloudxfer_protocol::{Credential, ProviderKind, TaskStatus, TransferEvent};

pub const CHUNK: u64 = 64 * 1024;
pub const BUCKET: &str = "media";

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn config(state_dir: &Path) -> EngineConfig {
    EngineConfig {
        provider: ProviderKind::S3,
        endpoint: "http://mem.test".into(),
        path_style: true,
        region: "us-east-1".into(),
        chunk_size: CHUNK,
        part_concurrency: 3,
        max_concurrent_tasks: 2,
        progress_interval_ms: 10,
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        },
        request_timeout_secs: 5,
        state_dir: state_dir.to_path_buf(),
    }
}

pub fn client(store: &Arc<MemoryStore>) -> Arc<ObjectClient> {
    let credential = Credential::new(store.provider(), "AKIDEXAMPLE", "secret", "us-east-1");
    Arc::new(ObjectClient::new(
        store.clone(),
        store.endpoint(),
        credential,
    ))
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub dir: TempDir,
    pub scheduler: TransferScheduler,
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
}

impl Harness {
    pub fn new(provider: ProviderKind) -> Self {
        Self::with_config(provider, |_| {})
    }

    pub fn with_config(provider: ProviderKind, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let store = Arc::new(MemoryStore::new(provider));
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir.path().join("state"));
        cfg.provider = provider;
        tweak(&mut cfg);
        let scheduler = TransferScheduler::new(cfg, client(&store)).unwrap();
        let events = scheduler.take_events().unwrap();
        Self {
            store,
            dir,
            scheduler,
            events,
        }
    }

    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    pub async fn wait(&mut self, id: &str, status: TaskStatus) -> Vec<TransferEvent> {
        wait_for(&mut self.events, id, status).await
    }
}

/// Collects events until `id` reports `status`.
pub async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    id: &str,
    status: TaskStatus,
) -> Vec<TransferEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(event) = events.recv().await {
            let done = matches!(
                &event,
                TransferEvent::Status { task_id, status: s, .. } if task_id == id && *s == status
            );
            seen.push(event);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    match result {
        Ok(true) => seen,
        Ok(false) => panic!("event stream closed before {id} became {status}"),
        Err(_) => panic!("timed out waiting for {id} to become {status}; saw {seen:?}"),
    }
}

/// Progress byte counts reported for `id`, in order.
pub fn progress_of(events: &[TransferEvent], id: &str) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::Progress {
                task_id,
                transferred_bytes,
                ..
            } if task_id == id => Some(*transferred_bytes),
            _ => None,
        })
        .collect()
}

/// Status values reported for `id`, in order.
pub fn statuses_of(events: &[TransferEvent], id: &str) -> Vec<TaskStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::Status {
                task_id, status, ..
            } if task_id == id => Some(*status),
            _ => None,
        })
        .collect()
}
