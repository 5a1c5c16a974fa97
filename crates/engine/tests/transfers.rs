mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cloudxfer_client::testing::MemoryStore;
use cloudxfer_engine::{EngineError, TransferScheduler};
use cloudxfer_protocol::{ProviderKind, TaskStatus, TransferEvent};
use cloudxfer_transfer::staging_path;

use common::{BUCKET, CHUNK, Harness, client, config, pattern, progress_of, statuses_of};

fn assert_monotonic(progress: &[u64]) {
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
}

async fn round_trip(provider: ProviderKind, len: usize) {
    let mut h = Harness::new(provider);
    let data = pattern(len);
    let source = h.path("source.bin");
    std::fs::write(&source, &data).unwrap();

    let key = format!("round/{len}.bin");
    let up = h
        .scheduler
        .submit_upload(&source, BUCKET, &key, len as u64, None)
        .await
        .unwrap();
    h.wait(&up, TaskStatus::Completed).await;
    assert_eq!(h.store.object(BUCKET, &key).unwrap(), data);
    assert_eq!(h.store.open_uploads(), 0);

    let dest = h.path("out/copy.bin");
    let down = h
        .scheduler
        .submit_download(BUCKET, &key, len as u64, &dest, None)
        .await
        .unwrap();
    let events = h.wait(&down, TaskStatus::Completed).await;
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(!staging_path(&dest).exists());

    let progress = progress_of(&events, &down);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last().copied(), Some(len as u64));

    let task = h.scheduler.task(&down).unwrap();
    assert_eq!(task.transferred_bytes, len as u64);
    assert!(task.completed_at.is_some());
    assert_eq!(h.scheduler.groups().completed, vec![up, down]);
}

#[tokio::test]
async fn round_trip_empty_object() {
    round_trip(ProviderKind::S3, 0).await;
    round_trip(ProviderKind::Oss, 0).await;
}

#[tokio::test]
async fn round_trip_below_one_chunk() {
    round_trip(ProviderKind::S3, 1000).await;
    round_trip(ProviderKind::Oss, 1000).await;
}

#[tokio::test]
async fn round_trip_multi_chunk() {
    let len = CHUNK as usize * 4 + 123;
    round_trip(ProviderKind::S3, len).await;
    round_trip(ProviderKind::Oss, len).await;
}

#[tokio::test]
async fn empty_upload_is_a_single_put() {
    let mut h = Harness::new(ProviderKind::S3);
    let source = h.path("empty.bin");
    std::fs::write(&source, b"").unwrap();

    let id = h
        .scheduler
        .submit_upload(&source, BUCKET, "empty", 0, None)
        .await
        .unwrap();
    h.wait(&id, TaskStatus::Completed).await;
    assert_eq!(h.store.upload_part_requests(), 0);
    assert_eq!(h.store.total_requests(), 1);
    assert_eq!(h.store.object(BUCKET, "empty").unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn transient_part_failures_are_retried() {
    let mut h = Harness::new(ProviderKind::S3);
    let len = CHUNK as usize * 2 + 1000;
    let data = pattern(len);
    let source = h.path("three.bin");
    std::fs::write(&source, &data).unwrap();
    h.store.inject_upload_fault(2, 2);

    let id = h
        .scheduler
        .submit_upload(&source, BUCKET, "three.bin", len as u64, None)
        .await
        .unwrap();
    h.wait(&id, TaskStatus::Completed).await;

    let task = h.scheduler.task(&id).unwrap();
    assert_eq!(task.transferred_bytes, len as u64);
    let numbers: Vec<u32> = task.parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(h.store.upload_part_requests(), 5);
    assert_eq!(h.store.object(BUCKET, "three.bin").unwrap(), data);
}

#[tokio::test]
async fn exhausted_retries_fail_and_abort_the_session() {
    let mut h = Harness::new(ProviderKind::S3);
    let len = CHUNK as usize * 2;
    let source = h.path("doomed.bin");
    std::fs::write(&source, pattern(len)).unwrap();
    h.store.inject_upload_fault(1, 10);

    let id = h
        .scheduler
        .submit_upload(&source, BUCKET, "doomed.bin", len as u64, None)
        .await
        .unwrap();
    let events = h.wait(&id, TaskStatus::Failed).await;

    let task = h.scheduler.task(&id).unwrap();
    assert!(task.error.is_some());
    assert!(task.session_id.is_none());
    assert!(task.parts.is_empty());
    assert_eq!(h.store.abort_requests(), 1);
    assert_eq!(h.store.open_uploads(), 0);
    assert_eq!(h.scheduler.groups().failed, vec![id.clone()]);
    assert_eq!(
        statuses_of(&events, &id),
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Failed]
    );
}

#[tokio::test]
async fn failed_upload_progress_never_goes_back() {
    let mut h = Harness::new(ProviderKind::S3);
    let len = CHUNK as usize * 2 + 1000;
    let source = h.path("partial.bin");
    std::fs::write(&source, pattern(len)).unwrap();
    h.store.set_delay(Duration::from_millis(40));
    h.store.inject_upload_fault(3, 10);

    let id = h
        .scheduler
        .submit_upload(&source, BUCKET, "partial.bin", len as u64, None)
        .await
        .unwrap();
    let events = h.wait(&id, TaskStatus::Failed).await;

    let progress = progress_of(&events, &id);
    assert_monotonic(&progress);
    assert_eq!(progress.last().copied(), Some(2 * CHUNK));
    // The record is reset for the next attempt; the stream is not.
    assert_eq!(h.scheduler.task(&id).unwrap().transferred_bytes, 0);
}

#[tokio::test]
async fn cancelled_upload_progress_never_goes_back() {
    let mut h = Harness::with_config(ProviderKind::S3, |c| c.part_concurrency = 1);
    let len = CHUNK as usize * 6;
    let source = h.path("six.bin");
    std::fs::write(&source, pattern(len)).unwrap();
    h.store.set_delay(Duration::from_millis(60));

    let id = h
        .scheduler
        .submit_upload(&source, BUCKET, "six.bin", len as u64, None)
        .await
        .unwrap();
    let mut events = h.wait(&id, TaskStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    h.scheduler.cancel(&id).await.unwrap();
    events.extend(h.wait(&id, TaskStatus::Cancelled).await);

    let progress = progress_of(&events, &id);
    assert_monotonic(&progress);
    let last = progress.last().copied().unwrap();
    assert!(last >= CHUNK && last < len as u64, "{progress:?}");
}

#[tokio::test]
async fn unobserved_scheduler_keeps_admitting() {
    let store = Arc::new(MemoryStore::new(ProviderKind::S3));
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir.path().join("state"));
    cfg.max_concurrent_tasks = 4;
    let scheduler = TransferScheduler::new(cfg, client(&store)).unwrap();

    let source = dir.path().join("byte.bin");
    std::fs::write(&source, b"x").unwrap();
    let total = 300;
    for i in 0..total {
        scheduler
            .submit_upload(&source, BUCKET, &format!("tiny/{i}"), 1, None)
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(20), async {
        while scheduler.groups().completed.len() < total {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("stalled: {:?}", scheduler.groups().completed.len()));
    assert!(scheduler.is_idle());

    // Nothing was dropped while nobody was reading.
    let mut events = scheduler.take_events().unwrap();
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            TransferEvent::Status {
                status: TaskStatus::Completed,
                ..
            }
        ) {
            completed += 1;
        }
    }
    assert_eq!(completed, total);
}

#[tokio::test]
async fn declared_size_mismatch_fails_download() {
    let mut h = Harness::new(ProviderKind::Oss);
    h.store.put(BUCKET, "sized", pattern(500));

    let id = h
        .scheduler
        .submit_download(BUCKET, "sized", 400, h.path("sized.bin"), None)
        .await
        .unwrap();
    h.wait(&id, TaskStatus::Failed).await;
    let task = h.scheduler.task(&id).unwrap();
    assert!(task.error.unwrap().contains("500"));
    assert_eq!(h.store.range_requests(), 0);
}

#[tokio::test]
async fn empty_remote_with_declared_size_fails() {
    let mut h = Harness::new(ProviderKind::S3);
    h.store.put(BUCKET, "hollow", Vec::new());

    let id = h
        .scheduler
        .submit_download(BUCKET, "hollow", 10, h.path("hollow.bin"), None)
        .await
        .unwrap();
    h.wait(&id, TaskStatus::Failed).await;
    assert!(!h.path("hollow.bin").exists());
}

#[tokio::test]
async fn retry_after_failure_completes() {
    let mut h = Harness::new(ProviderKind::S3);
    let data = pattern(CHUNK as usize + 17);
    h.store.put(BUCKET, "flaky", data.clone());
    h.store.set_omit_head_length(true);

    let dest = h.path("flaky.bin");
    let id = h
        .scheduler
        .submit_download(BUCKET, "flaky", data.len() as u64, &dest, None)
        .await
        .unwrap();
    h.wait(&id, TaskStatus::Failed).await;
    let task = h.scheduler.task(&id).unwrap();
    assert!(task.error.unwrap().contains("Content-Length"));

    let err = h.scheduler.resume(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));

    h.store.set_omit_head_length(false);
    h.scheduler.retry(&id).await.unwrap();
    h.wait(&id, TaskStatus::Completed).await;
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(h.scheduler.groups().failed.is_empty());

    let err = h.scheduler.retry(&id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: TaskStatus::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn complete_with_error_document_fails() {
    let mut h = Harness::new(ProviderKind::S3);
    let len = CHUNK as usize + 1;
    let source = h.path("rejected.bin");
    std::fs::write(&source, pattern(len)).unwrap();
    h.store.fail_complete_with_ok_error(true);

    let id = h
        .scheduler
        .submit_upload(&source, BUCKET, "rejected.bin", len as u64, None)
        .await
        .unwrap();
    h.wait(&id, TaskStatus::Failed).await;
    assert!(h.store.object(BUCKET, "rejected.bin").is_none());
}

#[tokio::test]
async fn cancel_stops_in_flight_parts_and_aborts() {
    let mut h = Harness::new(ProviderKind::S3);
    let len = CHUNK as usize * 5;
    let source = h.path("big.bin");
    std::fs::write(&source, pattern(len)).unwrap();
    h.store.set_delay(Duration::from_millis(200));

    let id = h
        .scheduler
        .submit_upload(&source, BUCKET, "big.bin", len as u64, None)
        .await
        .unwrap();
    h.wait(&id, TaskStatus::Running).await;
    // Initiate takes one delay; the first batch of parts is in flight after it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.scheduler.cancel(&id).await.unwrap();
    h.wait(&id, TaskStatus::Cancelled).await;

    let parts_sent = h.store.upload_part_requests();
    assert!(parts_sent <= 3, "{parts_sent}");
    assert_eq!(h.store.abort_requests(), 1);
    assert_eq!(h.store.open_uploads(), 0);
    assert!(h.store.object(BUCKET, "big.bin").is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.store.upload_part_requests(), parts_sent);
    assert!(h.scheduler.task(&id).is_none());
    assert!(h.scheduler.groups().in_progress.is_empty());
    assert!(!h.path("state/tasks").join(format!("{id}.json")).exists());
}

#[tokio::test]
async fn cancel_download_removes_staging() {
    let mut h = Harness::new(ProviderKind::Oss);
    let len = CHUNK as usize * 4;
    h.store.put(BUCKET, "movie", pattern(len));
    h.store.set_delay(Duration::from_millis(150));

    let dest = h.path("movie.bin");
    let id = h
        .scheduler
        .submit_download(BUCKET, "movie", len as u64, &dest, None)
        .await
        .unwrap();
    h.wait(&id, TaskStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(220)).await;
    h.scheduler.cancel(&id).await.unwrap();
    h.wait(&id, TaskStatus::Cancelled).await;

    assert!(!staging_path(&dest).exists());
    assert!(!dest.exists());
}

#[tokio::test]
async fn pause_lets_in_flight_parts_finish_then_resume_completes() {
    let mut h = Harness::new(ProviderKind::S3);
    let len = CHUNK as usize * 5;
    let data = pattern(len);
    let source = h.path("paused.bin");
    std::fs::write(&source, &data).unwrap();
    h.store.set_delay(Duration::from_millis(200));

    let id = h
        .scheduler
        .submit_upload(&source, BUCKET, "paused.bin", len as u64, None)
        .await
        .unwrap();
    h.wait(&id, TaskStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.scheduler.pause(&id).await.unwrap();
    h.wait(&id, TaskStatus::Paused).await;

    let paused = h.scheduler.task(&id).unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert!(paused.session_id.is_some());
    assert!(!paused.parts.is_empty() && paused.parts.len() < 5);
    assert_eq!(paused.transferred_bytes, paused.parts.len() as u64 * CHUNK);
    assert_eq!(h.scheduler.groups().pending, vec![id.clone()]);
    assert_eq!(h.store.abort_requests(), 0);

    h.store.set_delay(Duration::ZERO);
    h.scheduler.resume(&id).await.unwrap();
    h.wait(&id, TaskStatus::Completed).await;
    assert_eq!(h.store.upload_part_requests(), 5);
    assert_eq!(h.store.object(BUCKET, "paused.bin").unwrap(), data);
}

#[tokio::test]
async fn pending_tasks_admit_in_fifo_order_under_the_cap() {
    let mut h = Harness::with_config(ProviderKind::S3, |c| {
        c.max_concurrent_tasks = 1;
        c.part_concurrency = 1;
    });
    let mut ids = Vec::new();
    for n in 0..3 {
        let key = format!("queue/{n}");
        h.store.put(BUCKET, &key, pattern(1000 + n));
        let id = h
            .scheduler
            .submit_download(BUCKET, &key, 1000 + n as u64, h.path(&format!("q{n}.bin")), None)
            .await
            .unwrap();
        ids.push(id);
    }
    let events = h.wait(&ids[2], TaskStatus::Completed).await;

    let order: Vec<(String, TaskStatus)> = events
        .iter()
        .filter_map(|e| match e {
            cloudxfer_protocol::TransferEvent::Status {
                task_id, status, ..
            } if *status != TaskStatus::Pending => Some((task_id.clone(), *status)),
            _ => None,
        })
        .collect();
    let expected: Vec<(String, TaskStatus)> = ids
        .iter()
        .flat_map(|id| {
            [
                (id.clone(), TaskStatus::Running),
                (id.clone(), TaskStatus::Completed),
            ]
        })
        .collect();
    assert_eq!(order, expected);
    assert!(h.scheduler.is_idle());
}

#[tokio::test]
async fn paused_pending_task_is_skipped_by_admission() {
    let mut h = Harness::with_config(ProviderKind::S3, |c| c.max_concurrent_tasks = 1);
    h.store.put(BUCKET, "a", pattern(10));
    h.store.put(BUCKET, "b", pattern(10));
    h.store.set_delay(Duration::from_millis(100));

    let first = h
        .scheduler
        .submit_download(BUCKET, "a", 10, h.path("a.bin"), None)
        .await
        .unwrap();
    let second = h
        .scheduler
        .submit_download(BUCKET, "b", 10, h.path("b.bin"), None)
        .await
        .unwrap();
    h.scheduler.pause(&second).await.unwrap();
    h.wait(&first, TaskStatus::Completed).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.scheduler.task(&second).unwrap().status, TaskStatus::Paused);
    assert!(h.scheduler.is_idle());

    h.scheduler.resume(&second).await.unwrap();
    h.wait(&second, TaskStatus::Completed).await;
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let h = Harness::new(ProviderKind::S3);
    let path = h.path("x.bin");

    for key in ["", "/leading", "bad\u{7}key"] {
        let err = h
            .scheduler
            .submit_upload(&path, BUCKET, key, 10, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)), "{key:?}");
    }
    let err = h
        .scheduler
        .submit_download("", "k", 10, &path, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
    let err = h
        .scheduler
        .submit_download(BUCKET, "k", 10, &path, Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
    let err = h
        .scheduler
        .submit_download(BUCKET, "k", 10_001, &path, Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
    assert!(h.scheduler.tasks().is_empty());
}

#[tokio::test]
async fn remove_and_clear_completed() {
    let mut h = Harness::new(ProviderKind::S3);
    h.store.put(BUCKET, "one", pattern(10));
    h.store.put(BUCKET, "two", pattern(10));

    let a = h
        .scheduler
        .submit_download(BUCKET, "one", 10, h.path("one.bin"), None)
        .await
        .unwrap();
    h.wait(&a, TaskStatus::Completed).await;
    let b = h
        .scheduler
        .submit_download(BUCKET, "two", 10, h.path("two.bin"), None)
        .await
        .unwrap();
    h.wait(&b, TaskStatus::Completed).await;

    h.scheduler.remove(&a).await.unwrap();
    assert!(h.scheduler.task(&a).is_none());
    assert!(matches!(
        h.scheduler.remove(&a).await,
        Err(EngineError::TaskNotFound(_))
    ));
    assert_eq!(h.scheduler.clear_completed().await.unwrap(), 1);
    assert!(h.scheduler.tasks().is_empty());
    assert!(h.scheduler.groups().completed.is_empty());
}
