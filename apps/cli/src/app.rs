//! Wires configuration, credentials and the engine together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::sync::mpsc;

use cloudxfer_client::{ObjectClient, ReqwestTransport};
use cloudxfer_engine::{EngineConfig, TaskStore, TransferScheduler};
use cloudxfer_protocol::{Credential, TaskStatus, TransferEvent};

use crate::args::{Args, Command};

const ACCESS_KEY_VAR: &str = "CLOUDXFER_ACCESS_KEY_ID";
const SECRET_KEY_VAR: &str = "CLOUDXFER_SECRET_ACCESS_KEY";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs one command to completion.
pub async fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args
        .config
        .clone()
        .or_else(EngineConfig::default_path)
        .context("cannot determine configuration path; pass --config")?;
    let config = EngineConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    tracing::info!(
        path = %config_path.display(),
        provider = %config.provider,
        endpoint = %config.endpoint,
        "configuration loaded"
    );

    match args.command {
        Command::Help => {
            println!("{}", crate::args::USAGE);
            Ok(())
        }
        Command::List => list(&config).await,
        Command::Resume => {
            let scheduler = TransferScheduler::restore(config.clone(), connect(&config)?).await?;
            for task in scheduler.tasks() {
                if task.status == TaskStatus::Paused {
                    scheduler.resume(&task.id).await?;
                }
            }
            drive(&scheduler).await
        }
        Command::Upload { file, bucket, key } => {
            let size = tokio::fs::metadata(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?
                .len();
            let scheduler = TransferScheduler::new(config.clone(), connect(&config)?)?;
            let id = scheduler
                .submit_upload(file, &bucket, &key, size, args.chunk_size)
                .await?;
            println!("{id} upload {bucket}/{key} ({size} bytes)");
            drive(&scheduler).await
        }
        Command::Download { bucket, key, file } => {
            let client = connect(&config)?;
            let size = client
                .head_object(&bucket, &key)
                .await
                .with_context(|| format!("HEAD {bucket}/{key}"))?
                .size
                .with_context(|| format!("{bucket}/{key} reports no size"))?;
            let scheduler = TransferScheduler::new(config.clone(), client)?;
            let id = scheduler
                .submit_download(&bucket, &key, size, absolute(file)?, args.chunk_size)
                .await?;
            println!("{id} download {bucket}/{key} ({size} bytes)");
            drive(&scheduler).await
        }
    }
}

fn connect(config: &EngineConfig) -> anyhow::Result<Arc<ObjectClient>> {
    let access_key = std::env::var(ACCESS_KEY_VAR)
        .with_context(|| format!("{ACCESS_KEY_VAR} is not set"))?;
    let secret_key = std::env::var(SECRET_KEY_VAR)
        .with_context(|| format!("{SECRET_KEY_VAR} is not set"))?;
    let credential = Credential::new(config.provider, access_key, secret_key, &config.region);
    let transport = ReqwestTransport::new(config.request_timeout(), CONNECT_TIMEOUT)?;
    Ok(Arc::new(ObjectClient::new(
        Arc::new(transport),
        config.endpoint()?,
        credential,
    )))
}

fn absolute(path: PathBuf) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()?.join(path))
}

async fn list(config: &EngineConfig) -> anyhow::Result<()> {
    let store = TaskStore::new(&config.state_dir);
    let mut tasks = store.load_all().await?;
    tasks.sort_by_key(|t| t.created_at);
    if tasks.is_empty() {
        println!("no recorded transfers");
    }
    for task in tasks {
        println!(
            "{}  {:<9}  {:?}  {}/{}  {:.1}%{}",
            task.id,
            task.status.to_string(),
            task.direction,
            task.bucket,
            task.key,
            task.percentage(),
            task.error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Prints events until every task has settled. Ctrl+C pauses running
/// tasks so `resume` can pick them up later.
async fn drive(scheduler: &TransferScheduler) -> anyhow::Result<()> {
    let mut events = scheduler
        .take_events()
        .context("event stream already taken")?;
    let mut failed = 0usize;
    let mut interrupted = false;

    let mut settled = scheduler.is_idle();
    if settled {
        println!("nothing to do");
    }

    while !settled {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if report(&event) {
                    failed += 1;
                }
                settled = is_settled(&event) && scheduler.is_idle();
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::info!("interrupt received, pausing transfers");
                let groups = scheduler.groups();
                for id in groups.in_progress.into_iter().chain(groups.pending) {
                    if let Err(e) = scheduler.pause(&id).await {
                        tracing::warn!(task = %id, error = %e, "pause failed");
                    }
                }
            }
        }
    }
    drain(&mut events, &mut failed);

    if failed > 0 {
        bail!("{failed} transfer(s) failed");
    }
    Ok(())
}

fn drain(events: &mut mpsc::UnboundedReceiver<TransferEvent>, failed: &mut usize) {
    while let Ok(event) = events.try_recv() {
        if report(&event) {
            *failed += 1;
        }
    }
}

fn is_settled(event: &TransferEvent) -> bool {
    matches!(
        event,
        TransferEvent::Status { status, .. } if status.is_terminal() || *status == TaskStatus::Paused
    )
}

/// Prints one event. Returns `true` for a failure.
fn report(event: &TransferEvent) -> bool {
    match event {
        TransferEvent::Progress {
            task_id,
            transferred_bytes,
            total_bytes,
            bytes_per_second,
        } => {
            let pct = if *total_bytes == 0 {
                100.0
            } else {
                *transferred_bytes as f64 / *total_bytes as f64 * 100.0
            };
            println!(
                "{task_id}  {transferred_bytes}/{total_bytes} bytes  {pct:5.1}%  {:.2} MiB/s",
                bytes_per_second / (1024.0 * 1024.0)
            );
            false
        }
        TransferEvent::Status {
            task_id,
            status,
            error,
        } => {
            match error {
                Some(e) => println!("{task_id}  {status}: {e}"),
                None => println!("{task_id}  {status}"),
            }
            *status == TaskStatus::Failed
        }
    }
}
