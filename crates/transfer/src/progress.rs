use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

use cloudxfer_protocol::TransferEvent;

// ---------------------------------------------------------------------------
// ProgressThrottler
// ---------------------------------------------------------------------------

/// Coalesces per-part byte counts into at most one progress event per tick.
///
/// Workers call [`record`](Self::record) as often as they like; a background
/// ticker emits the cumulative total only when it changed since the last
/// emission, and [`finish`](Self::finish) always emits one final event.
/// All emission goes through one async mutex and the final value is clamped
/// to the last one emitted, so the reported byte count never decreases.
///
/// The channel is unbounded: emitting never blocks the transfer and the
/// final event is never dropped.
pub struct ProgressThrottler {
    shared: Arc<Shared>,
    stop: Option<oneshot::Sender<()>>,
    ticker: Option<JoinHandle<()>>,
}

struct Shared {
    task_id: String,
    total: u64,
    cumulative: AtomicU64,
    speed: SpeedCalculator,
    emitter: tokio::sync::Mutex<Emitter>,
}

struct Emitter {
    last_emitted: u64,
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl Shared {
    fn event(&self, transferred: u64) -> TransferEvent {
        TransferEvent::Progress {
            task_id: self.task_id.clone(),
            transferred_bytes: transferred,
            total_bytes: self.total,
            bytes_per_second: self.speed.bytes_per_second(),
        }
    }

    /// Emits the current total if it moved.
    async fn flush(&self) {
        let mut emitter = self.emitter.lock().await;
        let current = self.cumulative.load(Ordering::Acquire);
        if current <= emitter.last_emitted {
            return;
        }
        if emitter.tx.send(self.event(current)).is_err() {
            trace!(task = %self.task_id, "progress receiver closed");
        }
        emitter.last_emitted = current;
    }
}

impl ProgressThrottler {
    /// Starts the ticker. `initial` is the byte count already on record
    /// (resumed parts); it is not re-emitted until something changes.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        task_id: impl Into<String>,
        initial: u64,
        total: u64,
        interval: Duration,
        tx: mpsc::UnboundedSender<TransferEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            task_id: task_id.into(),
            total,
            cumulative: AtomicU64::new(initial),
            speed: SpeedCalculator::new(None, None),
            emitter: tokio::sync::Mutex::new(Emitter {
                last_emitted: initial,
                tx,
            }),
        });

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let ticker_shared = Arc::clone(&shared);
        let ticker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => ticker_shared.flush().await,
                    _ = &mut stop_rx => break,
                }
            }
        });

        Self {
            shared,
            stop: Some(stop_tx),
            ticker: Some(ticker),
        }
    }

    /// Adds `delta` bytes to the running total.
    pub fn record(&self, delta: u64) {
        self.shared.cumulative.fetch_add(delta, Ordering::AcqRel);
        self.shared.speed.add_sample(delta);
    }

    /// Current running total.
    pub fn transferred(&self) -> u64 {
        self.shared.cumulative.load(Ordering::Acquire)
    }

    /// Stops the ticker and emits the final event carrying `final_bytes`,
    /// or the last emitted count if that is higher.
    pub async fn finish(mut self, final_bytes: u64) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.await;
        }

        let mut emitter = self.shared.emitter.lock().await;
        let final_bytes = final_bytes.max(emitter.last_emitted);
        self.shared.cumulative.store(final_bytes, Ordering::Release);
        if emitter.tx.send(self.shared.event(final_bytes)).is_err() {
            trace!(task = %self.shared.task_id, "progress receiver closed");
        }
        emitter.last_emitted = final_bytes;
    }
}

impl Drop for ProgressThrottler {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        let window = s.window_size;
        s.samples
            .retain(|sample| now.duration_since(sample.timestamp) <= window);

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if s.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }
}
