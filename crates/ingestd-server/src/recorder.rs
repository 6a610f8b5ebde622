// ABOUTME: Background task that appends a metrics snapshot to the history log on a fixed interval.
// ABOUTME: Records one final snapshot when stopped so the log ends with the shutdown state.

use std::sync::Arc;
use std::time::Duration;

use ingestd_core::Pipeline;
use ingestd_store::MetricsHistory;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

pub struct MetricsRecorder {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MetricsRecorder {
    pub fn spawn(pipeline: Arc<Pipeline>, history: Arc<MetricsHistory>, every: Duration) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run(pipeline, history, every, rx));
        Self { shutdown, task }
    }

    /// Signal the task, wait for its final snapshot to be written.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "metrics recorder task failed");
        }
    }
}

async fn run(
    pipeline: Arc<Pipeline>,
    history: Arc<MetricsHistory>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // interval_at panics on a zero period
    let every = every.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = every.as_millis() as u64, "metrics recorder started");

    loop {
        tokio::select! {
            _ = ticker.tick() => record(&pipeline, &history),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    record(&pipeline, &history);
    info!("metrics recorder stopped");
}

fn record(pipeline: &Pipeline, history: &MetricsHistory) {
    let snapshot = pipeline.snapshot();
    match history.record(&snapshot) {
        Ok(entry) => debug!(
            status = ?entry.snapshot.status,
            buffer_size = entry.snapshot.buffer.size,
            "metrics snapshot recorded"
        ),
        Err(e) => warn!(error = %e, "failed to record metrics snapshot"),
    }
}
