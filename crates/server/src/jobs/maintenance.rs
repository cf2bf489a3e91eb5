//! Recurring maintenance loops.
//!
//! Housekeeping that runs beside the pipeline: firing due scheduled
//! commands, sweeping silent devices offline, disabling expired devices,
//! recording pool gauges. Each task sleeps out its own cadence on a
//! dedicated loop and the whole set winds down together on shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A recurring housekeeping task.
#[async_trait::async_trait]
pub trait MaintenanceTask: Send + Sync + 'static {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Pause between consecutive runs. The first run happens one cadence
    /// after spawn, never immediately.
    fn cadence(&self) -> Duration;

    async fn run(&self) -> Result<(), String>;
}

/// Drives maintenance tasks until shutdown.
pub struct Maintenance {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Maintenance {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Starts the task's loop immediately.
    pub fn spawn<T: MaintenanceTask>(&mut self, task: T) {
        let task = Arc::new(task);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let cadence = task.cadence();
            debug!(
                task = task.name(),
                cadence_secs = cadence.as_secs(),
                "Maintenance loop running"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(cadence) => {
                        let started = Instant::now();
                        match task.run().await {
                            Ok(()) => {
                                metrics::histogram!(
                                    "maintenance_run_duration_seconds",
                                    "task" => task.name().to_string()
                                )
                                .record(started.elapsed().as_secs_f64());
                            }
                            Err(e) => {
                                metrics::counter!(
                                    "maintenance_run_failures_total",
                                    "task" => task.name().to_string()
                                )
                                .increment(1);
                                warn!(task = task.name(), error = %e, "Maintenance run failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!(task = task.name(), "Maintenance loop stopping");
                            break;
                        }
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Signals every loop to stop after its current run.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Waits for the loops to wind down, up to `grace`.
    pub async fn drain(self, grace: Duration) {
        let drain = async {
            for handle in self.handles {
                if let Err(e) = handle.await {
                    warn!("Maintenance loop panicked: {}", e);
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Maintenance drain timed out after {:?}", grace);
        }
    }
}

impl Default for Maintenance {
    fn default() -> Self {
        Self::new()
    }
}
