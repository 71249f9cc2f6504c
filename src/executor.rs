use crate::model::Device;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

/// Outcome counts of one dispatch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Bounded fan-out over a device list.
pub struct HarvestExecutor {
    concurrency: usize,
}

impl HarvestExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs `per_device` once for every device using exactly `concurrency`
    /// workers, and returns after all of them have finished.
    ///
    /// Workers pull devices from a shared queue in submission order. A failed
    /// device is logged and counted; it is never retried and never stops the
    /// batch.
    #[instrument(skip_all, fields(devices = devices.len(), workers = self.concurrency))]
    pub async fn run_all<F, Fut, E>(&self, devices: Vec<Device>, per_device: F) -> DispatchSummary
    where
        F: Fn(Device) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let queue = Arc::new(Mutex::new(VecDeque::from(devices)));
        let per_device = Arc::new(per_device);
        let succeeded = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        info!("Dispatching devices");

        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency {
            let queue = queue.clone();
            let per_device = per_device.clone();
            let succeeded = succeeded.clone();
            let failed = failed.clone();

            workers.spawn(async move {
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(device) = next else { break };

                    let name = device.to_string();
                    // Run each device in its own task so a panic only costs
                    // that device.
                    match tokio::spawn((*per_device)(device)).await {
                        Ok(Ok(())) => {
                            succeeded.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => {
                            warn!(worker, device = %name, error = %e, "Could not get config");
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!(worker, device = %name, error = %e, "Device task aborted");
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Dispatch worker aborted");
            }
        }

        let summary = DispatchSummary {
            succeeded: succeeded.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        };
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Dispatch finished"
        );
        summary
    }
}
