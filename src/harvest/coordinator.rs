//! Harvest coordinator.
//!
//! One call to [`HarvestCoordinator::harvest`] is one cycle:
//! 1. A fresh buffer store and listener registry are created
//! 2. Every device is dispatched through the trigger state machine
//! 3. Once all devices are terminal, listeners are told to stop
//! 4. The buffer store is copied into the returned [`HarvestResult`]
//!
//! Files that arrive after step 3 are not part of the result.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

use super::trigger::{Trigger, TriggerSettings};
use crate::executor::HarvestExecutor;
use crate::model::{Device, HarvestResult, HarvestStats};
use crate::store::BufferStore;
use crate::tftp::{ListenerRegistry, ListenerSettings};
use crate::traits::DeviceConnector;

/// Settings for every cycle run by a coordinator.
#[derive(Debug, Clone, Default)]
pub struct HarvestSettings {
    pub trigger: TriggerSettings,
    pub listener: ListenerSettings,

    /// Confirmation secret sent with every upload command
    pub secret: String,
}

pub struct HarvestCoordinator<C: DeviceConnector> {
    connector: Arc<C>,
    settings: HarvestSettings,
    secret: Arc<str>,
}

impl<C: DeviceConnector + 'static> HarvestCoordinator<C> {
    pub fn new(connector: Arc<C>, settings: HarvestSettings) -> Self {
        let secret = Arc::from(settings.secret.as_str());
        Self {
            connector,
            settings,
            secret,
        }
    }

    /// Runs one harvest cycle over `devices` with at most `concurrency`
    /// devices in flight.
    ///
    /// Never fails as a whole: per-device failures are logged and counted
    /// in the returned stats, and their files are simply absent.
    #[instrument(skip_all, fields(devices = devices.len(), concurrency = concurrency))]
    pub async fn harvest(&self, devices: &[Device], concurrency: usize) -> HarvestResult {
        let start = Instant::now();
        let store = BufferStore::new();
        let listeners = Arc::new(ListenerRegistry::new(
            store.clone(),
            self.settings.listener.clone(),
        ));
        let trigger = Arc::new(Trigger::new(
            self.connector.clone(),
            listeners.clone(),
            self.secret.clone(),
            self.settings.trigger.clone(),
        ));

        info!("Starting harvest");
        let summary = HarvestExecutor::new(concurrency)
            .run_all(devices.to_vec(), move |device| {
                let trigger = trigger.clone();
                async move { trigger.run(&device).await }
            })
            .await;

        let stopped = listeners.stop_all();
        let files = store.snapshot();

        let stats = HarvestStats {
            devices: devices.len(),
            succeeded: summary.succeeded,
            failed: summary.failed,
            files_received: files.len(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            files = stats.files_received,
            listeners = stopped,
            duration_ms = stats.duration_ms,
            "Harvest finished"
        );

        HarvestResult { files, stats }
    }
}
