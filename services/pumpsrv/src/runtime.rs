//! Runtime lifecycle management
//!
//! Builds every configured pump on top of a shared [`DispatcherRegistry`],
//! runs one poller per pump plus a periodic snapshot logger, and tears
//! everything down on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::DispatcherRegistry;
use crate::config::AppConfig;
use crate::error::{PumpError, Result};
use crate::pump::{build_device, PumpController, PumpDevice};

const FLUSH_POLL: Duration = Duration::from_millis(10);

/// Running pumps and their background tasks
pub struct PumpRuntime {
    registry: Arc<DispatcherRegistry>,
    devices: Vec<Arc<dyn PumpDevice>>,
    /// Same order as `devices`
    controllers: Vec<Arc<PumpController>>,
    token: CancellationToken,
    tasks: JoinSet<()>,
}

/// Open the configured buses and start polling every pump
///
/// Any pump that cannot be built aborts startup; buses opened so far are
/// closed again.
pub async fn start_pumps(
    config: &AppConfig,
    registry: Arc<DispatcherRegistry>,
) -> Result<PumpRuntime> {
    let mut devices = Vec::with_capacity(config.pumps.len());
    let mut controllers = Vec::with_capacity(config.pumps.len());
    for pump in &config.pumps {
        let built = config
            .bus(&pump.port)
            .ok_or_else(|| {
                PumpError::config(format!(
                    "Pump {} references unknown bus {}",
                    pump.name, pump.port
                ))
            })
            .and_then(|bus| PumpController::open(&registry, bus, pump));
        match built {
            Ok(controller) => {
                let device = build_device(pump.kind, controller.clone());
                info!(
                    "Pump {} ready ({:?}, capabilities {:?})",
                    device.name(),
                    device.kind(),
                    device.capabilities()
                );
                devices.push(device);
                controllers.push(controller);
            },
            Err(e) => {
                error!("Failed to start pump {}: {}", pump.name, e);
                registry.close_all().await;
                return Err(e);
            },
        }
    }

    let token = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for controller in &controllers {
        tasks.spawn(controller.clone().run(token.child_token()));
    }
    let interval = Duration::from_millis(config.service.snapshot_log_interval_ms);
    if !interval.is_zero() {
        tasks.spawn(log_snapshots(devices.clone(), interval, token.child_token()));
    }

    info!(
        "Started {} pump(s) on {} bus(es)",
        devices.len(),
        registry.len()
    );
    Ok(PumpRuntime {
        registry,
        devices,
        controllers,
        token,
        tasks,
    })
}

async fn log_snapshots(
    devices: Vec<Arc<dyn PumpDevice>>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                for device in &devices {
                    match serde_json::to_string(&device.snapshot()) {
                        Ok(json) => debug!(pump = %device.name(), snapshot = %json, "snapshot"),
                        Err(e) => warn!("Snapshot of {} not serializable: {}", device.name(), e),
                    }
                }
            },
        }
    }
}

impl PumpRuntime {
    pub fn devices(&self) -> &[Arc<dyn PumpDevice>] {
        &self.devices
    }

    pub fn device(&self, name: &str) -> Option<&Arc<dyn PumpDevice>> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn registry(&self) -> &Arc<DispatcherRegistry> {
        &self.registry
    }

    /// Stop pumps, stop pollers, close every bus
    ///
    /// A final `STP` is queued for each pump and given up to the bus close
    /// grace to reach the line.
    pub async fn shutdown(mut self) {
        info!("Stopping {} pump(s)", self.devices.len());
        let mut pending = Vec::new();
        for controller in &self.controllers {
            match controller.stop() {
                Ok(ticket) => pending.push((controller.dispatcher().clone(), ticket.last_command)),
                Err(e) => warn!("Pump {}: stop not queued: {}", controller.name(), e),
            }
        }
        self.token.cancel();

        for (dispatcher, seq) in pending {
            let grace = dispatcher.settings().close_grace;
            let flushed = tokio::time::timeout(grace, async {
                while dispatcher.last_transmitted() < seq && !dispatcher.is_closed() {
                    tokio::time::sleep(FLUSH_POLL).await;
                }
            })
            .await;
            if flushed.is_err() {
                warn!("Port {}: final stop not transmitted", dispatcher.port());
            }
        }

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Pump task ended abnormally: {}", e);
            }
        }
        self.registry.close_all().await;
        info!("All pumps stopped");
    }
}
