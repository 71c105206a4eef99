//! Shared fixtures for pumpsrv integration tests
//!
//! A [`Bench`] is one simulated bus: a duplex pipe with the dispatcher on
//! one end and a [`PumpSimulator`] on the other, registered under
//! [`PORT`] so configuration-driven code finds it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pumpsrv::bus::{DispatcherRegistry, DispatcherSettings, SerialDispatcher};
use pumpsrv::protocols::new_era::simulator::{PumpSimulator, SimulatorConfig};
use pumpsrv::protocols::new_era::Address;
use pumpsrv::pump::{ControllerSettings, PumpController};
use tokio_util::sync::CancellationToken;

pub const PORT: &str = "/dev/ttySIM0";

/// Upper bound for anything a test waits on
pub const PATIENCE: Duration = Duration::from_secs(3);

pub fn fast_bus() -> DispatcherSettings {
    DispatcherSettings {
        guard_interval: Duration::from_millis(5),
        read_timeout: Duration::from_millis(300),
        close_grace: Duration::from_millis(200),
    }
}

pub fn pump_settings(name: &str, address: Address) -> ControllerSettings {
    let mut settings = ControllerSettings::new(name, address);
    settings.poll_interval = Duration::from_millis(10);
    settings.busy_timeout = Duration::from_secs(2);
    settings.query_timeout = Duration::from_millis(200);
    settings.query_retries = 2;
    settings
}

pub struct Bench {
    pub registry: Arc<DispatcherRegistry>,
    pub dispatcher: Arc<SerialDispatcher>,
    pub sim: PumpSimulator,
    pub token: CancellationToken,
}

impl Bench {
    pub fn new() -> Self {
        Self::with(SimulatorConfig::default(), fast_bus())
    }

    pub fn with(sim_config: SimulatorConfig, settings: DispatcherSettings) -> Self {
        let (near, far) = tokio::io::duplex(4096);
        let registry = Arc::new(DispatcherRegistry::new());
        let dispatcher = registry
            .attach(PORT, near, settings)
            .expect("attach simulated bus");
        let sim = PumpSimulator::spawn(far, sim_config);
        Self {
            registry,
            dispatcher,
            sim,
            token: CancellationToken::new(),
        }
    }

    /// Controller at `address`, without a poller
    pub fn controller(&self, name: &str, address: Address) -> Arc<PumpController> {
        PumpController::new(self.dispatcher.clone(), pump_settings(name, address))
            .expect("controller")
    }

    /// Controller at `address` with its poller running until [`Bench::close`]
    pub fn polled(&self, name: &str, address: Address) -> Arc<PumpController> {
        let controller = self.controller(name, address);
        tokio::spawn(controller.clone().run(self.token.child_token()));
        controller
    }

    /// Wait until everything queued so far has been written and answered
    pub async fn settle_line(&self) {
        let target = self.dispatcher.last_enqueued();
        eventually(|| self.dispatcher.last_transmitted() >= target).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    /// Commands the simulator received that are not status polls
    pub fn non_poll_commands(&self) -> Vec<String> {
        self.sim
            .commands()
            .into_iter()
            .filter(|c| !c.ends_with("DIS"))
            .collect()
    }

    pub async fn close(self) {
        self.token.cancel();
        self.registry.close_all().await;
    }
}

/// Poll `condition` until it holds; panics after [`PATIENCE`]
pub async fn eventually(condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(PATIENCE, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within {PATIENCE:?}");
}

/// True if `expected` appears in `commands` as a contiguous run
pub fn contains_run(commands: &[String], expected: &[&str]) -> bool {
    commands
        .windows(expected.len())
        .any(|window| window.iter().zip(expected).all(|(a, b)| a == b))
}
