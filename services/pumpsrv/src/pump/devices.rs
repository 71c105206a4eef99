//! Concrete pump models

use std::sync::Arc;

use async_trait::async_trait;

use super::capabilities::{
    Alarmable, Homeable, Positionable, PumpDevice, Purgeable, RateControllable, Runnable,
};
use super::controller::{PumpController, PumpSnapshot};
use super::state::{Completion, OperationTicket};
use crate::config::{Limits, PumpKind};
use crate::error::Result;
use crate::protocols::new_era::{Address, AlarmCode, RateUnits};

/// Build the device type for `kind`
pub fn build_device(kind: PumpKind, controller: Arc<PumpController>) -> Arc<dyn PumpDevice> {
    match kind {
        PumpKind::Ne1000 => Arc::new(Ne1000Pump::new(controller)),
        PumpKind::Continuous => Arc::new(ContinuousPump::new(controller)),
    }
}

fn cached_rate(controller: &PumpController) -> Option<(f64, RateUnits)> {
    let snapshot = controller.snapshot();
    snapshot.rate.map(|rate| (rate, snapshot.rate_units))
}

// ============================================================================
// NE-1000
// ============================================================================

/// NE-1000 family syringe pump: volume moves, purge and prime
pub struct Ne1000Pump {
    controller: Arc<PumpController>,
}

impl Ne1000Pump {
    pub fn new(controller: Arc<PumpController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl PumpDevice for Ne1000Pump {
    fn kind(&self) -> PumpKind {
        PumpKind::Ne1000
    }

    fn name(&self) -> &str {
        self.controller.name()
    }

    fn address(&self) -> Address {
        self.controller.address()
    }

    fn snapshot(&self) -> PumpSnapshot {
        self.controller.snapshot()
    }

    async fn update(&self) -> Result<()> {
        self.controller.update()
    }

    async fn wait_for(&self, ticket: OperationTicket) -> Completion {
        self.controller.wait_for(ticket).await
    }

    async fn wait_idle(&self) -> Completion {
        self.controller.wait_idle().await
    }

    fn as_positionable(&self) -> Option<&dyn Positionable> {
        Some(self)
    }

    fn as_homeable(&self) -> Option<&dyn Homeable> {
        Some(self)
    }

    fn as_rate_controllable(&self) -> Option<&dyn RateControllable> {
        Some(self)
    }

    fn as_alarmable(&self) -> Option<&dyn Alarmable> {
        Some(self)
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        Some(self)
    }
}

impl Positionable for Ne1000Pump {
    fn set_position(&self, target: f64) -> Result<OperationTicket> {
        self.controller.set_position(target)
    }

    fn position(&self) -> f64 {
        self.controller.snapshot().position
    }

    fn destination(&self) -> f64 {
        self.controller.snapshot().destination
    }

    fn limits(&self) -> Limits {
        self.controller.settings().limits
    }
}

impl Homeable for Ne1000Pump {
    fn home(&self) -> Result<OperationTicket> {
        self.controller.home()
    }

    fn is_homing(&self) -> bool {
        self.controller.snapshot().homing
    }
}

#[async_trait]
impl RateControllable for Ne1000Pump {
    fn set_rate(&self, rate: f64, units: RateUnits) -> Result<OperationTicket> {
        self.controller.set_rate(rate, units)
    }

    fn rate(&self) -> Option<(f64, RateUnits)> {
        cached_rate(&self.controller)
    }

    async fn query_rate(&self) -> Result<(f64, RateUnits)> {
        self.controller.query_rate().await
    }
}

impl Alarmable for Ne1000Pump {
    fn set_alarm(&self, on: bool) -> Result<OperationTicket> {
        self.controller.set_alarm(on)
    }

    fn alarm(&self) -> Option<AlarmCode> {
        self.controller.snapshot().alarm
    }
}

impl Purgeable for Ne1000Pump {
    fn purge(&self) -> Result<OperationTicket> {
        self.controller.purge()
    }

    fn prime(&self) -> Result<OperationTicket> {
        self.controller.prime()
    }

    fn is_purging(&self) -> bool {
        self.controller.snapshot().purging
    }
}

// ============================================================================
// Continuous next-gen
// ============================================================================

/// X2 / continuous next-gen controller: rate-driven, no volume tracking
pub struct ContinuousPump {
    controller: Arc<PumpController>,
}

impl ContinuousPump {
    pub fn new(controller: Arc<PumpController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl PumpDevice for ContinuousPump {
    fn kind(&self) -> PumpKind {
        PumpKind::Continuous
    }

    fn name(&self) -> &str {
        self.controller.name()
    }

    fn address(&self) -> Address {
        self.controller.address()
    }

    fn snapshot(&self) -> PumpSnapshot {
        self.controller.snapshot()
    }

    async fn update(&self) -> Result<()> {
        self.controller.update()
    }

    async fn wait_for(&self, ticket: OperationTicket) -> Completion {
        self.controller.wait_for(ticket).await
    }

    async fn wait_idle(&self) -> Completion {
        self.controller.wait_idle().await
    }

    fn as_homeable(&self) -> Option<&dyn Homeable> {
        Some(self)
    }

    fn as_rate_controllable(&self) -> Option<&dyn RateControllable> {
        Some(self)
    }

    fn as_alarmable(&self) -> Option<&dyn Alarmable> {
        Some(self)
    }

    fn as_runnable(&self) -> Option<&dyn Runnable> {
        Some(self)
    }
}

impl Homeable for ContinuousPump {
    fn home(&self) -> Result<OperationTicket> {
        self.controller.home()
    }

    fn is_homing(&self) -> bool {
        self.controller.snapshot().homing
    }
}

#[async_trait]
impl RateControllable for ContinuousPump {
    fn set_rate(&self, rate: f64, units: RateUnits) -> Result<OperationTicket> {
        self.controller.set_rate(rate, units)
    }

    fn rate(&self) -> Option<(f64, RateUnits)> {
        cached_rate(&self.controller)
    }

    async fn query_rate(&self) -> Result<(f64, RateUnits)> {
        self.controller.query_rate().await
    }
}

impl Alarmable for ContinuousPump {
    fn set_alarm(&self, on: bool) -> Result<OperationTicket> {
        self.controller.set_alarm(on)
    }

    fn alarm(&self) -> Option<AlarmCode> {
        self.controller.snapshot().alarm
    }
}

impl Runnable for ContinuousPump {
    fn set_running(&self, running: bool) -> Result<OperationTicket> {
        self.controller.set_running(running)
    }
}
