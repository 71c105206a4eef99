//! Pump capability interfaces
//!
//! Every device implements [`PumpDevice`]; the rest are implemented only by
//! the models that support them. Hosts discover them through the `as_*`
//! accessors instead of downcasting.

use async_trait::async_trait;
use serde::Serialize;

use super::controller::PumpSnapshot;
use super::state::{Completion, OperationTicket};
use crate::config::{Limits, PumpKind};
use crate::error::Result;
use crate::protocols::new_era::{Address, AlarmCode, RateUnits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Positionable,
    Homeable,
    RateControllable,
    Alarmable,
    Purgeable,
    Runnable,
}

/// Base interface of every pump on a bus
#[async_trait]
pub trait PumpDevice: Send + Sync {
    fn kind(&self) -> PumpKind;

    fn name(&self) -> &str;

    fn address(&self) -> Address;

    fn snapshot(&self) -> PumpSnapshot;

    /// Periodic hook: fold the latest frame and queue a status poll
    async fn update(&self) -> Result<()>;

    async fn wait_for(&self, ticket: OperationTicket) -> Completion;

    async fn wait_idle(&self) -> Completion;

    fn as_positionable(&self) -> Option<&dyn Positionable> {
        None
    }

    fn as_homeable(&self) -> Option<&dyn Homeable> {
        None
    }

    fn as_rate_controllable(&self) -> Option<&dyn RateControllable> {
        None
    }

    fn as_alarmable(&self) -> Option<&dyn Alarmable> {
        None
    }

    fn as_purgeable(&self) -> Option<&dyn Purgeable> {
        None
    }

    fn as_runnable(&self) -> Option<&dyn Runnable> {
        None
    }

    fn capabilities(&self) -> Vec<Capability> {
        let mut capabilities = Vec::new();
        if self.as_positionable().is_some() {
            capabilities.push(Capability::Positionable);
        }
        if self.as_homeable().is_some() {
            capabilities.push(Capability::Homeable);
        }
        if self.as_rate_controllable().is_some() {
            capabilities.push(Capability::RateControllable);
        }
        if self.as_alarmable().is_some() {
            capabilities.push(Capability::Alarmable);
        }
        if self.as_purgeable().is_some() {
            capabilities.push(Capability::Purgeable);
        }
        if self.as_runnable().is_some() {
            capabilities.push(Capability::Runnable);
        }
        capabilities
    }
}

/// Absolute plunger positioning
pub trait Positionable: Send + Sync {
    /// Move to `target`; targets within the dead-band send nothing
    fn set_position(&self, target: f64) -> Result<OperationTicket>;

    fn position(&self) -> f64;

    fn destination(&self) -> f64;

    fn limits(&self) -> Limits;
}

pub trait Homeable: Send + Sync {
    fn home(&self) -> Result<OperationTicket>;

    fn is_homing(&self) -> bool;
}

#[async_trait]
pub trait RateControllable: Send + Sync {
    fn set_rate(&self, rate: f64, units: RateUnits) -> Result<OperationTicket>;

    /// Last rate reported by the device, `None` while a change is pending
    fn rate(&self) -> Option<(f64, RateUnits)>;

    /// Ask the device, with bounded retry
    async fn query_rate(&self) -> Result<(f64, RateUnits)>;
}

pub trait Alarmable: Send + Sync {
    fn set_alarm(&self, on: bool) -> Result<OperationTicket>;

    fn alarm(&self) -> Option<AlarmCode>;
}

pub trait Purgeable: Send + Sync {
    fn purge(&self) -> Result<OperationTicket>;

    /// Full withdraw followed by full infuse
    fn prime(&self) -> Result<OperationTicket>;

    fn is_purging(&self) -> bool;
}

/// Continuous pumping at the current rate
pub trait Runnable: Send + Sync {
    fn set_running(&self, running: bool) -> Result<OperationTicket>;
}
