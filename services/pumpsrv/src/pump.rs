//! Pump devices
//!
//! [`PumpController`] holds the per-address protocol state and talks to the
//! shared dispatcher; [`devices`] wraps it in model-specific types that
//! expose only the capabilities the hardware supports.

pub mod capabilities;
pub mod controller;
pub mod devices;
pub mod state;

pub use capabilities::{
    Alarmable, Capability, Homeable, Positionable, PumpDevice, Purgeable, RateControllable,
    Runnable,
};
pub use controller::{ControllerSettings, PumpController, PumpSnapshot};
pub use devices::{build_device, ContinuousPump, Ne1000Pump};
pub use state::{Completion, OperationKind, OperationTicket, PumpPhase, PumpState};
