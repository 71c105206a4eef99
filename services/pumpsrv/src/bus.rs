//! Shared serial bus
//!
//! A [`SerialDispatcher`] per physical port, discovered through a
//! [`DispatcherRegistry`] so every pump on a port shares one line.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::{
    CommandSeq, DispatcherSettings, LineHealth, SerialDispatcher, WorkerSlot, WorkerTable,
};
pub use registry::DispatcherRegistry;
