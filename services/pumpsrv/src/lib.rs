//! Syringe pump bus service (`pumpsrv`)
//!
//! Drives New Era syringe pumps that share a half-duplex RS-232/RS-485 line.
//! One [`bus::SerialDispatcher`] owns each physical port; every pump on that
//! port talks through it via a [`pump::PumpController`].
//!
//! ```text
//! PumpController ──encode──► CommandQueue ──writer──► serial line
//!       ▲                                                │
//!       └──── WorkerTable[address] ◄──reader──decode─────┘
//! ```

pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod error;
pub mod protocols;
pub mod pump;
pub mod runtime;
pub mod transport;

pub use error::{DecodeError, PumpError, Result};
