//! New Era Pump Systems ASCII protocol
//!
//! Address-framed command/response protocol used by the NE-1000 family and
//! the X2 / continuous next-gen controllers. Commands are CR-terminated,
//! responses are STX...ETX framed.

pub mod codec;
pub mod constants;
pub mod frame;
pub mod simulator;

// Re-export commonly used types
pub use codec::{Command, Direction, Dispensed, EtxCodec, RateUnits, VolumeUnits};
pub use frame::{decode, Address, AlarmCode, ErrorCode, Frame, FrameBody, Prompt};
