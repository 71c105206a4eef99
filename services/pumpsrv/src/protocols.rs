//! Protocol implementations
//!
//! This module contains the pump protocol implementations.

pub mod new_era;
