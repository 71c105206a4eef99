//! Transport layer
//!
//! The dispatcher only needs a bidirectional byte stream. Real hardware is
//! a [`tokio_serial::SerialStream`]; tests plug in `tokio::io::duplex`.

pub mod serial;

use tokio::io::{AsyncRead, AsyncWrite};

pub use serial::SerialTransportConfig;

/// Byte stream a dispatcher can own
pub trait BusIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> BusIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
