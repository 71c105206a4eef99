//! New Era protocol constants

use std::time::Duration;

// ============================================================================
// Framing
// ============================================================================

/// Start of text, leads every response frame
pub const STX: u8 = 0x02;

/// End of text, terminates every response frame
pub const ETX: u8 = 0x03;

/// Terminates every outbound command
pub const CR: u8 = b'\r';

/// Outbound address prefix for unaddressed (broadcast) commands
pub const BROADCAST_PREFIX: &str = "*";

/// Response frame bytes tolerated before a terminator is seen
///
/// The longest legitimate response (`DIS` with volume units) is well under
/// 32 bytes; anything longer is line noise.
pub const MAX_FRAME_LEN: usize = 128;

// ============================================================================
// Addressing
// ============================================================================

/// Highest pump address on one line
pub const MAX_ADDRESS: u8 = 9;

/// Worker slots per line (addresses 0-9)
pub const ADDRESS_SLOTS: usize = MAX_ADDRESS as usize + 1;

// ============================================================================
// Numeric fields
// ============================================================================

/// Maximum characters in a numeric argument, decimal point included
pub const MAX_NUMBER_WIDTH: usize = 5;

/// Maximum decimals tried when formatting a numeric argument
pub const MAX_DECIMALS: usize = 3;

/// Position changes smaller than this issue no commands
pub const POSITION_DEAD_BAND: f64 = 0.001;

// ============================================================================
// Auxiliary output used for alarm signalling
// ============================================================================

/// TTL output pin driven high while an alarm is active
pub const ALARM_OUTPUT_PIN: u8 = 5;

// ============================================================================
// Timing
// ============================================================================

/// Pause after each write before the next command may be sent
pub const DEFAULT_GUARD_INTERVAL: Duration = Duration::from_millis(250);

/// Read timeout before a line with outstanding commands is unresponsive
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Grace period for reader/writer tasks to unwind on close
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Bound on a caller's wait for an operation to settle
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Status poll cadence
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Per-attempt wait for a query response
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Query attempts before giving up
pub const DEFAULT_QUERY_RETRIES: u32 = 3;
