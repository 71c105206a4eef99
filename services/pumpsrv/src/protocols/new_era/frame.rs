//! Response frames and their decoding
//!
//! Layout after framing bytes are stripped:
//!
//! ```text
//! 0..2   two-digit decimal address
//! 2      'A' (alarm) or prompt character
//! 3..    alarm: [ '?' ] code
//!        prompt: payload, or '?' + error code
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, Serializer};

use super::constants::{BROADCAST_PREFIX, CR, ETX, MAX_ADDRESS, STX};
use crate::error::{DecodeError, PumpError};

// ============================================================================
// Address
// ============================================================================

/// Outbound pump address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Address {
    /// Addressed pump, 0-9
    Unit(u8),
    /// Unaddressed `*` command; replies come back as address 0
    Broadcast,
}

impl Address {
    /// Validated unit address
    pub fn unit(address: u8) -> Result<Self, PumpError> {
        if address > MAX_ADDRESS {
            return Err(PumpError::config(format!(
                "Pump address {address} out of range 0-{MAX_ADDRESS}"
            )));
        }
        Ok(Address::Unit(address))
    }

    /// Re-check an address that was built without [`Address::unit`]
    pub fn validate(self) -> Result<Self, PumpError> {
        match self {
            Address::Unit(n) => Self::unit(n),
            Address::Broadcast => Ok(self),
        }
    }

    /// Worker slot that receives this address's responses
    pub fn slot(&self) -> usize {
        match self {
            Address::Unit(n) => *n as usize,
            Address::Broadcast => 0,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unit(n) => write!(f, "{n:02}"),
            Address::Broadcast => f.write_str(BROADCAST_PREFIX),
        }
    }
}

// ============================================================================
// Status codes
// ============================================================================

/// Operating mode reported in every non-alarm response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prompt {
    Infusing,
    Withdrawing,
    Stopped,
    Paused,
    TimedPause,
    UserWait,
    Purging,
    Other(char),
}

impl Prompt {
    pub fn from_char(c: char) -> Self {
        match c {
            'I' => Prompt::Infusing,
            'W' => Prompt::Withdrawing,
            'S' => Prompt::Stopped,
            'P' => Prompt::Paused,
            'T' => Prompt::TimedPause,
            'U' => Prompt::UserWait,
            'X' => Prompt::Purging,
            other => Prompt::Other(other),
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Prompt::Infusing => 'I',
            Prompt::Withdrawing => 'W',
            Prompt::Stopped => 'S',
            Prompt::Paused => 'P',
            Prompt::TimedPause => 'T',
            Prompt::UserWait => 'U',
            Prompt::Purging => 'X',
            Prompt::Other(c) => *c,
        }
    }

    /// Stopped or paused: the pump has settled
    pub fn is_terminal(&self) -> bool {
        matches!(self, Prompt::Stopped | Prompt::Paused)
    }

    /// Motor running, or a mode this firmware does not document
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Prompt::Infusing | Prompt::Withdrawing | Prompt::Purging | Prompt::Other(_)
        )
    }
}

/// Fault code reported in alarm frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmCode {
    /// Power interrupted
    Reset,
    Stall,
    SerialTimeout,
    ProgramError,
    PhaseOutOfRange,
    /// Raised by `set_alarm(true)`, never reported by hardware
    UserCommanded,
    Other(char),
}

impl AlarmCode {
    pub fn from_char(c: char) -> Self {
        match c {
            'R' => AlarmCode::Reset,
            'S' => AlarmCode::Stall,
            'T' => AlarmCode::SerialTimeout,
            'E' => AlarmCode::ProgramError,
            'O' => AlarmCode::PhaseOutOfRange,
            'U' => AlarmCode::UserCommanded,
            other => AlarmCode::Other(other),
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            AlarmCode::Reset => 'R',
            AlarmCode::Stall => 'S',
            AlarmCode::SerialTimeout => 'T',
            AlarmCode::ProgramError => 'E',
            AlarmCode::PhaseOutOfRange => 'O',
            AlarmCode::UserCommanded => 'U',
            AlarmCode::Other(c) => *c,
        }
    }
}

/// Command rejection reported after `?`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Bare `?`
    Unrecognized,
    NotApplicable,
    OutOfRange,
    InvalidPacket,
    Ignored,
    Other(String),
}

impl ErrorCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "" => ErrorCode::Unrecognized,
            "NA" => ErrorCode::NotApplicable,
            "OOR" => ErrorCode::OutOfRange,
            "COM" => ErrorCode::InvalidPacket,
            "IGN" => ErrorCode::Ignored,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Unrecognized => "",
            ErrorCode::NotApplicable => "NA",
            ErrorCode::OutOfRange => "OOR",
            ErrorCode::InvalidPacket => "COM",
            ErrorCode::Ignored => "IGN",
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Unrecognized => f.write_str("?"),
            other => write!(f, "?{}", other.as_str()),
        }
    }
}

// Published state carries the single protocol character
impl Serialize for Prompt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_char(self.as_char())
    }
}

impl Serialize for AlarmCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_char(self.as_char())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One decoded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Prompt {
        prompt: Prompt,
        data: Option<String>,
        error: Option<ErrorCode>,
    },
    Alarm(AlarmCode),
}

impl Frame {
    pub fn prompt(address: u8, prompt: Prompt, data: Option<String>) -> Self {
        Self {
            address,
            body: FrameBody::Prompt {
                prompt,
                data,
                error: None,
            },
        }
    }

    pub fn error(address: u8, prompt: Prompt, error: ErrorCode) -> Self {
        Self {
            address,
            body: FrameBody::Prompt {
                prompt,
                data: None,
                error: Some(error),
            },
        }
    }

    pub fn alarm(address: u8, alarm: AlarmCode) -> Self {
        Self {
            address,
            body: FrameBody::Alarm(alarm),
        }
    }

    /// STX-framed, ETX-terminated bytes as a pump would send them
    pub fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u8(STX);
        buf.put_slice(format!("{:02}", self.address).as_bytes());
        match &self.body {
            FrameBody::Prompt {
                prompt,
                data,
                error,
            } => {
                buf.put_u8(prompt.as_char() as u8);
                if let Some(error) = error {
                    buf.put_slice(error.to_string().as_bytes());
                } else if let Some(data) = data {
                    buf.put_slice(data.as_bytes());
                }
            },
            FrameBody::Alarm(code) => {
                buf.put_slice(b"A?");
                buf.put_u8(code.as_char() as u8);
            },
        }
        buf.put_u8(ETX);
        buf.freeze()
    }
}

// ============================================================================
// Decoding
// ============================================================================

fn is_framing(b: &u8) -> bool {
    matches!(*b, STX | ETX | CR | b'\n')
}

/// Decode one response line
///
/// Leading STX and trailing ETX/CR/LF are tolerated, so both a raw line and
/// a complete wire frame decode identically.
pub fn decode(raw: &[u8]) -> Result<Frame, DecodeError> {
    let start = raw.iter().position(|b| !is_framing(b)).unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !is_framing(b))
        .map_or(start, |i| i + 1);
    let line = &raw[start..end.max(start)];

    if !line.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return Err(DecodeError::NotAscii);
    }
    if line.len() < 3 {
        return Err(DecodeError::TooShort(line.len()));
    }

    let addr_bytes = &line[0..2];
    if !addr_bytes.iter().all(u8::is_ascii_digit) {
        return Err(DecodeError::InvalidAddress(
            String::from_utf8_lossy(addr_bytes).into_owned(),
        ));
    }
    let address = (addr_bytes[0] - b'0') * 10 + (addr_bytes[1] - b'0');
    if address > MAX_ADDRESS {
        return Err(DecodeError::AddressOutOfRange(address));
    }

    if line[2] == b'A' {
        // Firmware emits `A?<code>`; a bare `A<code>` is also accepted
        let code = match &line[3..] {
            [b'?', code, ..] | [code, ..] if *code != b'?' => *code,
            _ => return Err(DecodeError::MissingAlarmCode),
        };
        return Ok(Frame::alarm(address, AlarmCode::from_char(code as char)));
    }

    let prompt = Prompt::from_char(line[2] as char);
    // line is ASCII, so the lossy conversion never substitutes
    let payload = String::from_utf8_lossy(&line[3..]).trim().to_string();
    let body = match payload.strip_prefix('?') {
        Some(code) => FrameBody::Prompt {
            prompt,
            data: None,
            error: Some(ErrorCode::parse(code.trim())),
        },
        None => FrameBody::Prompt {
            prompt,
            data: (!payload.is_empty()).then_some(payload),
            error: None,
        },
    };
    Ok(Frame { address, body })
}
