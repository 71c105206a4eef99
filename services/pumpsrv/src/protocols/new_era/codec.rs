//! Command encoding and status-text parsing
//!
//! Outbound: `<addr|*><MNEMONIC><args>\r`, e.g. `03RATC1.5MM\r`.
//! Inbound: [`EtxCodec`] splits the byte stream on ETX and decodes each
//! frame; status payloads (`RAT`, `DIS`) are parsed here so firmware text
//! quirks stay in one place.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;

use super::constants::{ALARM_OUTPUT_PIN, CR, ETX, MAX_DECIMALS, MAX_FRAME_LEN, MAX_NUMBER_WIDTH};
use super::frame::{decode, Address, Frame};
use crate::error::{DecodeError, PumpError, Result};

// ============================================================================
// Units and direction
// ============================================================================

/// Pumping rate units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateUnits {
    /// µL/min
    #[serde(rename = "UM")]
    MicrolitersPerMinute,
    /// mL/min
    #[serde(rename = "MM")]
    MillilitersPerMinute,
    /// µL/hr
    #[serde(rename = "UH")]
    MicrolitersPerHour,
    /// mL/hr
    #[serde(rename = "MH")]
    MillilitersPerHour,
}

impl RateUnits {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateUnits::MicrolitersPerMinute => "UM",
            RateUnits::MillilitersPerMinute => "MM",
            RateUnits::MicrolitersPerHour => "UH",
            RateUnits::MillilitersPerHour => "MH",
        }
    }
}

impl FromStr for RateUnits {
    type Err = PumpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UM" => Ok(RateUnits::MicrolitersPerMinute),
            "MM" => Ok(RateUnits::MillilitersPerMinute),
            "UH" => Ok(RateUnits::MicrolitersPerHour),
            "MH" => Ok(RateUnits::MillilitersPerHour),
            other => Err(PumpError::value(format!(
                "Unsupported rate units {other:?}, expected UM, MM, UH or MH"
            ))),
        }
    }
}

impl fmt::Display for RateUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volume units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeUnits {
    #[serde(rename = "UL")]
    Microliters,
    #[serde(rename = "ML")]
    Milliliters,
}

impl VolumeUnits {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeUnits::Microliters => "UL",
            VolumeUnits::Milliliters => "ML",
        }
    }

    /// Convert `value` expressed in `from` into these units
    pub fn convert(&self, value: f64, from: VolumeUnits) -> f64 {
        match (from, *self) {
            (VolumeUnits::Microliters, VolumeUnits::Milliliters) => value / 1000.0,
            (VolumeUnits::Milliliters, VolumeUnits::Microliters) => value * 1000.0,
            _ => value,
        }
    }
}

impl FromStr for VolumeUnits {
    type Err = PumpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UL" => Ok(VolumeUnits::Microliters),
            "ML" => Ok(VolumeUnits::Milliliters),
            other => Err(PumpError::value(format!(
                "Unsupported volume units {other:?}, expected UL or ML"
            ))),
        }
    }
}

impl fmt::Display for VolumeUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pumping direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Infuse,
    Withdraw,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Infuse => "INF",
            Direction::Withdraw => "WDR",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Numeric arguments
// ============================================================================

/// Format a non-negative value for a fixed-width numeric field
///
/// Uses the most decimals (up to 3) that keep the text within 5 characters,
/// then drops trailing zeros. Values that need more than 5 integer digits
/// are rejected rather than truncated.
pub fn format_number(value: f64) -> Result<String> {
    if !value.is_finite() || value < 0.0 {
        return Err(PumpError::value(format!(
            "{value} is not a representable magnitude"
        )));
    }
    for decimals in (0..=MAX_DECIMALS).rev() {
        let text = format!("{value:.decimals$}");
        if text.len() <= MAX_NUMBER_WIDTH {
            if !text.contains('.') {
                return Ok(text);
            }
            let trimmed = text.trim_end_matches('0').trim_end_matches('.');
            return Ok(trimmed.to_string());
        }
    }
    Err(PumpError::value(format!(
        "{value} exceeds the {MAX_NUMBER_WIDTH}-character numeric field"
    )))
}

// ============================================================================
// Commands
// ============================================================================

/// One outbound command: mnemonic plus concatenated arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    mnemonic: String,
    args: Vec<String>,
}

impl Command {
    pub fn new(mnemonic: impl Into<String>) -> Self {
        Self {
            mnemonic: mnemonic.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Status query; also the wake-up command after power cycling
    pub fn status() -> Self {
        Self::new("DIS")
    }

    pub fn rate_query() -> Self {
        Self::new("RAT")
    }

    /// Continuous-rate set, e.g. `RATC1.5MM`
    pub fn set_rate(rate: f64, units: RateUnits) -> Result<Self> {
        Ok(Self::new("RAT")
            .arg("C")
            .arg(format_number(rate)?)
            .arg(units.as_str()))
    }

    pub fn direction(direction: Direction) -> Self {
        Self::new("DIR").arg(direction.as_str())
    }

    pub fn volume_units(units: VolumeUnits) -> Self {
        Self::new("VOL").arg(units.as_str())
    }

    pub fn volume(magnitude: f64) -> Result<Self> {
        Ok(Self::new("VOL").arg(format_number(magnitude)?))
    }

    pub fn run() -> Self {
        Self::new("RUN")
    }

    pub fn stop() -> Self {
        Self::new("STP")
    }

    pub fn purge() -> Self {
        Self::new("PUR")
    }

    /// Clear the accumulated infused or withdrawn volume
    pub fn clear_volume(direction: Direction) -> Self {
        Self::new("CLD").arg(direction.as_str())
    }

    pub fn buzzer(on: bool) -> Self {
        Self::new("BUZ").arg(if on { "1" } else { "0" })
    }

    /// Drive the alarm TTL output pin
    pub fn alarm_output(on: bool) -> Self {
        Self::new("OUT")
            .arg(ALARM_OUTPUT_PIN.to_string())
            .arg(if on { "1" } else { "0" })
    }

    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// Wire bytes for `address`
    pub fn encode(&self, address: Address) -> Bytes {
        encode(address, &self.mnemonic, &self.args)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mnemonic)?;
        for arg in &self.args {
            f.write_str(arg)?;
        }
        Ok(())
    }
}

/// Encode `<addr|*><MNEMONIC><args>\r`
pub fn encode<S: AsRef<str>>(address: Address, mnemonic: &str, args: &[S]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_slice(address.to_string().as_bytes());
    buf.put_slice(mnemonic.to_ascii_uppercase().as_bytes());
    for arg in args {
        buf.put_slice(arg.as_ref().as_bytes());
    }
    buf.put_u8(CR);
    buf.freeze()
}

// ============================================================================
// Status payloads
// ============================================================================

/// Parse a `RAT` query payload such as `1.500MM`
pub fn parse_rate(data: &str) -> Option<(f64, RateUnits)> {
    let data = data.trim();
    if data.len() < 3 || !data.is_char_boundary(data.len() - 2) {
        return None;
    }
    let (value, units) = data.split_at(data.len() - 2);
    let units = units.parse().ok()?;
    let value = value.trim().parse::<f64>().ok()?;
    Some((value, units))
}

/// Accumulated volume since the last `CLD`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dispensed {
    pub infused: f64,
    pub withdrawn: f64,
    pub units: VolumeUnits,
}

fn dispensed_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^I\s*([0-9]*\.?[0-9]+)\s*W\s*([0-9]*\.?[0-9]+)\s*(UL|ML)$").ok()
        })
        .as_ref()
}

/// Parse a `DIS` payload such as `I0.125W0.000ML`
pub fn parse_dispensed(data: &str) -> Option<Dispensed> {
    let caps = dispensed_pattern()?.captures(data.trim())?;
    Some(Dispensed {
        infused: caps[1].parse().ok()?,
        withdrawn: caps[2].parse().ok()?,
        units: caps[3].parse().ok()?,
    })
}

// ============================================================================
// Stream framing
// ============================================================================

/// Splits inbound bytes on ETX and decodes each frame
///
/// Malformed frames are yielded as `Err(DecodeError)` items rather than
/// stream errors, so the reader keeps going.
#[derive(Debug, Default)]
pub struct EtxCodec;

impl Decoder for EtxCodec {
    type Item = std::result::Result<Frame, DecodeError>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if let Some(pos) = src.iter().position(|b| *b == ETX) {
            let line = src.split_to(pos + 1);
            return Ok(Some(decode(&line)));
        }
        if src.len() > MAX_FRAME_LEN {
            let len = src.len();
            src.advance(len);
            return Ok(Some(Err(DecodeError::Overlong(MAX_FRAME_LEN))));
        }
        Ok(None)
    }

    fn decode_eof(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(decode(&rest)))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocols::new_era::frame::{FrameBody, Prompt};

    #[test]
    fn test_encode_addressed_and_broadcast() {
        let rate = Command::set_rate(1.5, RateUnits::MillilitersPerMinute).unwrap();
        assert_eq!(rate.encode(Address::Unit(3)).as_ref(), b"03RATC1.5MM\r");
        assert_eq!(Command::run().encode(Address::Broadcast).as_ref(), b"*RUN\r");
        assert_eq!(
            encode(Address::Unit(0), "cld", &["WDR"]).as_ref(),
            b"00CLDWDR\r"
        );
    }

    #[test]
    fn test_alarm_commands() {
        assert_eq!(Command::buzzer(true).to_string(), "BUZ1");
        assert_eq!(Command::alarm_output(true).to_string(), "OUT51");
        assert_eq!(Command::alarm_output(false).to_string(), "OUT50");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1.5).unwrap(), "1.5");
        assert_eq!(format_number(0.125).unwrap(), "0.125");
        assert_eq!(format_number(12.5).unwrap(), "12.5");
        assert_eq!(format_number(100.0).unwrap(), "100");
        assert_eq!(format_number(1234.0).unwrap(), "1234");
        assert_eq!(format_number(99999.0).unwrap(), "99999");
        assert_eq!(format_number(0.0).unwrap(), "0");
    }

    #[test]
    fn test_format_number_rejects_unrepresentable() {
        assert!(matches!(format_number(100000.0), Err(PumpError::Value(_))));
        assert!(matches!(format_number(123456.7), Err(PumpError::Value(_))));
        assert!(matches!(format_number(-1.0), Err(PumpError::Value(_))));
        assert!(matches!(format_number(f64::NAN), Err(PumpError::Value(_))));
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(
            parse_rate("1.500MM"),
            Some((1.5, RateUnits::MillilitersPerMinute))
        );
        assert_eq!(
            parse_rate(" 250.0UH "),
            Some((250.0, RateUnits::MicrolitersPerHour))
        );
        assert_eq!(parse_rate("I0.125W0.000ML"), None);
        assert_eq!(parse_rate("MM"), None);
    }

    #[test]
    fn test_parse_dispensed() {
        assert_eq!(
            parse_dispensed("I0.125W0.000ML"),
            Some(Dispensed {
                infused: 0.125,
                withdrawn: 0.0,
                units: VolumeUnits::Milliliters,
            })
        );
        assert_eq!(
            parse_dispensed("I12W3.5UL").map(|d| d.withdrawn),
            Some(3.5)
        );
        assert_eq!(parse_dispensed("1.500MM"), None);
        assert_eq!(parse_dispensed("0125W0000"), None);
    }

    #[test]
    fn test_units_parse_and_convert() {
        assert_eq!("mm".parse::<RateUnits>().unwrap(), RateUnits::MillilitersPerMinute);
        assert!(matches!("XX".parse::<RateUnits>(), Err(PumpError::Value(_))));
        assert_eq!(
            VolumeUnits::Milliliters.convert(250.0, VolumeUnits::Microliters),
            0.25
        );
    }

    #[test]
    fn test_etx_codec_splits_frames() {
        let mut codec = EtxCodec;
        let mut buf = BytesMut::from(&b"\x0201S\x03\x02xxI\x03\x0202W"[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(first.address, 1);

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Err(DecodeError::InvalidAddress(_))));

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\x03");
        let third = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(matches!(
            third.body,
            FrameBody::Prompt {
                prompt: Prompt::Withdrawing,
                ..
            }
        ));
    }

    #[test]
    fn test_etx_codec_discards_overlong_noise() {
        let mut codec = EtxCodec;
        let mut buf = BytesMut::from(&[b'9'; MAX_FRAME_LEN + 1][..]);
        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(item, Err(DecodeError::Overlong(MAX_FRAME_LEN)));
        assert!(buf.is_empty());
    }
}
