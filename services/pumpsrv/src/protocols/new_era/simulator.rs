//! Scripted New Era pump bus for testing
//!
//! Sits on the far end of a byte stream (usually one half of
//! `tokio::io::duplex`) and answers CR-terminated commands for addresses
//! 0-9 with STX/ETX framed responses. Moves and purges take a configurable
//! number of `DIS` polls to finish, so busy tracking can be exercised
//! without hardware.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::codec::{parse_rate, Direction, RateUnits, VolumeUnits};
use super::constants::{ADDRESS_SLOTS, CR};
use super::frame::{AlarmCode, ErrorCode, Frame, Prompt};

/// Simulator behaviour knobs
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// `DIS` polls a move or purge stays active before it completes
    pub move_polls: u32,
    /// Rate every unit reports before it is set
    pub initial_rate: f64,
    pub initial_rate_units: RateUnits,
    /// Delay before answering a command
    pub response_delay: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            move_polls: 1,
            initial_rate: 1.0,
            initial_rate_units: RateUnits::MillilitersPerMinute,
            response_delay: Duration::ZERO,
        }
    }
}

/// A command as the simulator received it
#[derive(Debug, Clone)]
pub struct ReceivedCommand {
    pub text: String,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Move {
        direction: Direction,
        volume: f64,
        polls_left: u32,
    },
    Purge {
        polls_left: u32,
    },
}

#[derive(Debug, Clone)]
struct UnitState {
    prompt: Prompt,
    alarm: Option<AlarmCode>,
    rate: f64,
    rate_units: RateUnits,
    direction: Direction,
    volume: f64,
    volume_units: VolumeUnits,
    infused: f64,
    withdrawn: f64,
    pending: Option<Pending>,
    buzzer: bool,
    alarm_output: bool,
    silent: bool,
}

impl UnitState {
    fn new(config: &SimulatorConfig) -> Self {
        Self {
            prompt: Prompt::Stopped,
            alarm: None,
            rate: config.initial_rate,
            rate_units: config.initial_rate_units,
            direction: Direction::Infuse,
            volume: 0.0,
            volume_units: VolumeUnits::Milliliters,
            infused: 0.0,
            withdrawn: 0.0,
            pending: None,
            buzzer: false,
            alarm_output: false,
            silent: false,
        }
    }

    fn advance(&mut self) {
        match self.pending {
            Some(Pending::Move {
                direction,
                volume,
                polls_left: 0,
            }) => {
                match direction {
                    Direction::Infuse => self.infused += volume,
                    Direction::Withdraw => self.withdrawn += volume,
                }
                self.pending = None;
                self.prompt = Prompt::Stopped;
            },
            Some(Pending::Purge { polls_left: 0 }) => {
                self.pending = None;
                self.prompt = Prompt::Stopped;
            },
            Some(Pending::Move {
                ref mut polls_left, ..
            })
            | Some(Pending::Purge { ref mut polls_left }) => *polls_left -= 1,
            None => {},
        }
    }
}

struct SimState {
    config: SimulatorConfig,
    units: Vec<UnitState>,
    received: Vec<ReceivedCommand>,
}

impl SimState {
    fn handle(&mut self, text: &str) -> Option<Frame> {
        self.received.push(ReceivedCommand {
            text: text.to_string(),
            at: Instant::now(),
        });

        let (address, rest) = match text.strip_prefix('*') {
            Some(rest) => (0u8, rest),
            None => {
                let digits = text.get(0..2)?;
                (digits.parse().ok()?, text.get(2..)?)
            },
        };
        let unit = self.units.get_mut(address as usize)?;
        if unit.silent {
            return None;
        }
        if rest.len() < 3 {
            return Some(Frame::error(address, unit.prompt, ErrorCode::Unrecognized));
        }
        let (mnemonic, args) = rest.split_at(3);
        let mnemonic = mnemonic.to_ascii_uppercase();
        let args = args.trim();

        let mut data = None;
        match (mnemonic.as_str(), args) {
            ("DIS", _) => {
                if let Some(code) = unit.alarm {
                    return Some(Frame::alarm(address, code));
                }
                unit.advance();
                data = Some(format!(
                    "I{:.3}W{:.3}{}",
                    unit.infused, unit.withdrawn, unit.volume_units
                ));
            },
            ("RAT", "") => data = Some(format!("{:.3}{}", unit.rate, unit.rate_units)),
            ("RAT", args) => match args.strip_prefix('C').and_then(parse_rate) {
                Some((rate, units)) => {
                    unit.rate = rate;
                    unit.rate_units = units;
                },
                None => return Some(Frame::error(address, unit.prompt, ErrorCode::OutOfRange)),
            },
            ("DIR", "INF") => unit.direction = Direction::Infuse,
            ("DIR", "WDR") => unit.direction = Direction::Withdraw,
            ("DIR", "STP") => {},
            ("VOL", "UL") => unit.volume_units = VolumeUnits::Microliters,
            ("VOL", "ML") => unit.volume_units = VolumeUnits::Milliliters,
            ("VOL", args) => match args.parse::<f64>() {
                Ok(volume) => unit.volume = volume,
                Err(_) => return Some(Frame::error(address, unit.prompt, ErrorCode::OutOfRange)),
            },
            ("RUN", _) => {
                unit.pending = Some(Pending::Move {
                    direction: unit.direction,
                    volume: unit.volume,
                    polls_left: self.config.move_polls,
                });
                unit.prompt = match unit.direction {
                    Direction::Infuse => Prompt::Infusing,
                    Direction::Withdraw => Prompt::Withdrawing,
                };
            },
            ("STP", _) => {
                unit.pending = None;
                unit.prompt = Prompt::Stopped;
            },
            ("PUR", _) => {
                unit.pending = Some(Pending::Purge {
                    polls_left: self.config.move_polls,
                });
                unit.prompt = Prompt::Purging;
            },
            ("CLD", "INF") => unit.infused = 0.0,
            ("CLD", "WDR") => unit.withdrawn = 0.0,
            ("BUZ", args) => unit.buzzer = args == "1",
            ("OUT", args) if args.len() == 2 => unit.alarm_output = args.ends_with('1'),
            _ => return Some(Frame::error(address, unit.prompt, ErrorCode::Unrecognized)),
        }
        Some(Frame::prompt(address, unit.prompt, data))
    }
}

/// Running simulator; the serving task stops when this is dropped
pub struct PumpSimulator {
    state: Arc<Mutex<SimState>>,
    inject_tx: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

impl PumpSimulator {
    /// Serve the pump side of `io`
    pub fn spawn<T>(io: T, config: SimulatorConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let units = (0..ADDRESS_SLOTS).map(|_| UnitState::new(&config)).collect();
        let state = Arc::new(Mutex::new(SimState {
            config,
            units,
            received: Vec::new(),
        }));
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(io, state.clone(), inject_rx));
        Self {
            state,
            inject_tx,
            task,
        }
    }

    /// Commands received so far, without the trailing CR
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .map(|c| c.text.clone())
            .collect()
    }

    pub fn received(&self) -> Vec<ReceivedCommand> {
        self.state.lock().received.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().received.clear();
    }

    /// Report `code` on every `DIS` to `address` until cleared
    pub fn raise_alarm(&self, address: u8, code: AlarmCode) {
        if let Some(unit) = self.state.lock().units.get_mut(address as usize) {
            unit.alarm = Some(code);
            unit.pending = None;
            unit.prompt = Prompt::Stopped;
        }
    }

    pub fn clear_alarm(&self, address: u8) {
        if let Some(unit) = self.state.lock().units.get_mut(address as usize) {
            unit.alarm = None;
        }
    }

    /// Stop answering on `address`
    pub fn set_silent(&self, address: u8, silent: bool) {
        if let Some(unit) = self.state.lock().units.get_mut(address as usize) {
            unit.silent = silent;
        }
    }

    pub fn buzzer_on(&self, address: u8) -> bool {
        self.state
            .lock()
            .units
            .get(address as usize)
            .is_some_and(|u| u.buzzer)
    }

    pub fn alarm_output_on(&self, address: u8) -> bool {
        self.state
            .lock()
            .units
            .get(address as usize)
            .is_some_and(|u| u.alarm_output)
    }

    /// Write raw bytes onto the line, e.g. a corrupted frame
    pub fn inject(&self, raw: impl Into<Bytes>) {
        let _ = self.inject_tx.send(raw.into());
    }
}

impl Drop for PumpSimulator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<T>(io: T, state: Arc<Mutex<SimState>>, mut inject_rx: mpsc::UnboundedReceiver<Bytes>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(io);
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        let (reply, delay) = tokio::select! {
            read = reader.read_until(CR, &mut line) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line)
                        .trim_end_matches(char::from(CR))
                        .to_string();
                    line.clear();
                    let mut state = state.lock();
                    let frame = state.handle(&text);
                    debug!(command = %text, reply = ?frame, "simulator");
                    (frame.map(|f| f.to_wire()), state.config.response_delay)
                },
            },
            Some(raw) = inject_rx.recv() => (Some(raw), Duration::ZERO),
        };

        if let Some(bytes) = reply {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    }
}
