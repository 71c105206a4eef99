//! Per-pump protocol state machine
//!
//! Pure and synchronous: [`PumpState::observe`] folds one worker slot into
//! the state and returns the [`Action`]s the controller must carry out.
//! Nothing here touches the bus.
//!
//! Alarm policy is transition-only. A newly observed alarm code that differs
//! from the recorded one triggers exactly one mitigation; repeats are
//! ignored; frames without an alarm never clear it. Only an explicit
//! `set_alarm(false)` leaves [`PumpPhase::Alarmed`].

use serde::Serialize;

use crate::bus::{CommandSeq, WorkerSlot};
use crate::config::Limits;
use crate::error::{PumpError, Result};
use crate::protocols::new_era::codec::{format_number, parse_dispensed, parse_rate};
use crate::protocols::new_era::constants::POSITION_DEAD_BAND;
use crate::protocols::new_era::{
    Address, AlarmCode, Direction, Dispensed, ErrorCode, Prompt, RateUnits, VolumeUnits,
};

/// Controller-local operation counter
pub type OpSeq = u64;

/// Handle for awaiting one state-changing operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTicket {
    pub op_seq: OpSeq,
    /// Last command the operation put on the bus
    pub last_command: CommandSeq,
}

impl OperationTicket {
    /// Ticket for an operation that needed no commands
    pub fn settled() -> Self {
        Self {
            op_seq: 0,
            last_command: 0,
        }
    }
}

/// Outcome of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// Not settled within the busy timeout; the caller simply proceeds
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpPhase {
    Stopped,
    Paused,
    Infusing,
    Withdrawing,
    Purging,
    Alarmed,
}

impl PumpPhase {
    /// Phase reported by a prompt; undocumented prompts leave it unchanged
    pub fn from_prompt(prompt: Prompt) -> Option<Self> {
        match prompt {
            Prompt::Infusing => Some(PumpPhase::Infusing),
            Prompt::Withdrawing => Some(PumpPhase::Withdrawing),
            Prompt::Stopped => Some(PumpPhase::Stopped),
            Prompt::Paused | Prompt::TimedPause | Prompt::UserWait => Some(PumpPhase::Paused),
            Prompt::Purging => Some(PumpPhase::Purging),
            Prompt::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimeStage {
    Withdraw,
    Infuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Move,
    Rate,
    Alarm,
    Home,
    Prime(PrimeStage),
    Purge,
    Stop,
    Run,
    Direct,
}

/// Side effects requested by [`PumpState::observe`]
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Drive buzzer and alarm output for a newly observed alarm
    Mitigate(AlarmCode),
    /// Withdraw stage of a prime finished; send the infuse stage
    StartPrimeInfuse { op_seq: OpSeq },
    /// Device rejected a command
    DeviceError(ErrorCode),
    Completed { op_seq: OpSeq, kind: OperationKind },
}

/// Validated move request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovePlan {
    pub target: f64,
    pub direction: Direction,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveOperation {
    op_seq: OpSeq,
    kind: OperationKind,
    last_command: CommandSeq,
}

#[derive(Debug, Clone, Copy)]
struct MoveTrack {
    origin: f64,
    /// `CLD WDR` of this move; older dispensed counters are stale
    cleared_at: CommandSeq,
    run_at: CommandSeq,
    observed: bool,
}

/// Everything the controller knows about one pump
#[derive(Debug, Clone)]
pub struct PumpState {
    pub address: Address,
    pub volume_units: VolumeUnits,
    pub current_prompt: Option<Prompt>,
    pub current_alarm: Option<AlarmCode>,
    pub busy: bool,
    pub homing: bool,
    pub purging: bool,
    pub position: f64,
    pub destination: f64,
    pub rate: Option<f64>,
    pub rate_units: RateUnits,
    device_phase: PumpPhase,
    operation: Option<ActiveOperation>,
    move_track: Option<MoveTrack>,
    last_op: OpSeq,
    settled_op: OpSeq,
    last_slot_update: u64,
}

impl PumpState {
    pub fn new(address: Address, volume_units: VolumeUnits, rate_units: RateUnits) -> Self {
        Self {
            address,
            volume_units,
            current_prompt: None,
            current_alarm: None,
            busy: false,
            homing: false,
            purging: false,
            position: 0.0,
            destination: 0.0,
            rate: None,
            rate_units,
            device_phase: PumpPhase::Stopped,
            operation: None,
            move_track: None,
            last_op: 0,
            settled_op: 0,
            last_slot_update: 0,
        }
    }

    pub fn phase(&self) -> PumpPhase {
        if self.current_alarm.is_some() {
            PumpPhase::Alarmed
        } else {
            self.device_phase
        }
    }

    /// The operation and every operation it superseded have settled
    pub fn is_settled(&self, ticket: OperationTicket) -> bool {
        ticket.op_seq <= self.settled_op
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Start tracking an operation whose last command is `last_command`
    ///
    /// A still-running operation is superseded; it settles together with
    /// this one.
    pub fn begin(&mut self, kind: OperationKind, last_command: CommandSeq) -> OperationTicket {
        self.last_op += 1;
        self.operation = Some(ActiveOperation {
            op_seq: self.last_op,
            kind,
            last_command,
        });
        self.busy = true;
        match kind {
            OperationKind::Home => {
                self.homing = true;
                self.move_track = None;
            },
            OperationKind::Prime(_) | OperationKind::Purge => {
                self.purging = true;
                self.move_track = None;
            },
            OperationKind::Stop => self.move_track = None,
            _ => {},
        }
        OperationTicket {
            op_seq: self.last_op,
            last_command,
        }
    }

    /// Record the commands of a follow-up stage
    pub fn advance_operation(&mut self, op_seq: OpSeq, last_command: CommandSeq) {
        if let Some(op) = self.operation.as_mut().filter(|op| op.op_seq == op_seq) {
            op.last_command = last_command;
        }
    }

    /// Validate a move and decide its direction and magnitude
    ///
    /// `Ok(None)` means the target is within the dead-band and nothing
    /// should be sent. A returned plan changes nothing until
    /// [`PumpState::start_move`].
    pub fn plan_move(&mut self, target: f64, limits: &Limits) -> Result<Option<MovePlan>> {
        if !target.is_finite() || !limits.contains(target) {
            return Err(PumpError::value(format!(
                "Target {target} outside limits [{}, {}]",
                limits.min, limits.max
            )));
        }
        let delta = target - self.position;
        if delta.abs() < POSITION_DEAD_BAND {
            self.destination = target;
            return Ok(None);
        }
        let volume = delta.abs();
        // Fail before anything is queued
        format_number(volume)?;
        Ok(Some(MovePlan {
            target,
            direction: if delta > 0.0 {
                Direction::Withdraw
            } else {
                Direction::Infuse
            },
            volume,
        }))
    }

    pub fn start_move(
        &mut self,
        plan: &MovePlan,
        cleared_at: CommandSeq,
        run_at: CommandSeq,
    ) -> OperationTicket {
        self.destination = plan.target;
        self.move_track = Some(MoveTrack {
            origin: self.position,
            cleared_at,
            run_at,
            observed: false,
        });
        self.begin(OperationKind::Move, run_at)
    }

    /// A user alarm request would change the recorded alarm
    pub fn alarm_would_change(&self, on: bool) -> bool {
        on != self.current_alarm.is_some()
    }

    /// Record a user alarm request; `false` if it changes nothing
    pub fn set_alarm(&mut self, on: bool) -> bool {
        if !self.alarm_would_change(on) {
            return false;
        }
        if on {
            self.current_alarm = Some(AlarmCode::UserCommanded);
            self.force_stopped_position();
        } else {
            self.current_alarm = None;
        }
        true
    }

    /// Drop the cached rate until the next `RAT` answer
    pub fn invalidate_rate(&mut self) {
        self.rate = None;
    }

    pub fn record_rate(&mut self, rate: f64, units: RateUnits) {
        self.rate = Some(rate);
        self.rate_units = units;
    }

    fn force_stopped_position(&mut self) {
        self.position = 0.0;
        self.move_track = None;
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Fold a worker slot into the state
    ///
    /// Slots already seen (by update counter) are ignored.
    pub fn observe(&mut self, slot: &WorkerSlot) -> Vec<Action> {
        let mut actions = Vec::new();
        if slot.updates <= self.last_slot_update {
            return actions;
        }
        self.last_slot_update = slot.updates;

        if let Some(code) = slot.alarm {
            self.observe_alarm(code, &mut actions);
            return actions;
        }
        if let Some(error) = &slot.error {
            actions.push(Action::DeviceError(error.clone()));
        }
        let Some(prompt) = slot.prompt else {
            return actions;
        };

        self.current_prompt = Some(prompt);
        if let Some(phase) = PumpPhase::from_prompt(prompt) {
            self.device_phase = phase;
        }

        if let Some(data) = slot.data.as_deref() {
            if let Some((rate, units)) = parse_rate(data) {
                self.record_rate(rate, units);
            } else if let Some(dispensed) = parse_dispensed(data) {
                self.track_position(dispensed, slot.command_seq);
            }
        }

        if prompt.is_active() {
            self.busy = true;
        } else if prompt.is_terminal() {
            self.settle(slot.command_seq, &mut actions);
        }
        actions
    }

    /// Mitigate each distinct device alarm once
    ///
    /// The first device alarm after a user alarm only replaces the code.
    fn observe_alarm(&mut self, code: AlarmCode, actions: &mut Vec<Action>) {
        let previous = self.current_alarm;
        if previous == Some(code) {
            return;
        }
        self.current_alarm = Some(code);
        if previous == Some(AlarmCode::UserCommanded) {
            return;
        }
        self.force_stopped_position();
        actions.push(Action::Mitigate(code));
    }

    fn track_position(&mut self, dispensed: Dispensed, command_seq: CommandSeq) {
        let units = self.volume_units;
        if let Some(track) = self.move_track.as_mut() {
            if command_seq > track.cleared_at {
                let infused = units.convert(dispensed.infused, dispensed.units);
                let withdrawn = units.convert(dispensed.withdrawn, dispensed.units);
                self.position = track.origin - infused + withdrawn;
                track.observed = true;
            }
        }
    }

    /// Terminal prompt decoded after `command_seq` was transmitted
    fn settle(&mut self, command_seq: CommandSeq, actions: &mut Vec<Action>) {
        if let Some(track) = self.move_track {
            if command_seq > track.run_at {
                if !track.observed {
                    self.position = self.destination;
                }
                self.move_track = None;
            }
        }

        let Some(op) = self.operation else {
            self.busy = false;
            return;
        };
        // Answer to a command sent before the operation's last one
        if command_seq <= op.last_command {
            return;
        }
        self.busy = false;

        match op.kind {
            OperationKind::Prime(PrimeStage::Withdraw) => {
                if self.current_alarm.is_some() {
                    return;
                }
                self.operation = Some(ActiveOperation {
                    kind: OperationKind::Prime(PrimeStage::Infuse),
                    // Filled in once the infuse stage is queued
                    last_command: CommandSeq::MAX,
                    ..op
                });
                self.busy = true;
                actions.push(Action::StartPrimeInfuse { op_seq: op.op_seq });
                return;
            },
            OperationKind::Prime(PrimeStage::Infuse) | OperationKind::Purge => {
                if self.current_alarm.is_some() {
                    return;
                }
                self.position = 0.0;
                self.destination = 0.0;
                self.purging = false;
            },
            OperationKind::Home => {
                self.position = 0.0;
                self.destination = 0.0;
                self.homing = false;
            },
            _ => {},
        }

        self.operation = None;
        self.settled_op = op.op_seq;
        actions.push(Action::Completed {
            op_seq: op.op_seq,
            kind: op.kind,
        });
    }
}
