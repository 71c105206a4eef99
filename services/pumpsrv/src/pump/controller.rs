//! Pump controller
//!
//! Binds one bus address to a [`SerialDispatcher`], turns high-level
//! requests into command sequences and folds the address slot back into a
//! [`PumpState`]. A controller never blocks on the line: operations return
//! an [`OperationTicket`] as soon as their commands are queued, and callers
//! that need to wait use [`PumpController::wait_for`] or
//! [`PumpController::wait_idle`], both bounded by the busy timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use errors::{ErrorInfo, ServiceErrorTrait};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{
    Action, Completion, OperationKind, OperationTicket, PrimeStage, PumpPhase, PumpState,
};
use crate::bus::{CommandSeq, DispatcherRegistry, LineHealth, SerialDispatcher, WorkerSlot};
use crate::config::{BusConfig, Limits, PumpConfig};
use crate::error::{PumpError, Result};
use crate::protocols::new_era::codec::parse_rate;
use crate::protocols::new_era::constants::{
    DEFAULT_BUSY_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_QUERY_RETRIES, DEFAULT_QUERY_TIMEOUT,
};
use crate::protocols::new_era::{
    Address, AlarmCode, Command, Direction, Prompt, RateUnits, VolumeUnits,
};

// ============================================================================
// Settings
// ============================================================================

/// Per-pump settings
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub name: String,
    pub address: Address,
    pub volume_units: VolumeUnits,
    pub rate_units: RateUnits,
    pub limits: Limits,
    pub poll_interval: Duration,
    pub busy_timeout: Duration,
    pub query_timeout: Duration,
    pub query_retries: u32,
}

impl ControllerSettings {
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
            volume_units: VolumeUnits::Milliliters,
            rate_units: RateUnits::MillilitersPerMinute,
            limits: Limits::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            query_retries: DEFAULT_QUERY_RETRIES,
        }
    }

    pub fn from_config(config: &PumpConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            address: config.address()?,
            volume_units: config.volume_units,
            rate_units: config.rate_units,
            limits: config.limits,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            query_timeout: Duration::from_millis(config.query_timeout_ms),
            query_retries: config.query_retries,
        })
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Published view of one pump
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpSnapshot {
    pub name: String,
    pub address: String,
    pub position: f64,
    pub destination: f64,
    pub volume_units: VolumeUnits,
    pub rate: Option<f64>,
    pub rate_units: RateUnits,
    pub alarm: Option<AlarmCode>,
    pub prompt: Option<Prompt>,
    pub busy: bool,
    pub homing: bool,
    pub purging: bool,
    pub phase: PumpPhase,
    pub line: LineHealth,
    pub last_error: Option<ErrorInfo>,
    pub taken_at: DateTime<Utc>,
}

// ============================================================================
// Controller
// ============================================================================

struct Inner {
    state: PumpState,
    last_error: Option<ErrorInfo>,
    /// Sequence of the most recent `DIS` poll
    last_poll: CommandSeq,
}

pub struct PumpController {
    settings: ControllerSettings,
    dispatcher: Arc<SerialDispatcher>,
    inner: Mutex<Inner>,
    /// Bumped after every state change; waiters re-check on each bump
    changes: watch::Sender<u64>,
}

impl PumpController {
    /// Bind a controller to `dispatcher`
    ///
    /// Queues a throwaway `DIS` (the first response after power-up is often
    /// garbage) followed by a rate query. Unit addresses above 9 are
    /// rejected before anything is queued.
    pub fn new(
        dispatcher: Arc<SerialDispatcher>,
        settings: ControllerSettings,
    ) -> Result<Arc<Self>> {
        settings.address.validate()?;
        let state = PumpState::new(settings.address, settings.volume_units, settings.rate_units);
        let (changes, _) = watch::channel(0);
        let controller = Arc::new(Self {
            settings,
            dispatcher,
            inner: Mutex::new(Inner {
                state,
                last_error: None,
                last_poll: 0,
            }),
            changes,
        });

        controller.enqueue(&Command::status())?;
        controller.enqueue(&Command::rate_query())?;
        info!(
            "Pump {} bound to {} address {}",
            controller.settings.name,
            controller.dispatcher.port(),
            controller.settings.address
        );
        Ok(controller)
    }

    /// Build from configuration, sharing the bus dispatcher through `registry`
    pub fn open(
        registry: &DispatcherRegistry,
        bus: &BusConfig,
        config: &PumpConfig,
    ) -> Result<Arc<Self>> {
        let settings = ControllerSettings::from_config(config)?;
        let dispatcher = registry.get_or_open(bus)?;
        Self::new(dispatcher, settings)
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn address(&self) -> Address {
        self.settings.address
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Arc<SerialDispatcher> {
        &self.dispatcher
    }

    pub fn snapshot(&self) -> PumpSnapshot {
        let inner = self.inner.lock();
        let state = &inner.state;
        let last_error = self
            .dispatcher
            .fault()
            .map(|e| e.to_error_info())
            .or_else(|| inner.last_error.clone());
        PumpSnapshot {
            name: self.settings.name.clone(),
            address: self.settings.address.to_string(),
            position: state.position,
            destination: state.destination,
            volume_units: state.volume_units,
            rate: state.rate,
            rate_units: state.rate_units,
            alarm: state.current_alarm,
            prompt: state.current_prompt,
            busy: state.busy,
            homing: state.homing,
            purging: state.purging,
            phase: state.phase(),
            line: self.dispatcher.health(),
            last_error,
            taken_at: Utc::now(),
        }
    }

    fn enqueue(&self, command: &Command) -> Result<CommandSeq> {
        let seq = self.dispatcher.enqueue(command.encode(self.settings.address))?;
        debug!(pump = %self.settings.name, seq, command = %command, "queued");
        Ok(seq)
    }

    /// Queue `commands` in order; returns the sequence of the last one
    fn enqueue_all(&self, commands: &[Command]) -> Result<CommandSeq> {
        let mut last = 0;
        for command in commands {
            last = self.enqueue(command)?;
        }
        Ok(last)
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Queue `commands` and track them as one operation
    fn run_operation(&self, kind: OperationKind, commands: &[Command]) -> Result<OperationTicket> {
        let ticket = {
            let mut inner = self.inner.lock();
            let last = self.enqueue_all(commands)?;
            inner.state.begin(kind, last)
        };
        self.notify();
        Ok(ticket)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Move the plunger to absolute `target`
    ///
    /// Targets within the dead-band of the current position send nothing and
    /// return an already-settled ticket.
    pub fn set_position(&self, target: f64) -> Result<OperationTicket> {
        let ticket = {
            let mut inner = self.inner.lock();
            let Some(plan) = inner.state.plan_move(target, &self.settings.limits)? else {
                debug!(pump = %self.settings.name, target, "within dead-band, nothing sent");
                return Ok(OperationTicket::settled());
            };
            let volume = Command::volume(plan.volume)?;

            self.enqueue(&Command::clear_volume(Direction::Infuse))?;
            let cleared_at = self.enqueue(&Command::clear_volume(Direction::Withdraw))?;
            let run_at = self.enqueue_all(&[
                Command::direction(plan.direction),
                Command::volume_units(self.settings.volume_units),
                volume,
                Command::run(),
            ])?;
            info!(
                "Pump {} moving {} {} {} to {}",
                self.settings.name,
                plan.direction,
                plan.volume,
                self.settings.volume_units,
                target
            );
            inner.state.start_move(&plan, cleared_at, run_at)
        };
        self.notify();
        Ok(ticket)
    }

    /// Set the pumping rate and re-query it
    ///
    /// The cached rate reads `None` until the device answers the query.
    pub fn set_rate(&self, rate: f64, units: RateUnits) -> Result<OperationTicket> {
        let set = Command::set_rate(rate, units)?;
        let ticket = {
            let mut inner = self.inner.lock();
            let last = self.enqueue_all(&[set, Command::rate_query()])?;
            inner.state.invalidate_rate();
            inner.state.begin(OperationKind::Rate, last)
        };
        self.notify();
        info!("Pump {} rate set to {} {}", self.settings.name, rate, units);
        Ok(ticket)
    }

    /// Ask the device for its rate, retrying up to the configured bound
    pub async fn query_rate(&self) -> Result<(f64, RateUnits)> {
        let slot = self.settings.address.slot();
        let attempts = self.settings.query_retries;
        for attempt in 1..=attempts {
            let Some(mut rx) = self.dispatcher.subscribe(slot) else {
                break;
            };
            let seq = self.enqueue(&Command::rate_query())?;
            let answer = tokio::time::timeout(self.settings.query_timeout, async {
                loop {
                    {
                        let current = rx.borrow_and_update();
                        if current.command_seq >= seq {
                            if let Some(rate) = current.data.as_deref().and_then(parse_rate) {
                                return Some(rate);
                            }
                        }
                    }
                    if rx.changed().await.is_err() {
                        return None;
                    }
                }
            })
            .await;

            match answer {
                Ok(Some((rate, units))) => {
                    self.inner.lock().state.record_rate(rate, units);
                    self.notify();
                    return Ok((rate, units));
                },
                _ => warn!(
                    "Pump {}: no rate answer (attempt {}/{})",
                    self.settings.name, attempt, attempts
                ),
            }
        }
        Err(PumpError::QueryFailed {
            query: Command::rate_query().mnemonic().to_string(),
            attempts,
        })
    }

    /// Raise or clear the user-commanded alarm
    ///
    /// Only transitions send anything: a repeated request is a no-op.
    pub fn set_alarm(&self, on: bool) -> Result<OperationTicket> {
        let ticket = {
            let mut inner = self.inner.lock();
            if !inner.state.alarm_would_change(on) {
                return Ok(OperationTicket::settled());
            }
            let last = self.enqueue_all(&[Command::buzzer(on), Command::alarm_output(on)])?;
            inner.state.set_alarm(on);
            inner.state.begin(OperationKind::Alarm, last)
        };
        self.notify();
        if on {
            warn!("Pump {} alarm raised by user", self.settings.name);
        } else {
            info!("Pump {} alarm cleared", self.settings.name);
        }
        Ok(ticket)
    }

    /// Stop and zero the dispensed counters; position becomes 0 once settled
    pub fn home(&self) -> Result<OperationTicket> {
        info!("Pump {} homing", self.settings.name);
        self.run_operation(
            OperationKind::Home,
            &[
                Command::stop(),
                Command::clear_volume(Direction::Infuse),
                Command::clear_volume(Direction::Withdraw),
            ],
        )
    }

    /// Purge withdrawing, then purge infusing
    pub fn prime(&self) -> Result<OperationTicket> {
        info!("Pump {} priming", self.settings.name);
        self.run_operation(
            OperationKind::Prime(PrimeStage::Withdraw),
            &[Command::direction(Direction::Withdraw), Command::purge()],
        )
    }

    /// Purge infusing; position becomes 0 once settled
    pub fn purge(&self) -> Result<OperationTicket> {
        info!("Pump {} purging", self.settings.name);
        self.run_operation(
            OperationKind::Purge,
            &[Command::direction(Direction::Infuse), Command::purge()],
        )
    }

    pub fn stop(&self) -> Result<OperationTicket> {
        self.run_operation(OperationKind::Stop, &[Command::stop()])
    }

    /// Start or stop continuous pumping at the current rate
    pub fn set_running(&self, running: bool) -> Result<OperationTicket> {
        if running {
            self.run_operation(OperationKind::Run, &[Command::run()])
        } else {
            self.stop()
        }
    }

    /// Send an arbitrary command to this pump
    pub fn direct_write(&self, mnemonic: &str, args: &[&str]) -> Result<OperationTicket> {
        let command = args
            .iter()
            .fold(Command::new(mnemonic), |command, arg| command.arg(*arg));
        self.run_operation(OperationKind::Direct, &[command])
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// Fold the latest slot into the state and poll with `DIS`
    ///
    /// A new poll is queued only once the previous one has been written, so
    /// a slow line never accumulates polls.
    pub fn update(&self) -> Result<()> {
        self.observe(&self.dispatcher.worker_state(self.settings.address.slot()));

        let mut inner = self.inner.lock();
        if inner.last_poll > self.dispatcher.last_transmitted() {
            return Ok(());
        }
        inner.last_poll = self.enqueue(&Command::status())?;
        Ok(())
    }

    fn observe(&self, slot: &WorkerSlot) {
        {
            let mut inner = self.inner.lock();
            let actions = inner.state.observe(slot);
            for action in actions {
                self.apply(&mut inner, action);
            }
        }
        self.notify();
    }

    fn apply(&self, inner: &mut Inner, action: Action) {
        match action {
            Action::Mitigate(code) => {
                warn!(
                    "Pump {} alarm {:?}: buzzer and alarm output on",
                    self.settings.name, code
                );
                if let Err(e) = self.enqueue_all(&[Command::buzzer(true), Command::alarm_output(true)]) {
                    warn!("Pump {}: mitigation not queued: {}", self.settings.name, e);
                }
            },
            Action::StartPrimeInfuse { op_seq } => {
                match self.enqueue_all(&[Command::direction(Direction::Infuse), Command::purge()]) {
                    Ok(last) => inner.state.advance_operation(op_seq, last),
                    Err(e) => warn!("Pump {}: prime infuse not queued: {}", self.settings.name, e),
                }
            },
            Action::DeviceError(code) => {
                let error = PumpError::Protocol {
                    address: self.settings.address.to_string(),
                    code: code.to_string(),
                };
                warn!("Pump {}: {}", self.settings.name, error);
                inner.last_error = Some(error.to_error_info());
            },
            Action::Completed { op_seq, kind } => {
                debug!(pump = %self.settings.name, op_seq, kind = ?kind, "operation settled");
            },
        }
    }

    /// Poll until `token` is cancelled or the dispatcher goes away
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let Some(mut slot_rx) = self.dispatcher.subscribe(self.settings.address.slot()) else {
            return;
        };
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = slot_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let slot = slot_rx.borrow_and_update().clone();
                    self.observe(&slot);
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.update() {
                        warn!("Pump {} poll failed: {}", self.settings.name, e);
                        if matches!(e, PumpError::Closed(_)) {
                            break;
                        }
                    }
                },
            }
        }
        debug!("Poller for {} stopped", self.settings.name);
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Wait until `ticket` settles or the busy timeout elapses
    pub async fn wait_for(&self, ticket: OperationTicket) -> Completion {
        let completion = self.wait_until(|state| state.is_settled(ticket)).await;
        if completion == Completion::TimedOut {
            debug!(
                pump = %self.settings.name,
                op_seq = ticket.op_seq,
                "operation not settled within {:?}",
                self.settings.busy_timeout
            );
        }
        completion
    }

    /// Wait until the pump reports a terminal prompt or the busy timeout
    /// elapses; `busy` is left as observed
    pub async fn wait_idle(&self) -> Completion {
        self.wait_until(|state| !state.busy).await
    }

    async fn wait_until(&self, done: impl Fn(&PumpState) -> bool) -> Completion {
        let mut changes = self.changes.subscribe();
        let deadline = tokio::time::sleep(self.settings.busy_timeout);
        tokio::pin!(deadline);

        loop {
            let settled = {
                let inner = self.inner.lock();
                done(&inner.state)
            };
            if settled {
                return Completion::Done;
            }
            tokio::select! {
                _ = &mut deadline => return Completion::TimedOut,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Completion::TimedOut;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::DispatcherSettings;
    use crate::protocols::new_era::simulator::{PumpSimulator, SimulatorConfig};
    use tracing_test::traced_test;

    fn dispatcher() -> (Arc<SerialDispatcher>, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(1024);
        let settings = DispatcherSettings {
            guard_interval: Duration::from_millis(1),
            read_timeout: Duration::from_millis(500),
            close_grace: Duration::from_millis(100),
        };
        (SerialDispatcher::spawn("test", near, settings), far)
    }

    #[test]
    fn test_settings_from_config() {
        let config = PumpConfig {
            name: "feed".to_string(),
            kind: Default::default(),
            port: "/dev/ttyUSB0".to_string(),
            address: Some(4),
            broadcast: false,
            volume_units: VolumeUnits::Microliters,
            rate_units: RateUnits::MicrolitersPerHour,
            limits: Limits { min: 0.0, max: 50.0 },
            poll_interval_ms: 100,
            busy_timeout_ms: 2000,
            query_timeout_ms: 300,
            query_retries: 2,
        };
        let settings = ControllerSettings::from_config(&config).unwrap();
        assert_eq!(settings.address, Address::Unit(4));
        assert_eq!(settings.busy_timeout, Duration::from_secs(2));
        assert_eq!(settings.query_retries, 2);

        let bad = PumpConfig {
            address: None,
            ..config
        };
        assert!(ControllerSettings::from_config(&bad).is_err());
    }

    #[tokio::test]
    async fn test_construction_queues_startup_commands() {
        let (dispatcher, _far) = dispatcher();
        let controller =
            PumpController::new(dispatcher.clone(), ControllerSettings::new("p", Address::Unit(1)))
                .unwrap();
        assert_eq!(dispatcher.last_enqueued(), 2);
        assert_eq!(controller.snapshot().rate, None);
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_out_of_limits_sends_nothing() {
        let (dispatcher, _far) = dispatcher();
        let mut settings = ControllerSettings::new("p", Address::Unit(1));
        settings.limits = Limits { min: 0.0, max: 5.0 };
        let controller = PumpController::new(dispatcher.clone(), settings).unwrap();
        let before = dispatcher.last_enqueued();

        assert!(matches!(controller.set_position(6.0), Err(PumpError::Value(_))));
        assert!(matches!(
            controller.set_rate(123_456.0, RateUnits::MillilitersPerMinute),
            Err(PumpError::Value(_))
        ));
        assert_eq!(dispatcher.last_enqueued(), before);
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_settled_ticket_returns_immediately() {
        let (dispatcher, _far) = dispatcher();
        let controller =
            PumpController::new(dispatcher.clone(), ControllerSettings::new("p", Address::Unit(1)))
                .unwrap();
        let ticket = controller.set_position(0.0).unwrap();
        assert_eq!(ticket, OperationTicket::settled());
        assert_eq!(controller.wait_for(ticket).await, Completion::Done);
        dispatcher.close().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_device_error_recorded_and_logged() {
        let (dispatcher, far) = dispatcher();
        let _sim = PumpSimulator::spawn(far, SimulatorConfig::default());
        let mut settings = ControllerSettings::new("p", Address::Unit(1));
        settings.poll_interval = Duration::from_millis(10);
        let controller = PumpController::new(dispatcher.clone(), settings).unwrap();
        let token = CancellationToken::new();
        tokio::spawn(controller.clone().run(token.clone()));

        controller.direct_write("XYZ", &[]).unwrap();
        let recorded = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(error) = controller.snapshot().last_error {
                    return error;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(recorded.code, "PROTOCOL_ERROR");
        assert!(logs_contain("Protocol error from address 01"));

        token.cancel();
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_closed_dispatcher_surfaces_error() {
        let (dispatcher, _far) = dispatcher();
        let controller =
            PumpController::new(dispatcher.clone(), ControllerSettings::new("p", Address::Unit(1)))
                .unwrap();
        dispatcher.close().await;
        assert!(matches!(controller.stop(), Err(PumpError::Closed(_))));
        assert!(matches!(controller.update(), Err(PumpError::Closed(_))));
    }

    #[tokio::test]
    async fn test_unit_address_out_of_range_rejected() {
        let (dispatcher, _far) = dispatcher();
        let result =
            PumpController::new(dispatcher.clone(), ControllerSettings::new("p", Address::Unit(12)));
        assert!(matches!(result, Err(PumpError::Configuration(_))));
        assert_eq!(dispatcher.last_enqueued(), 0);

        assert!(
            PumpController::new(dispatcher.clone(), ControllerSettings::new("b", Address::Broadcast))
                .is_ok()
        );
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_state_untouched() {
        let (dispatcher, _far) = dispatcher();
        let controller =
            PumpController::new(dispatcher.clone(), ControllerSettings::new("p", Address::Unit(1)))
                .unwrap();
        dispatcher.close().await;

        assert!(matches!(controller.set_alarm(true), Err(PumpError::Closed(_))));
        assert!(matches!(controller.set_position(1.0), Err(PumpError::Closed(_))));
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.alarm, None);
        assert_eq!(snapshot.destination, 0.0);
        assert!(!snapshot.busy);
    }
}
