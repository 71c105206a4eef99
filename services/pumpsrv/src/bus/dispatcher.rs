//! Serial line dispatcher
//!
//! One dispatcher owns one physical line. Commands from every pump on the
//! line go through a single FIFO [`CommandQueue`]; a writer task transmits
//! them one at a time with a guard interval after each write, and a reader
//! task decodes ETX-terminated responses into the per-address
//! [`WorkerTable`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::error::{PumpError, Result};
use crate::protocols::new_era::constants::{
    ADDRESS_SLOTS, DEFAULT_CLOSE_GRACE, DEFAULT_GUARD_INTERVAL, DEFAULT_READ_TIMEOUT,
};
use crate::protocols::new_era::{AlarmCode, ErrorCode, EtxCodec, Frame, FrameBody, Prompt};
use crate::transport::BusIo;

/// Monotonic sequence number assigned to each enqueued command
pub type CommandSeq = u64;

// ============================================================================
// Settings
// ============================================================================

/// Line timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Pause after each write before the next command
    pub guard_interval: Duration,
    /// Silence after a transmission before the line counts as unresponsive
    pub read_timeout: Duration,
    /// Time allowed for the tasks to unwind on close
    pub close_grace: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            guard_interval: DEFAULT_GUARD_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

impl From<&BusConfig> for DispatcherSettings {
    fn from(bus: &BusConfig) -> Self {
        Self {
            guard_interval: Duration::from_millis(bus.guard_interval_ms),
            read_timeout: Duration::from_millis(bus.read_timeout_ms),
            close_grace: Duration::from_millis(bus.close_grace_ms),
        }
    }
}

// ============================================================================
// Worker slots
// ============================================================================

/// Last decoded frame for one address, overwritten on every decode
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerSlot {
    pub prompt: Option<Prompt>,
    pub alarm: Option<AlarmCode>,
    pub error: Option<ErrorCode>,
    pub data: Option<String>,
    /// Last command transmitted on the line when this frame was decoded
    pub command_seq: CommandSeq,
    /// Number of frames decoded for this address
    pub updates: u64,
}

/// One watch channel per address, written only by the reader task
pub struct WorkerTable {
    slots: [watch::Sender<WorkerSlot>; ADDRESS_SLOTS],
}

impl Default for WorkerTable {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| watch::channel(WorkerSlot::default()).0),
        }
    }
}

impl WorkerTable {
    /// Point-in-time copy of a slot
    pub fn get(&self, slot: usize) -> Option<WorkerSlot> {
        self.slots.get(slot).map(|tx| tx.borrow().clone())
    }

    pub fn subscribe(&self, slot: usize) -> Option<watch::Receiver<WorkerSlot>> {
        self.slots.get(slot).map(watch::Sender::subscribe)
    }

    fn publish(&self, frame: Frame, command_seq: CommandSeq) {
        let Some(tx) = self.slots.get(frame.address as usize) else {
            return;
        };
        tx.send_modify(|slot| {
            match frame.body {
                FrameBody::Prompt {
                    prompt,
                    data,
                    error,
                } => {
                    slot.prompt = Some(prompt);
                    slot.alarm = None;
                    slot.error = error;
                    slot.data = data;
                },
                FrameBody::Alarm(code) => {
                    slot.prompt = None;
                    slot.alarm = Some(code);
                    slot.error = None;
                    slot.data = None;
                },
            }
            slot.command_seq = command_seq;
            slot.updates += 1;
        });
    }
}

// ============================================================================
// Command queue
// ============================================================================

/// A command waiting for the writer
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub seq: CommandSeq,
    pub bytes: Bytes,
}

/// Unbounded FIFO of raw commands for one line
///
/// Sequence numbers are assigned under the same lock as the send, so queue
/// order and sequence order always agree.
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<QueuedCommand>,
    last_seq: Mutex<CommandSeq>,
}

impl CommandQueue {
    fn new() -> (Self, mpsc::UnboundedReceiver<QueuedCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                last_seq: Mutex::new(0),
            },
            rx,
        )
    }

    fn push(&self, bytes: Bytes) -> Option<CommandSeq> {
        let mut last_seq = self.last_seq.lock();
        let seq = *last_seq + 1;
        self.tx.send(QueuedCommand { seq, bytes }).ok()?;
        *last_seq = seq;
        Some(seq)
    }

    /// Sequence number of the most recently enqueued command
    pub fn last_enqueued(&self) -> CommandSeq {
        *self.last_seq.lock()
    }
}

// ============================================================================
// Line health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineHealth {
    Healthy,
    /// Commands were sent but nothing came back within the read timeout
    Unresponsive,
    /// The stream ended or failed; the dispatcher no longer accepts commands
    Disconnected,
}

/// Most recent write to the line
#[derive(Debug, Clone, Copy)]
struct Transmit {
    seq: CommandSeq,
    at: Instant,
}

/// State shared by the dispatcher handle and its two tasks
struct LineState {
    port: String,
    workers: WorkerTable,
    transmits: watch::Sender<Transmit>,
    health: watch::Sender<LineHealth>,
    faults: AtomicU64,
    token: CancellationToken,
}

impl LineState {
    fn last_transmitted(&self) -> CommandSeq {
        self.transmits.borrow().seq
    }

    fn set_health(&self, health: LineHealth) {
        self.health.send_if_modified(|current| {
            // Disconnected is final
            if *current == health || *current == LineHealth::Disconnected {
                return false;
            }
            *current = health;
            true
        });
    }

    /// Stream is gone: stop both tasks and refuse further commands
    fn disconnect(&self, reason: &str) {
        error!("Port {} disconnected: {}", self.port, reason);
        self.faults.fetch_add(1, Ordering::Relaxed);
        self.set_health(LineHealth::Disconnected);
        self.token.cancel();
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Exclusive owner of one serial line
pub struct SerialDispatcher {
    settings: DispatcherSettings,
    queue: CommandQueue,
    line: Arc<LineState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SerialDispatcher {
    /// Take ownership of `io` and start the writer and reader tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(port: impl Into<String>, io: impl BusIo, settings: DispatcherSettings) -> Arc<Self> {
        let (queue, queue_rx) = CommandQueue::new();
        let (read_half, write_half) = tokio::io::split(io);
        let line = Arc::new(LineState {
            port: port.into(),
            workers: WorkerTable::default(),
            transmits: watch::channel(Transmit {
                seq: 0,
                at: Instant::now(),
            })
            .0,
            health: watch::channel(LineHealth::Healthy).0,
            faults: AtomicU64::new(0),
            token: CancellationToken::new(),
        });

        let writer = tokio::spawn(run_writer(
            line.clone(),
            queue_rx,
            write_half,
            settings.guard_interval,
        ));
        let reader = tokio::spawn(run_reader(line.clone(), read_half, settings.read_timeout));

        info!(
            "Dispatcher started on {} (guard {:?}, read timeout {:?})",
            line.port, settings.guard_interval, settings.read_timeout
        );
        Arc::new(Self {
            settings,
            queue,
            line,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    pub fn port(&self) -> &str {
        &self.line.port
    }

    pub fn settings(&self) -> DispatcherSettings {
        self.settings
    }

    /// Append raw command bytes; returns once queued, not once sent
    pub fn enqueue(&self, bytes: impl Into<Bytes>) -> Result<CommandSeq> {
        if self.line.token.is_cancelled() {
            return Err(PumpError::Closed(self.line.port.clone()));
        }
        self.queue
            .push(bytes.into())
            .ok_or_else(|| PumpError::Closed(self.line.port.clone()))
    }

    /// Point-in-time read of one address slot
    pub fn worker_state(&self, slot: usize) -> WorkerSlot {
        self.line.workers.get(slot).unwrap_or_default()
    }

    pub fn subscribe(&self, slot: usize) -> Option<watch::Receiver<WorkerSlot>> {
        self.line.workers.subscribe(slot)
    }

    /// Sequence number of the last command written to the line
    pub fn last_transmitted(&self) -> CommandSeq {
        self.line.last_transmitted()
    }

    pub fn last_enqueued(&self) -> CommandSeq {
        self.queue.last_enqueued()
    }

    pub fn health(&self) -> LineHealth {
        *self.line.health.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<LineHealth> {
        self.line.health.subscribe()
    }

    /// Read timeouts and stream failures observed since start
    pub fn fault_count(&self) -> u64 {
        self.line.faults.load(Ordering::Relaxed)
    }

    /// Current line fault, if any
    pub fn fault(&self) -> Option<PumpError> {
        match self.health() {
            LineHealth::Healthy => None,
            LineHealth::Unresponsive => Some(PumpError::PortUnresponsive {
                port: self.line.port.clone(),
                timeout: self.settings.read_timeout,
            }),
            LineHealth::Disconnected => Some(PumpError::Transport(format!(
                "Port {} disconnected",
                self.line.port
            ))),
        }
    }

    /// Cancelled by [`SerialDispatcher::close`] or by a stream failure
    pub fn is_closed(&self) -> bool {
        self.line.token.is_cancelled()
    }

    /// Cancel both tasks and release the port
    ///
    /// Queued commands that were not yet written are dropped.
    pub async fn close(&self) {
        self.line.token.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let pending = self.last_enqueued().saturating_sub(self.last_transmitted());

        if tokio::time::timeout(self.settings.close_grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                "Dispatcher on {} did not stop within {:?}, aborting",
                self.line.port, self.settings.close_grace
            );
            for handle in aborts {
                handle.abort();
            }
        }
        info!(
            "Dispatcher on {} closed ({} queued commands dropped)",
            self.line.port, pending
        );
    }
}

impl Drop for SerialDispatcher {
    fn drop(&mut self) {
        self.line.token.cancel();
    }
}

fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .flat_map(char::escape_default)
        .collect()
}

// ============================================================================
// Writer loop
// ============================================================================

async fn run_writer<W>(
    line: Arc<LineState>,
    mut queue: mpsc::UnboundedReceiver<QueuedCommand>,
    mut writer: W,
    guard_interval: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let command = tokio::select! {
            biased;
            _ = line.token.cancelled() => break,
            next = queue.recv() => match next {
                Some(command) => command,
                None => break,
            },
        };

        debug!(port = %line.port, seq = command.seq, tx = %printable(&command.bytes), "write");
        let written = async {
            writer.write_all(&command.bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            line.disconnect(&format!("write of seq {} failed: {e}", command.seq));
            break;
        }
        line.transmits.send_replace(Transmit {
            seq: command.seq,
            at: Instant::now(),
        });

        tokio::select! {
            biased;
            _ = line.token.cancelled() => break,
            _ = tokio::time::sleep(guard_interval) => {},
        }
    }
    debug!("Writer on {} stopped", line.port);
}

// ============================================================================
// Reader loop
// ============================================================================

/// Decode frames into the worker table
///
/// The read deadline runs from the first transmission not yet followed by
/// a frame, so an idle line never times out and a prompt answer to a
/// command written late in an idle stretch is never counted as a fault.
async fn run_reader<R>(line: Arc<LineState>, reader: R, read_timeout: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, EtxCodec);
    let mut transmits = line.transmits.subscribe();
    // Last transmitted seq when the most recent frame arrived
    let mut answered_through: CommandSeq = 0;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = line.token.cancelled() => break,
            changed = transmits.changed() => {
                if changed.is_err() {
                    break;
                }
                let sent = *transmits.borrow_and_update();
                if deadline.is_none() && sent.seq > answered_through {
                    deadline = Some(sent.at + read_timeout);
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                line.faults.fetch_add(1, Ordering::Relaxed);
                if *line.health.borrow() == LineHealth::Healthy {
                    warn!(
                        "Port {} unresponsive: no frame within {:?}",
                        line.port, read_timeout
                    );
                }
                line.set_health(LineHealth::Unresponsive);
                deadline = Some(Instant::now() + read_timeout);
            },
            next = frames.next() => match next {
                None => {
                    line.disconnect("end of stream");
                    break;
                },
                Some(Err(e)) => {
                    line.disconnect(&format!("read failed: {e}"));
                    break;
                },
                Some(Ok(Err(e))) => {
                    debug!(port = %line.port, error = %e, "discarding malformed frame");
                },
                Some(Ok(Ok(frame))) => {
                    let seq = line.last_transmitted();
                    answered_through = seq;
                    deadline = None;
                    if *line.health.borrow() == LineHealth::Unresponsive {
                        info!("Port {} responsive again", line.port);
                    }
                    line.set_health(LineHealth::Healthy);
                    debug!(port = %line.port, address = frame.address, seq, frame = ?frame.body, "read");
                    line.workers.publish(frame, seq);
                },
            },
        }
    }
    debug!("Reader on {} stopped", line.port);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tracing_test::traced_test;

    fn fast_settings() -> DispatcherSettings {
        DispatcherSettings {
            guard_interval: Duration::from_millis(5),
            read_timeout: Duration::from_millis(200),
            close_grace: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_seq() {
        let (near, _far) = tokio::io::duplex(256);
        let dispatcher = SerialDispatcher::spawn("test", near, fast_settings());
        let a = dispatcher.enqueue(&b"01DIS\r"[..]).unwrap();
        let b = dispatcher.enqueue(&b"02DIS\r"[..]).unwrap();
        assert!(b > a);
        assert_eq!(dispatcher.last_enqueued(), b);
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_frame_published_to_slot() {
        let (near, mut far) = tokio::io::duplex(256);
        let dispatcher = SerialDispatcher::spawn("test", near, fast_settings());
        let mut rx = dispatcher.subscribe(3).unwrap();

        far.write_all(b"\x0203I0125W0000\x03").await.unwrap();
        rx.changed().await.unwrap();

        let slot = dispatcher.worker_state(3);
        assert_eq!(slot.prompt, Some(Prompt::Infusing));
        assert_eq!(slot.data.as_deref(), Some("0125W0000"));
        assert_eq!(slot.updates, 1);
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_closed_dispatcher_rejects_commands() {
        let (near, mut far) = tokio::io::duplex(256);
        let dispatcher = SerialDispatcher::spawn("test", near, fast_settings());
        dispatcher.close().await;
        assert!(dispatcher.is_closed());
        assert!(matches!(
            dispatcher.enqueue(&b"*RUN\r"[..]),
            Err(PumpError::Closed(_))
        ));

        // Write half was dropped with the writer task
        let mut buf = Vec::new();
        far.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_silence_after_transmit_marks_unresponsive() {
        let (near, _far) = tokio::io::duplex(256);
        let dispatcher = SerialDispatcher::spawn("test", near, fast_settings());
        let mut health = dispatcher.subscribe_health();
        dispatcher.enqueue(&b"01DIS\r"[..]).unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            health.wait_for(|h| *h == LineHealth::Unresponsive),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(dispatcher.fault_count() >= 1);
        assert!(matches!(
            dispatcher.fault(),
            Some(PumpError::PortUnresponsive { .. })
        ));
        assert!(logs_contain("unresponsive"));
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_idle_line_is_not_a_fault() {
        let (near, _far) = tokio::io::duplex(256);
        let dispatcher = SerialDispatcher::spawn("test", near, fast_settings());
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(dispatcher.health(), LineHealth::Healthy);
        assert_eq!(dispatcher.fault_count(), 0);
        assert!(dispatcher.fault().is_none());
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_good_frame_restores_health() {
        let (near, mut far) = tokio::io::duplex(256);
        let dispatcher = SerialDispatcher::spawn("test", near, fast_settings());
        let mut health = dispatcher.subscribe_health();
        dispatcher.enqueue(&b"01DIS\r"[..]).unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            health.wait_for(|h| *h == LineHealth::Unresponsive),
        )
        .await
        .unwrap()
        .unwrap();

        far.write_all(b"\x0201S\x03").await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            health.wait_for(|h| *h == LineHealth::Healthy),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(dispatcher.worker_state(1).command_seq, 1);
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn test_prompt_answer_after_idle_is_not_a_fault() {
        let settings = DispatcherSettings {
            read_timeout: Duration::from_millis(300),
            ..fast_settings()
        };
        let (near, mut far) = tokio::io::duplex(256);
        let dispatcher = SerialDispatcher::spawn("test", near, settings);

        // Idle for most of one read timeout, then send
        tokio::time::sleep(Duration::from_millis(280)).await;
        dispatcher.enqueue(&b"01DIS\r"[..]).unwrap();
        let mut buf = [0u8; 6];
        far.read_exact(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        far.write_all(b"\x0201SI1.000W0.000ML\x03").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dispatcher.health(), LineHealth::Healthy);
        assert_eq!(dispatcher.fault_count(), 0);
        assert_eq!(dispatcher.worker_state(1).command_seq, 1);
        dispatcher.close().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_end_of_stream_disconnects() {
        let (near, far) = tokio::io::duplex(256);
        let dispatcher = SerialDispatcher::spawn("test", near, fast_settings());
        let mut health = dispatcher.subscribe_health();
        drop(far);

        tokio::time::timeout(
            Duration::from_secs(2),
            health.wait_for(|h| *h == LineHealth::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(dispatcher.is_closed());
        assert!(matches!(dispatcher.fault(), Some(PumpError::Transport(_))));
        assert!(matches!(
            dispatcher.enqueue(&b"01DIS\r"[..]),
            Err(PumpError::Closed(_))
        ));
        assert!(logs_contain("disconnected"));
        dispatcher.close().await;
        dispatcher.close().await;
    }

    /// Reads never complete, writes always fail
    struct BrokenWrites;

    impl AsyncRead for BrokenWrites {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }

    impl AsyncWrite for BrokenWrites {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_failure_disconnects() {
        let dispatcher = SerialDispatcher::spawn("test", BrokenWrites, fast_settings());
        let mut health = dispatcher.subscribe_health();
        dispatcher.enqueue(&b"01DIS\r"[..]).unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            health.wait_for(|h| *h == LineHealth::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(dispatcher.is_closed());
        assert_eq!(dispatcher.last_transmitted(), 0);
        assert!(dispatcher.enqueue(&b"01DIS\r"[..]).is_err());
        dispatcher.close().await;
    }

    #[test]
    fn test_printable_escapes_control_bytes() {
        assert_eq!(printable(b"01DIS\r"), "01DIS\\r");
    }
}
