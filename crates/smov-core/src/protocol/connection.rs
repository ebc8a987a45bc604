//! Connection management
//!
//! Handles the connection lifecycle: opening the port, running the handshake,
//! and the background link thread that reads everything the device sends.
//!
//! After the handshake the transport is split in two. The link thread owns the
//! read half and is the only reader. The write half sits behind a mutex shared by
//! the [`Sender`] and the link thread's heartbeat. At most one sequenced command
//! is in flight at a time; its acknowledgment frees the slot for the next one.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::commands::{Command, Response};
use super::handles::{FaultHandle, Sender};
use super::handshake::{self, Negotiated};
use super::latch::FaultLatch;
use super::serial::{clear_buffers, configure_port, open_port, DevicePath};
use super::stream::{is_idle, SerialChannel, Transport};
use super::{
    ErrorKind, Packet, PacketDecoder, ProtocolError, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_BAUD_RATE,
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_SETTLE_DELAY_MS,
};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Connected and ready
    Connected,
    /// The link stopped on a failure; tear down to release the port
    Error,
    /// Torn down
    Disconnected,
}

/// Inclusive range of speeds the device accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedLimits {
    /// Lowest accepted speed
    pub min: i16,
    /// Highest accepted speed
    pub max: i16,
}

impl SpeedLimits {
    /// Create a range, `None` if `min > max`
    pub fn new(min: i16, max: i16) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    /// Check whether a speed is inside the range
    pub fn contains(&self, speed: i16) -> bool {
        (self.min..=self.max).contains(&speed)
    }
}

impl Default for SpeedLimits {
    fn default() -> Self {
        Self {
            min: 0,
            max: i16::MAX,
        }
    }
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Wait after opening the port before the handshake, in milliseconds
    pub settle_delay_ms: u64,
    /// Maximum wait for the handshake reply, in milliseconds
    pub handshake_timeout_ms: u64,
    /// Read poll interval of the link thread, in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum wait for a command acknowledgment, in milliseconds
    pub ack_timeout_ms: u64,
    /// Idle time before the link thread pings the device, in milliseconds (0 disables)
    pub heartbeat_interval_ms: u64,
    /// Speed range used when the device does not report its own
    pub speed_limits: SpeedLimits,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            speed_limits: SpeedLimits::default(),
        }
    }
}

impl ConnectionConfig {
    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    fn poll_interval(&self) -> Duration {
        // A zero read timeout would mean "block forever" on some transports
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}

/// Open a serial device, run the handshake and start the link thread.
///
/// Handshake failures are returned here and leave nothing behind. On success
/// the two handles share one connection; see [`Sender`] and [`FaultHandle`].
pub fn connect(
    path: &DevicePath,
    config: &ConnectionConfig,
) -> Result<(Sender, FaultHandle), ProtocolError> {
    tracing::info!("opening {} at {} baud", path, config.baud_rate);

    let mut port = open_port(path, config.baud_rate, config.poll_interval())?;
    configure_port(port.as_mut())?;
    clear_buffers(port.as_mut())?;

    if config.settle_delay_ms > 0 {
        tracing::debug!(
            "waiting {}ms after port open for the controller to boot",
            config.settle_delay_ms
        );
        thread::sleep(Duration::from_millis(config.settle_delay_ms));
        // Drop boot chatter received during the delay
        clear_buffers(port.as_mut())?;
    }

    connect_transport(Box::new(SerialChannel::new(port)), config)
}

/// Run the handshake over an already open transport and start the link thread
pub fn connect_transport(
    mut transport: Box<dyn Transport>,
    config: &ConnectionConfig,
) -> Result<(Sender, FaultHandle), ProtocolError> {
    transport.clear_input_buffer()?;

    let mut decoder = PacketDecoder::new();
    let negotiated = handshake::negotiate(
        transport.as_mut(),
        &mut decoder,
        config.handshake_timeout(),
    )?;

    let mut reader = transport.try_clone()?;
    reader.set_timeout(config.poll_interval())?;

    let shared = Arc::new(Shared::new(transport, negotiated, config));
    let worker = thread::Builder::new().name("smov-link".into()).spawn({
        let shared = shared.clone();
        move || run_link(shared, reader, decoder)
    })?;

    tracing::info!(
        "connected, protocol version {}, speed range {}..={}",
        shared.version,
        shared.limits.min,
        shared.limits.max
    );

    let link = Arc::new(Link {
        shared,
        worker: Mutex::new(Some(worker)),
        released: AtomicBool::new(false),
    });
    Ok((Sender::new(link.clone()), FaultHandle::new(link)))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Command waiting for its acknowledgment
#[derive(Debug, Clone, Copy)]
struct Pending {
    command: Command,
    sent_at: Instant,
}

/// Cumulative traffic counters
#[derive(Debug, Default)]
pub(crate) struct Counters {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
    rejected: AtomicU64,
}

/// State shared by the link thread and both handles
pub(crate) struct Shared {
    pub(crate) latch: FaultLatch,
    pub(crate) version: u16,
    pub(crate) limits: SpeedLimits,
    pub(crate) counters: Counters,
    pending: Mutex<Option<Pending>>,
    writer: Mutex<Option<Box<dyn Transport>>>,
    last_tx: Mutex<Instant>,
    next_seq: AtomicU8,
    shutdown: AtomicBool,
    failed: AtomicBool,
    ack_timeout: Duration,
    heartbeat_interval: Option<Duration>,
}

impl Shared {
    fn new(writer: Box<dyn Transport>, negotiated: Negotiated, config: &ConnectionConfig) -> Self {
        let limits = match negotiated.limits {
            Some((min, max)) => SpeedLimits::new(min, max).unwrap_or_else(|| {
                tracing::warn!("device reported inverted speed range {}..={}", min, max);
                config.speed_limits
            }),
            None => config.speed_limits,
        };

        Self {
            latch: FaultLatch::new(),
            version: negotiated.version,
            limits,
            counters: Counters::default(),
            pending: Mutex::new(None),
            writer: Mutex::new(Some(writer)),
            last_tx: Mutex::new(Instant::now()),
            next_seq: AtomicU8::new(0),
            shutdown: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            ack_timeout: config.ack_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire) && !self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Latch a link failure and stop accepting commands
    fn fail(&self, kind: ErrorKind) {
        tracing::error!("link failed: {}", kind);
        self.latch.record(kind);
        self.failed.store(true, Ordering::Release);
    }

    /// Claim the in-flight slot and write a sequenced command.
    ///
    /// Returns `false` without waiting when the slot is taken or the write fails.
    pub(crate) fn try_send(&self, make: impl FnOnce(u8) -> Command) -> bool {
        let command = {
            let mut pending = lock(&self.pending);
            if let Some(busy) = pending.as_ref() {
                tracing::trace!("busy: {:?} not acknowledged yet", busy.command);
                return false;
            }
            let command = make(self.next_seq.fetch_add(1, Ordering::Relaxed));
            *pending = Some(Pending {
                command,
                sent_at: Instant::now(),
            });
            command
        };

        match self.write(&command) {
            Ok(()) => true,
            Err(e) => {
                lock(&self.pending).take();
                if !matches!(e, ProtocolError::TornDown) {
                    self.fail(e.kind());
                }
                false
            }
        }
    }

    fn write(&self, command: &Command) -> Result<(), ProtocolError> {
        let bytes = command.to_bytes();
        {
            let mut writer = lock(&self.writer);
            let transport = writer.as_mut().ok_or(ProtocolError::TornDown)?;
            transport.write_all(&bytes)?;
        }
        *lock(&self.last_tx) = Instant::now();
        self.counters
            .tx_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("sent {:?}", command);
        Ok(())
    }

    /// Route one packet received from the device
    fn dispatch(&self, packet: &Packet) {
        self.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
        match Response::from_packet(packet) {
            Ok(Response::Ack { seq, status }) => self.acknowledge(seq, status),
            Ok(Response::Fault { code }) => {
                tracing::warn!("device reported fault {:#06x}", code);
                self.latch.record(ErrorKind::DeviceFault(code));
            }
            Ok(Response::HelloReply { .. }) => {
                tracing::debug!("ignoring repeated handshake reply");
            }
            Err(e) => tracing::warn!("dropping frame: {}", e),
        }
    }

    fn acknowledge(&self, seq: u8, status: u8) {
        let acked = {
            let mut pending = lock(&self.pending);
            if matches!(pending.as_ref(), Some(p) if p.command.seq() == Some(seq)) {
                pending.take()
            } else {
                None
            }
        };
        let Some(acked) = acked else {
            tracing::warn!("unexpected acknowledgment for seq {}", seq);
            return;
        };

        tracing::debug!(
            "{:?} acknowledged with status {} after {}ms",
            acked.command,
            status,
            acked.sent_at.elapsed().as_millis()
        );

        if status == 0 {
            return;
        }
        match acked.command {
            Command::Ping { .. } => {
                self.latch.record(ErrorKind::DeviceFault(u16::from(status)));
            }
            command => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("device rejected {:?} with status {}", command, status);
            }
        }
    }

    /// Enforce the acknowledgment timeout and keep an idle link alive
    fn service_timers(&self) -> Result<(), ErrorKind> {
        let in_flight = lock(&self.pending).as_ref().copied();
        match in_flight {
            Some(p) if p.sent_at.elapsed() >= self.ack_timeout => {
                tracing::warn!(
                    "no acknowledgment for {:?} after {}ms",
                    p.command,
                    p.sent_at.elapsed().as_millis()
                );
                Err(ErrorKind::CommunicationFailure(libc::ETIMEDOUT))
            }
            Some(_) => Ok(()),
            None => {
                if let Some(interval) = self.heartbeat_interval {
                    if lock(&self.last_tx).elapsed() >= interval {
                        self.try_send(|seq| Command::Ping { seq });
                    }
                }
                Ok(())
            }
        }
    }

    /// (tx bytes, rx bytes, tx packets, rx packets)
    pub(crate) fn counters(&self) -> (u64, u64, u64, u64) {
        (
            self.counters.tx_bytes.load(Ordering::Relaxed),
            self.counters.rx_bytes.load(Ordering::Relaxed),
            self.counters.tx_packets.load(Ordering::Relaxed),
            self.counters.rx_packets.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn rejected(&self) -> u64 {
        self.counters.rejected.load(Ordering::Relaxed)
    }
}

/// Body of the link thread
fn run_link(shared: Arc<Shared>, mut reader: Box<dyn Transport>, mut decoder: PacketDecoder) {
    let mut buffer = [0u8; 256];

    loop {
        loop {
            match decoder.next_packet() {
                Ok(Some(packet)) => shared.dispatch(&packet),
                Ok(None) => break,
                Err(e) => tracing::warn!("resynchronising after bad frame: {}", e),
            }
        }

        if !shared.is_alive() {
            break;
        }
        if let Err(kind) = shared.service_timers() {
            shared.fail(kind);
            break;
        }

        match reader.read(&mut buffer) {
            Ok(0) => {
                if shared.is_alive() {
                    shared.fail(ErrorKind::CommunicationFailure(libc::ENODEV));
                }
                break;
            }
            Ok(n) => {
                shared
                    .counters
                    .rx_bytes
                    .fetch_add(n as u64, Ordering::Relaxed);
                tracing::trace!("read {} bytes: {:02x?}", n, &buffer[..n]);
                decoder.push(&buffer[..n]);
            }
            Err(e) if is_idle(&e) => {}
            Err(e) => {
                if shared.is_alive() {
                    shared.fail(ErrorKind::from_io(&e));
                }
                break;
            }
        }
    }

    tracing::debug!("link thread exiting");
}

/// One live connection, shared by its [`Sender`] and [`FaultHandle`]
pub(crate) struct Link {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl Link {
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        if self.is_released() {
            ConnectionState::Disconnected
        } else if self.shared.has_failed() {
            ConnectionState::Error
        } else {
            ConnectionState::Connected
        }
    }

    /// Stop the link thread and close the port. Only the first call does anything.
    pub(crate) fn teardown(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.shared.shutdown.store(true, Ordering::Release);

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("link thread panicked");
            }
        }

        lock(&self.shared.writer).take();
        lock(&self.shared.pending).take();
        tracing::info!("connection closed");
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.teardown();
    }
}
