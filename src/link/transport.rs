// Serial transport: owns the physical link to the motor controller
//
// State machine:
//   Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//                                                          \-> Disconnected(fatal)
//
// The link is split into a reader half (owned in practice by the receive
// thread) and a writer half (used by the command side), each behind its own
// lock so the two directions never wait on each other.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::SerialConfig;

/// Size of a single read from the link
const READ_CHUNK: usize = 256;

/// Granularity of backoff sleeps, so `close()` is observed promptly
const SLEEP_SLICE: Duration = Duration::from_millis(10);

pub type LinkReader = Box<dyn Read + Send>;
pub type LinkWriter = Box<dyn Write + Send>;

/// Opens the physical link and splits it into independent halves
pub trait Connector: Send + Sync {
    fn connect(&self) -> io::Result<(LinkReader, LinkWriter)>;

    /// Human readable name for logs
    fn describe(&self) -> String;
}

/// Connection state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkStatus {
    Disconnected { fatal: bool },
    Connecting,
    Connected,
    Reconnecting,
}

impl LinkStatus {
    pub fn is_connected(self) -> bool {
        self == LinkStatus::Connected
    }

    pub fn is_fatal(self) -> bool {
        self == LinkStatus::Disconnected { fatal: true }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Link lost: {0}")]
    LinkLost(#[source] io::Error),

    #[error("Link not connected ({0:?})")]
    NotConnected(LinkStatus),

    #[error("Failed to connect to {link} after {attempts} attempts: {last}")]
    ConnectFailed {
        link: String,
        attempts: u32,
        #[source]
        last: io::Error,
    },

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the pipeline may carry on (the link may come back)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::LinkLost(_) | TransportError::NotConnected(_))
    }
}

/// Counters exposed for health reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Physical UART opened through `serialport`
pub struct SerialConnector {
    path: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(config: &SerialConfig) -> Self {
        Self {
            path: config.path.clone(),
            baud_rate: config.baud_rate,
            timeout: config.read_timeout(),
        }
    }
}

/// One half of a cloned serial port handle
struct PortHalf(Box<dyn SerialPort>);

impl Read for PortHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PortHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Connector for SerialConnector {
    fn connect(&self) -> io::Result<(LinkReader, LinkWriter)> {
        // 8N1, no flow control
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.timeout)
            .open()?;
        let writer = port.try_clone()?;
        Ok((Box::new(PortHalf(port)), Box::new(PortHalf(writer))))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }
}

/// Reconnecting byte transport over a `Connector`
pub struct SerialTransport<C> {
    connector: C,
    config: SerialConfig,
    status: watch::Sender<LinkStatus>,
    reader: Mutex<Option<LinkReader>>,
    writer: Mutex<Option<LinkWriter>>,
    closed: AtomicBool,
    connect_attempts: AtomicU64,
    reconnects: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl<C: Connector> SerialTransport<C> {
    /// Create a transport in the `Disconnected` state
    pub fn new(connector: C, config: SerialConfig) -> Self {
        let (status, _) = watch::channel(LinkStatus::Disconnected { fatal: false });
        Self {
            connector,
            config,
            status,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Create and connect, retrying with backoff
    pub fn open(connector: C, config: SerialConfig) -> Result<Self, TransportError> {
        let transport = Self::new(connector, config);
        transport.connect()?;
        Ok(transport)
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Watch link status transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    /// Initial connection: `Disconnected -> Connecting -> Connected`
    pub fn connect(&self) -> Result<(), TransportError> {
        self.establish(LinkStatus::Connecting)
    }

    /// Re-establish a lost link: `Reconnecting -> Connected`
    pub fn reconnect(&self) -> Result<(), TransportError> {
        self.establish(LinkStatus::Reconnecting)?;
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn establish(&self, pending: LinkStatus) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.set_status(pending);

        let link = self.connector.describe();
        let reconnect = &self.config.reconnect;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.connect_attempts.fetch_add(1, Ordering::Relaxed);
            debug!("Connecting to {} (attempt {}/{})", link, attempt, reconnect.max_attempts);

            let err = match self.connector.connect() {
                Ok((reader, writer)) => {
                    if self.is_closed() {
                        return Err(TransportError::Closed);
                    }
                    *self.reader.lock() = Some(reader);
                    *self.writer.lock() = Some(writer);
                    self.set_status(LinkStatus::Connected);
                    info!("Link {} connected after {} attempt(s)", link, attempt);
                    return Ok(());
                }
                Err(e) => e,
            };

            if attempt >= reconnect.max_attempts {
                error!("Giving up on {} after {} attempts: {}", link, attempt, err);
                self.set_status(LinkStatus::Disconnected { fatal: true });
                return Err(TransportError::ConnectFailed {
                    link,
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = reconnect.backoff(attempt);
            warn!("Connecting to {} failed: {}; retrying in {:?}", link, err, delay);
            if !self.sleep(delay) {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Write a complete frame; fails fast when the link is not up
    pub fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::NotConnected(self.status()));
        };

        match writer.write_all(bytes).and_then(|_| writer.flush()) {
            Ok(()) => {
                self.bytes_out.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                guard.take();
                drop(guard);
                self.mark_lost(&e);
                Err(TransportError::LinkLost(e))
            }
        }
    }

    /// Read one chunk, waiting at most the configured read timeout.
    ///
    /// A timeout yields an empty chunk. An I/O error moves the link to
    /// `Reconnecting` and returns `LinkLost`; call `reconnect()` afterwards.
    pub fn receive(&self) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            self.reader.lock().take();
            return Err(TransportError::Closed);
        }

        let mut guard = self.reader.lock();
        // the writer side may have noticed the failure first
        if self.status() == LinkStatus::Reconnecting {
            guard.take();
            return Err(TransportError::LinkLost(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "link marked for reconnection",
            )));
        }
        let Some(reader) = guard.as_mut() else {
            return Err(TransportError::NotConnected(self.status()));
        };

        let mut buf = [0u8; READ_CHUNK];
        match reader.read(&mut buf) {
            Ok(0) => {
                guard.take();
                drop(guard);
                let e = io::Error::new(io::ErrorKind::UnexpectedEof, "link closed by peer");
                self.mark_lost(&e);
                Err(TransportError::LinkLost(e))
            }
            Ok(n) => {
                self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Bytes::new())
            }
            Err(e) => {
                guard.take();
                drop(guard);
                self.mark_lost(&e);
                Err(TransportError::LinkLost(e))
            }
        }
    }

    /// Lazily received chunks. Link loss is yielded once as `LinkLost` and
    /// followed by an automatic reconnect; the sequence ends after `close()`
    /// or after a fatal reconnect failure (which is yielded first).
    pub fn chunks(&self) -> Chunks<'_, C> {
        Chunks {
            transport: self,
            reconnect_pending: false,
            done: false,
        }
    }

    /// Release the link. Safe to call from any state, any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.writer.lock().take();
        // the receive thread may be inside a read; it drops the reader itself
        if let Some(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        let fatal = self.status().is_fatal();
        self.set_status(LinkStatus::Disconnected { fatal });
        info!("Link {} closed", self.connector.describe());
    }

    fn mark_lost(&self, err: &io::Error) {
        let changed = self.status.send_if_modified(|status| {
            if *status == LinkStatus::Connected {
                *status = LinkStatus::Reconnecting;
                true
            } else {
                false
            }
        });
        if changed {
            warn!("Link {} lost: {}", self.connector.describe(), err);
            self.writer.lock().take();
        }
    }

    fn set_status(&self, next: LinkStatus) {
        let prev = self.status.send_replace(next);
        if prev != next {
            debug!("Link status {:?} -> {:?}", prev, next);
        }
    }

    /// Sleep in slices; false when the transport was closed meanwhile
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_closed() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Iterator returned by [`SerialTransport::chunks`]
pub struct Chunks<'a, C> {
    transport: &'a SerialTransport<C>,
    reconnect_pending: bool,
    done: bool,
}

impl<C: Connector> Iterator for Chunks<'_, C> {
    type Item = Result<Bytes, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.reconnect_pending {
            self.reconnect_pending = false;
            match self.transport.reconnect() {
                Ok(()) => {}
                Err(TransportError::Closed) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        match self.transport.receive() {
            Ok(chunk) => Some(Ok(chunk)),
            Err(TransportError::Closed) => {
                self.done = true;
                None
            }
            Err(e @ TransportError::LinkLost(_)) => {
                self.reconnect_pending = true;
                Some(Err(e))
            }
            Err(e @ TransportError::NotConnected(_)) => {
                // never connected, or another caller is mid-reconnect
                if self.transport.status().is_fatal() {
                    self.done = true;
                } else {
                    self.reconnect_pending = true;
                }
                Some(Err(e))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
