/// Serial link to the MCU.
///
/// Architecture:
///
/// ```text
///   TransportLink::open()
///         │
///         ├── reader thread   ← blocking 1-byte reads, reassembles lines
///         │                        ├── complete line → LinkEvent::Line
///         │                        └── I/O fault     → LinkEvent::Fault (thread exits)
///         └── McuLink         ← shared writer half, frames `rpi:<id>:<cmd>`
/// ```
///
/// `TransportLink::run()` is the only ingestion path.  It decodes each line,
/// hands it to the `MessageHandler` and, on a fault, closes and reopens the
/// port until it succeeds or the daemon stops.
use async_trait::async_trait;
use mynd_proto::codec::{self, McuMessage, RequestIds};
use mynd_proto::config::UartConfig;
use mynd_proto::protocol::RpiStatus;
use serialport::{ClearBuffer, DataBits, Parity, StopBits};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines longer than this without a terminator are discarded.
pub const MAX_LINE_BYTES: usize = 256;

/// Pause between opening the device and flushing stale buffered data.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Wait before closing a faulted port, and again before each reopen attempt.
pub const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

/// Reader-thread sleep when the port reports no data without timing out.
const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("serial link is not open")]
    NotOpen,
    #[error("failed to open {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LinkError {
    /// A write that timed out may succeed on the next command; a closed or
    /// unopenable port will not.
    pub fn is_transient(&self) -> bool {
        match self {
            LinkError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            LinkError::NotOpen | LinkError::Open { .. } => false,
        }
    }
}

// ── line reassembly ───────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    Pending,
    Line(String),
    Overflow,
}

#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn push(&mut self, byte: u8) -> Feed {
        if byte == b'\n' {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            return if line.is_empty() {
                Feed::Pending
            } else {
                Feed::Line(line)
            };
        }

        self.buf.push(byte);
        if self.buf.len() > MAX_LINE_BYTES {
            self.buf.clear();
            return Feed::Overflow;
        }
        Feed::Pending
    }
}

// ── port opening ──────────────────────────────────────────────────────────────

pub struct PortHalves {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Opens the device behind the link.  Called again after every fault.
pub trait PortOpener: Send + Sync {
    fn describe(&self) -> String;
    fn open(&self) -> Result<PortHalves, LinkError>;
}

pub struct SerialOpener {
    device: String,
    baudrate: u32,
    timeout: Duration,
}

impl SerialOpener {
    pub fn new(config: &UartConfig) -> Self {
        Self {
            device: config.device.clone(),
            baudrate: config.baudrate,
            timeout: config.timeout(),
        }
    }

    fn open_error(&self, source: serialport::Error) -> LinkError {
        LinkError::Open {
            device: self.device.clone(),
            source,
        }
    }
}

impl PortOpener for SerialOpener {
    fn describe(&self) -> String {
        format!("{} @ {} baud", self.device, self.baudrate)
    }

    fn open(&self) -> Result<PortHalves, LinkError> {
        let port = serialport::new(&self.device, self.baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(self.timeout)
            .open()
            .map_err(|e| self.open_error(e))?;

        std::thread::sleep(SETTLE_DELAY);
        port.clear(ClearBuffer::All).map_err(|e| self.open_error(e))?;

        let reader = port.try_clone().map_err(|e| self.open_error(e))?;
        Ok(PortHalves {
            reader: Box::new(reader),
            writer: Box::new(port),
        })
    }
}

// ── writer half ───────────────────────────────────────────────────────────────

type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// Cloneable-by-Arc sender for MCU commands.  Owns the request-id counter.
#[derive(Default)]
pub struct McuLink {
    writer: SharedWriter,
    ids: Arc<RequestIds>,
}

impl McuLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, writer: Box<dyn Write + Send>) {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);
    }

    /// Drop the writer half.  Returns whether one was attached.
    pub fn detach(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_open(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Frame and write one command, tagged with the next request id.  The
    /// write and flush block until the UART drains, so they run on the
    /// blocking pool.
    pub async fn send(&self, command: &str) -> Result<(), LinkError> {
        let writer = Arc::clone(&self.writer);
        let ids = Arc::clone(&self.ids);
        let command = command.to_string();
        tokio::task::spawn_blocking(move || write_command(&writer, &ids, &command))
            .await
            .map_err(|e| LinkError::Io(io::Error::other(e)))?
    }

    pub async fn send_status(&self, status: RpiStatus) -> Result<(), LinkError> {
        info!(
            "Sending RPI status update to MCU: {} ({})",
            status.name(),
            status.code()
        );
        self.send(&status.command()).await.inspect_err(|e| {
            error!(
                "Failed to send RPI status update: {} ({}): {}",
                status.name(),
                status.code(),
                e
            )
        })
    }
}

fn write_command(writer: &SharedWriter, ids: &RequestIds, command: &str) -> Result<(), LinkError> {
    let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
    let writer = guard.as_mut().ok_or(LinkError::NotOpen)?;

    // id taken under the lock so ids go out in write order
    let line = codec::encode(ids.next_id(), command);
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    debug!("Sent to MCU: {}", line.trim_end());
    Ok(())
}

// ── ingestion ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum LinkEvent {
    Line(String),
    Fault(io::Error),
}

/// Receives every decoded MCU message, serialized on the ingestion task.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: McuMessage);

    /// Called once per transport fault, before the port is closed.
    async fn link_fault(&self);
}

pub struct TransportLink {
    opener: Arc<dyn PortOpener>,
    mcu: Arc<McuLink>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: mpsc::Receiver<LinkEvent>,
    reader_alive: Option<Arc<AtomicBool>>,
    backoff: Duration,
}

impl TransportLink {
    pub fn new(opener: Arc<dyn PortOpener>, mcu: Arc<McuLink>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            opener,
            mcu,
            events_tx,
            events_rx,
            reader_alive: None,
            backoff: REOPEN_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn open(&mut self) -> Result<(), LinkError> {
        let opener = self.opener.clone();
        let halves = tokio::task::spawn_blocking(move || opener.open())
            .await
            .map_err(|e| LinkError::Io(io::Error::other(e)))??;

        let alive = Arc::new(AtomicBool::new(true));
        spawn_reader(halves.reader, self.events_tx.clone(), alive.clone())?;
        self.reader_alive = Some(alive);
        self.mcu.attach(halves.writer);

        info!("Opened UART: {}", self.opener.describe());
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(alive) = self.reader_alive.take() {
            alive.store(false, Ordering::Relaxed);
        }
        if self.mcu.detach() {
            info!("Closed UART connection");
        }
    }

    /// Ingest until `shutdown` is cancelled.
    pub async fn run<H: MessageHandler + ?Sized>(
        &mut self,
        handler: &H,
        shutdown: &CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events_rx.recv() => event,
            };

            match event {
                Some(LinkEvent::Line(line)) => match codec::decode(&line) {
                    Some(message) => handler.handle_message(message).await,
                    None => debug!("Dropping unparseable line: {:?}", line),
                },
                Some(LinkEvent::Fault(err)) => {
                    if !self.recover(err, handler, shutdown).await {
                        break;
                    }
                }
                None => break,
            }
        }
        debug!("Ingestion loop exiting");
    }

    /// Returns false if shutdown was requested before the port came back.
    async fn recover<H: MessageHandler + ?Sized>(
        &mut self,
        err: io::Error,
        handler: &H,
        shutdown: &CancellationToken,
    ) -> bool {
        error!("Serial error: {}", err);
        if self.mcu.is_open() {
            let _ = self.mcu.send_status(RpiStatus::Error).await;
        }
        handler.link_fault().await;

        if !pause(self.backoff, shutdown).await {
            self.close();
            return false;
        }
        self.close();

        loop {
            if !pause(self.backoff, shutdown).await {
                return false;
            }
            match self.open().await {
                Ok(()) => {
                    let _ = self.mcu.send_status(RpiStatus::Ready).await;
                    return true;
                }
                Err(e) => error!("Failed to reopen UART: {}", e),
            }
        }
    }
}

/// Sleep unless cancelled first.  Returns false on cancellation.
async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    events: mpsc::Sender<LinkEvent>,
    alive: Arc<AtomicBool>,
) -> Result<(), LinkError> {
    std::thread::Builder::new()
        .name("mcu-rx".into())
        .spawn(move || {
            let mut assembler = LineAssembler::default();
            let mut byte = [0u8; 1];

            while alive.load(Ordering::Relaxed) {
                match reader.read(&mut byte) {
                    Ok(0) => std::thread::sleep(IDLE_POLL),
                    Ok(_) => match assembler.push(byte[0]) {
                        Feed::Line(line) => {
                            if events.blocking_send(LinkEvent::Line(line)).is_err() {
                                break;
                            }
                        }
                        Feed::Overflow => warn!("RX buffer overflow, clearing"),
                        Feed::Pending => {}
                    },
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::Interrupted
                                | io::ErrorKind::WouldBlock
                        ) => {}
                    Err(e) => {
                        if alive.load(Ordering::Relaxed) {
                            let _ = events.blocking_send(LinkEvent::Fault(e));
                        }
                        break;
                    }
                }
            }
            debug!("mcu reader: thread exiting");
        })?;
    Ok(())
}
