//! Serial link lifecycle
//!
//! The transport task owns the port: it opens it (retrying on failure),
//! probes the radio, pumps inbound bytes into the frame decoder and reopens
//! the port whenever the port name or baud rate changes.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_serial::{FlowControl, SerialPort, SerialPortBuilderExt};
use tracing::{error, info, warn};
use xbee_core::FrameDecoder;

use crate::config::SerialSettings;
use crate::driver::{Driver, Shared};
use crate::error::DriverError;

/// Link states, published on a watch channel by the transport task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Probing,
    Open,
}

/// Byte stream to the radio
pub trait RadioStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RadioStream for T {}

pub type BoxedStream = Box<dyn RadioStream>;

/// Opens the byte stream to the radio
pub trait PortOpener: Send + Sync + 'static {
    fn open(&self, settings: &SerialSettings) -> io::Result<BoxedStream>;
}

/// Production opener backed by `tokio-serial`
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

impl PortOpener for SerialPortOpener {
    fn open(&self, settings: &SerialSettings) -> io::Result<BoxedStream> {
        let flow_control = if settings.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };
        let port = tokio_serial::new(&settings.port, settings.baud)
            .flow_control(flow_control)
            .open_native_async()?;
        // Discard whatever the radio buffered while nobody was listening
        port.clear(tokio_serial::ClearBuffer::Input)?;
        Ok(Box::new(port))
    }
}

/// Why a session ended
#[derive(Debug)]
enum Closed {
    OpenFailed(String),
    ProbeFailed(DriverError),
    LinkLost(String),
    SettingsChanged,
    Shutdown,
}

/// Body of the transport task
pub(crate) async fn run(
    driver: Driver,
    opener: Arc<dyn PortOpener>,
    mut settings_rx: watch::Receiver<SerialSettings>,
) {
    let shared = driver.shared().clone();
    let retry_delay = shared.config.timing.retry_delay();
    // Only the first failure after a transition is logged as an error
    let mut report_failure = true;

    loop {
        let settings = settings_rx.borrow_and_update().clone();
        shared.set_link(LinkState::Opening);

        let closed = if !settings.is_valid() {
            Closed::OpenFailed("invalid serial port settings".to_string())
        } else {
            match opener.open(&settings) {
                Ok(stream) => session(&driver, stream, &settings, &mut settings_rx).await,
                Err(e) => Closed::OpenFailed(e.to_string()),
            }
        };

        shared.close_link().await;

        match closed {
            Closed::OpenFailed(reason) => {
                if report_failure {
                    error!(port = %settings.port, baud = settings.baud, reason = %reason, "Unable to open serial port");
                    report_failure = false;
                }
            }
            Closed::ProbeFailed(e) => {
                if report_failure {
                    error!(port = %settings.port, baud = settings.baud, error = %e, "No radio answered on serial port");
                    report_failure = false;
                }
            }
            Closed::LinkLost(reason) => {
                warn!(port = %settings.port, reason = %reason, "Serial link lost");
                report_failure = true;
            }
            Closed::SettingsChanged => {
                info!("Serial settings changed, reopening port");
                report_failure = true;
                continue;
            }
            Closed::Shutdown => return,
        }

        tokio::select! {
            _ = sleep(retry_delay) => {}
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                report_failure = true;
            }
        }
    }
}

async fn session(
    driver: &Driver,
    stream: BoxedStream,
    settings: &SerialSettings,
    settings_rx: &mut watch::Receiver<SerialSettings>,
) -> Closed {
    let shared = driver.shared();
    let (reader, writer) = tokio::io::split(stream);
    shared.attach_writer(writer).await;
    shared.set_link(LinkState::Probing);

    tokio::select! {
        closed = pump(shared, reader) => closed,
        closed = bring_up(driver, settings, settings_rx) => closed,
    }
}

/// Read from the port until it fails, routing every complete frame
async fn pump(shared: &Arc<Shared>, mut reader: ReadHalf<BoxedStream>) -> Closed {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return Closed::LinkLost("end of stream".to_string()),
            Ok(n) => {
                decoder.extend(&buf[..n]);
                while let Some(raw) = decoder.next_frame() {
                    shared.dispatch(raw);
                }
            }
            Err(e) => return Closed::LinkLost(e.to_string()),
        }
    }
}

/// Probe and initialize the radio, then hold the link open until the
/// settings change
async fn bring_up(
    driver: &Driver,
    settings: &SerialSettings,
    settings_rx: &mut watch::Receiver<SerialSettings>,
) -> Closed {
    let version = match driver.probe_version().await {
        Ok(version) => version,
        Err(e) => return Closed::ProbeFailed(e),
    };

    if settings.initialize_radio {
        driver.initialize_radio(version).await;
    }

    driver.shared().set_link(LinkState::Open);
    info!(
        port = %settings.port,
        baud = settings.baud,
        hardware = format_args!("{:#06x}", version.hardware),
        firmware = format_args!("{:#06x}", version.firmware),
        generation = ?version.generation(),
        "Serial port for XBee opened"
    );

    let discovery = driver.clone();
    driver.shared().spawn_background(async move {
        if let Err(e) = discovery.get_node_list(true, false).await {
            warn!(error = %e, "Initial node discovery failed");
        }
    });

    loop {
        if settings_rx.changed().await.is_err() {
            return Closed::Shutdown;
        }
        let next = settings_rx.borrow_and_update().clone();
        if settings.requires_reopen(&next) {
            return Closed::SettingsChanged;
        }
    }
}
