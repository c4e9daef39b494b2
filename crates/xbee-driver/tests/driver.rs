//! Full driver against a simulated radio on an in-memory pipe

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use xbee_core::message::{
    api_id, delivery, LocalAtResponse, ZigbeeReceive, ZigbeeTransmit, ZigbeeTxStatus,
};
use xbee_core::zdo::{cluster, STATUS_SUCCESS};
use xbee_core::{
    Address, ApiMessage, DeviceAnnounce, ExtendedAddress, FrameDecoder, MgmtLqiResponse,
    NeighborTableRecord, NodeKind, ShortAddress, SocketAddress, ZdoFrame,
};
use xbee_driver::{
    AddressFamily, BoxedStream, Driver, DriverConfig, PortOpener, Protocol, SerialSettings,
    XBeeSocket, MSG_DONTWAIT,
};

const LOCAL: ExtendedAddress = ExtendedAddress(0x0013_A200_4000_0001);
const REMOTE: ExtendedAddress = ExtendedAddress(0x0013_A200_4000_00AA);
const WAIT: Duration = Duration::from_secs(5);

/// Hands the radio side of every opened pipe to the test
struct DuplexOpener {
    radios: mpsc::UnboundedSender<(String, DuplexStream)>,
}

impl PortOpener for DuplexOpener {
    fn open(&self, settings: &SerialSettings) -> io::Result<BoxedStream> {
        let (driver_side, radio_side) = tokio::io::duplex(8192);
        self.radios
            .send((settings.port.clone(), radio_side))
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "no radio attached"))?;
        Ok(Box::new(driver_side))
    }
}

/// Answers local AT commands from a register map and records everything else
struct SimRadio {
    writer: Arc<Mutex<WriteHalf<DuplexStream>>>,
    frames: mpsc::UnboundedReceiver<ApiMessage>,
    registers: Arc<StdMutex<HashMap<String, Vec<u8>>>>,
}

fn default_registers() -> HashMap<String, Vec<u8>> {
    HashMap::from([
        ("HV".to_string(), vec![0x1E, 0x44]),
        ("VR".to_string(), vec![0x21, 0xA7]),
        ("MY".to_string(), vec![0x00, 0x00]),
        ("SH".to_string(), vec![0x00, 0x13, 0xA2, 0x00]),
        ("SL".to_string(), vec![0x40, 0x00, 0x00, 0x01]),
        ("NI".to_string(), b"gateway".to_vec()),
        ("NT".to_string(), vec![0x3C]),
    ])
}

impl SimRadio {
    fn spawn(stream: DuplexStream) -> Self {
        Self::spawn_with(stream, default_registers(), Vec::new())
    }

    /// Radio answering `ND` with one reply per entry of `discovered`
    fn spawn_with(
        stream: DuplexStream,
        registers: HashMap<String, Vec<u8>>,
        discovered: Vec<Vec<u8>>,
    ) -> Self {
        let (mut reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(writer));
        let registers = Arc::new(StdMutex::new(registers));
        let (frames_tx, frames) = mpsc::unbounded_channel();

        let reply_writer = writer.clone();
        let reply_registers = registers.clone();
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 512];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Some(raw) = decoder.next_frame() {
                    let message = ApiMessage::decode(&raw.frame).unwrap();
                    if let ApiMessage::LocalAtCommand(cmd) = &message {
                        let name = cmd.command.as_str().to_string();
                        let answers: Vec<(u8, Vec<u8>)> = if name == "ND" {
                            discovered.iter().map(|value| (0, value.clone())).collect()
                        } else {
                            let mut registers = reply_registers.lock().unwrap();
                            if cmd.parameter.is_empty() {
                                match registers.get(&name) {
                                    Some(value) => vec![(0, value.clone())],
                                    None => vec![(1, vec![])],
                                }
                            } else {
                                registers.insert(name, cmd.parameter.clone());
                                vec![(0, vec![])]
                            }
                        };
                        for (status, value) in answers {
                            let reply = ApiMessage::LocalAtResponse(LocalAtResponse {
                                frame_id: cmd.frame_id,
                                command: cmd.command,
                                status,
                                value,
                            });
                            let wire = reply.encode().unwrap();
                            if reply_writer.lock().await.write_all(&wire).await.is_err() {
                                return;
                            }
                        }
                    }
                    let _ = frames_tx.send(message);
                }
            }
        });

        Self {
            writer,
            frames,
            registers,
        }
    }

    async fn send(&self, message: ApiMessage) {
        let wire = message.encode().unwrap();
        self.writer.lock().await.write_all(&wire).await.unwrap();
    }

    /// Next recorded frame accepted by `pick`
    async fn expect<T>(&mut self, mut pick: impl FnMut(&ApiMessage) -> Option<T>) -> T {
        timeout(WAIT, async {
            loop {
                let message = self.frames.recv().await.expect("radio stream closed");
                if let Some(found) = pick(&message) {
                    return found;
                }
            }
        })
        .await
        .expect("expected frame never arrived")
    }

    fn register(&self, name: &str) -> Option<Vec<u8>> {
        self.registers.lock().unwrap().get(name).cloned()
    }
}

/// One 802.15.4 `ND` reply: MY, SH/SL, signal strength, NUL-terminated NI
fn nd_reply(short: u16, extended: ExtendedAddress, label: &str) -> Vec<u8> {
    let mut value = short.to_be_bytes().to_vec();
    value.extend_from_slice(&extended.0.to_be_bytes());
    value.push(0x28);
    value.extend_from_slice(label.as_bytes());
    value.push(0);
    value
}

fn test_config(port: &str) -> DriverConfig {
    let mut config = DriverConfig::default();
    config.serial = SerialSettings::new(port, 115200);
    config.timing.retry_delay_ms = 20;
    config.timing.lqi_timeout_secs = 1;
    config
}

async fn start() -> (Driver, SimRadio, mpsc::UnboundedReceiver<(String, DuplexStream)>) {
    let (radios_tx, mut radios) = mpsc::unbounded_channel();
    let driver = Driver::with_opener(test_config("/dev/ttySIM0"), DuplexOpener { radios: radios_tx });
    let (_, stream) = timeout(WAIT, radios.recv()).await.unwrap().unwrap();
    let radio = SimRadio::spawn(stream);
    driver.wait_until_open(WAIT).await.unwrap();
    (driver, radio, radios)
}

fn bound(driver: &Driver, endpoint: u8) -> XBeeSocket {
    let mut socket = XBeeSocket::new(driver, AddressFamily::XBee, Protocol::Aps).unwrap();
    socket
        .bind(&SocketAddress::new(Address::Local, endpoint, 0, 0))
        .unwrap();
    socket
}

fn zigbee_rx(destination_endpoint: u8, cluster_id: u16, profile_id: u16, data: Vec<u8>) -> ApiMessage {
    ApiMessage::ZigbeeReceive(ZigbeeReceive {
        source: REMOTE,
        source_short: ShortAddress(0x2222),
        source_endpoint: destination_endpoint,
        destination_endpoint,
        cluster_id,
        profile_id,
        options: 0x01,
        data,
    })
}

#[tokio::test]
async fn test_probe_initializes_and_opens() {
    let (driver, radio, _radios) = start().await;

    let version = driver.radio_version().unwrap();
    assert_eq!(version.hardware, 0x1E44);
    assert_eq!(version.firmware, 0x21A7);
    assert_eq!(radio.register("D6"), Some(vec![1]));
    assert_eq!(radio.register("D7"), Some(vec![1]));
    assert_eq!(radio.register("AO"), Some(vec![3]));

    let nodes = driver.get_node_list(false, false).await.unwrap();
    assert_eq!(nodes[0].addr_extended, LOCAL);
    assert_eq!(nodes[0].kind, NodeKind::Coordinator);
    assert_eq!(nodes[0].label, "gateway");

    driver.shutdown().await;
}

#[tokio::test]
async fn test_param_access() {
    let (driver, radio, _radios) = start().await;

    let ni = driver.get_param(None, "NI", WAIT).await.unwrap();
    assert_eq!(ni, b"gateway");

    driver.set_param(None, "ID", 0x1234u64, WAIT).await.unwrap();
    assert_eq!(radio.register("ID"), Some(vec![0x12, 0x34]));
    assert_eq!(driver.get_param(None, "ID", WAIT).await.unwrap(), vec![0x12, 0x34]);

    match driver.get_param(None, "ZZ", WAIT).await {
        Err(xbee_driver::DriverError::OperationFailed { status, .. }) => assert_eq!(status, 1),
        other => panic!("unexpected {other:?}"),
    }

    driver.shutdown().await;
}

#[tokio::test]
async fn test_sendto_and_tx_status() {
    let (driver, mut radio, _radios) = start().await;
    let socket = bound(&driver, 0xE8);

    let dest = SocketAddress::new(Address::Extended(REMOTE), 0xE8, 0xC105, 0x0011).with_tag(42);
    assert_eq!(socket.sendto(b"hello", &dest).await.unwrap(), 5);

    let tx: ZigbeeTransmit = radio
        .expect(|m| match m {
            ApiMessage::ZigbeeTransmit(tx) if tx.cluster_id == 0x0011 => Some(tx.clone()),
            _ => None,
        })
        .await;
    assert_eq!(tx.destination, REMOTE);
    assert_eq!(tx.destination_short, ShortAddress::UNKNOWN);
    assert_eq!(tx.source_endpoint, 0xE8);
    assert_eq!(tx.data, b"hello");

    radio
        .send(ApiMessage::ZigbeeTxStatus(ZigbeeTxStatus {
            frame_id: tx.frame_id,
            remote_short: ShortAddress(0x2222),
            retry_count: 0,
            delivery_status: delivery::SUCCESS,
            discovery_status: 0,
        }))
        .await;

    let (record, source) = timeout(WAIT, socket.recvfrom(64, 0)).await.unwrap().unwrap().unwrap();
    assert_eq!(record[0], api_id::ZIGBEE_TX_STATUS);
    assert_eq!(record[1], tx.frame_id);
    assert_eq!(source.address, Address::Extended(ExtendedAddress::ZERO));
    assert_eq!(source.tag, Some(42));

    driver.shutdown().await;
}

#[tokio::test]
async fn test_receive_and_broadcast() {
    let (driver, radio, _radios) = start().await;
    let first = bound(&driver, 0xE8);
    let second = bound(&driver, 0xE9);
    let zdo = bound(&driver, 0x00);

    radio.send(zigbee_rx(0xE8, 0x0011, 0xC105, b"direct".to_vec())).await;
    let (payload, source) = timeout(WAIT, first.recvfrom(64, 0)).await.unwrap().unwrap().unwrap();
    assert_eq!(payload, b"direct");
    assert_eq!(source.address, Address::Extended(REMOTE));
    assert_eq!(source.profile_id, 0xC105);
    assert_eq!(source.options, Some(0x01));

    radio.send(zigbee_rx(0xFF, 0x0011, 0xC105, b"all".to_vec())).await;
    for socket in [&first, &second] {
        let (payload, _) = timeout(WAIT, socket.recvfrom(64, 0)).await.unwrap().unwrap().unwrap();
        assert_eq!(payload, b"all");
    }
    assert_eq!(zdo.recvfrom(64, MSG_DONTWAIT).await.unwrap(), None);

    driver.shutdown().await;
}

#[tokio::test]
async fn test_announce_then_neighbor_table() {
    let (driver, mut radio, _radios) = start().await;
    // The discovery started on open has reset the directory once it reads the local table
    radio
        .expect(|m| match m {
            ApiMessage::ZigbeeTransmit(tx)
                if tx.cluster_id == cluster::MGMT_LQI_REQUEST && tx.destination == LOCAL =>
            {
                Some(())
            }
            _ => None,
        })
        .await;

    let announce = DeviceAnnounce {
        nwk_addr: ShortAddress(0x2222),
        ieee_addr: REMOTE,
        capability: 0x8E,
    };
    let frame = ZdoFrame::new(0x10, announce.encode());
    radio.send(zigbee_rx(0, cluster::DEVICE_ANNOUNCE, 0, frame.encode())).await;

    // The announced node gets its neighbor table read
    let request = radio
        .expect(|m| match m {
            ApiMessage::ZigbeeTransmit(tx)
                if tx.cluster_id == cluster::MGMT_LQI_REQUEST && tx.destination == REMOTE =>
            {
                Some(ZdoFrame::decode(&tx.data).unwrap())
            }
            _ => None,
        })
        .await;
    assert_eq!(request.payload, vec![0]);

    let neighbor = ExtendedAddress(0x0013_A200_4000_00BB);
    let response = MgmtLqiResponse {
        status: STATUS_SUCCESS,
        neighbor_table_entries: 1,
        start_index: 0,
        records: vec![NeighborTableRecord {
            extended_pan_id: 0x1234,
            extended_address: neighbor,
            short_address: ShortAddress(0x3333),
            device_type: 2,
            rx_on_when_idle: 0,
            relationship: 1,
            permit_joining: 0,
            depth: 2,
            lqi: 180,
        }],
    };
    let reply = ZdoFrame::new(request.tsn, response.encode());
    radio
        .send(zigbee_rx(0, cluster::MGMT_LQI_RESPONSE, 0, reply.encode()))
        .await;

    let nodes = timeout(WAIT, async {
        loop {
            let nodes = driver.get_node_list(false, false).await.unwrap();
            if nodes.iter().any(|n| n.addr_extended == neighbor) {
                return nodes;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let remote = nodes.iter().find(|n| n.addr_extended == REMOTE).unwrap();
    assert_eq!(remote.addr_short, ShortAddress(0x2222));
    let end = nodes.iter().find(|n| n.addr_extended == neighbor).unwrap();
    assert_eq!(end.kind, NodeKind::End);
    assert_eq!(end.addr_short, ShortAddress(0x3333));

    driver.shutdown().await;
}

#[tokio::test]
async fn test_settings_change_reopens_port() {
    let (driver, _radio, mut radios) = start().await;

    // Same port and baud: nothing to do
    let mut settings = driver.settings();
    settings.initialize_radio = false;
    driver.update_settings(settings.clone());
    assert!(timeout(Duration::from_millis(100), radios.recv()).await.is_err());

    settings.port = "/dev/ttySIM1".to_string();
    driver.update_settings(settings);
    let (port, stream) = timeout(WAIT, radios.recv()).await.unwrap().unwrap();
    assert_eq!(port, "/dev/ttySIM1");

    let radio = SimRadio::spawn(stream);
    driver.wait_until_open(WAIT).await.unwrap();
    assert_eq!(radio.register("D6"), None);
    assert_eq!(driver.get_param(None, "MY", WAIT).await.unwrap(), vec![0, 0]);

    driver.shutdown().await;
}

#[tokio::test]
async fn test_legacy_node_discovery() {
    let (radios_tx, mut radios) = mpsc::unbounded_channel();
    let driver = Driver::with_opener(test_config("/dev/ttySIM0"), DuplexOpener { radios: radios_tx });
    let (_, stream) = timeout(WAIT, radios.recv()).await.unwrap().unwrap();

    let mut registers = default_registers();
    registers.insert("HV".to_string(), vec![0x17, 0x44]);
    registers.insert("VR".to_string(), vec![0x10, 0xA5]);
    registers.insert("MY".to_string(), vec![0x00, 0x01]);
    registers.insert("NT".to_string(), vec![0x05]);
    let first = ExtendedAddress(0x0013_A200_4000_0B01);
    let second = ExtendedAddress(0x0013_A200_4000_0B02);
    let radio = SimRadio::spawn_with(
        stream,
        registers,
        vec![nd_reply(0x0002, first, "pump"), nd_reply(0x0003, second, "valve")],
    );
    driver.wait_until_open(WAIT).await.unwrap();

    // Series 1 radios have no AO register
    assert_eq!(radio.register("D6"), Some(vec![1]));
    assert_eq!(radio.register("AO"), None);

    let nodes = timeout(WAIT, driver.get_node_list(true, true)).await.unwrap().unwrap();
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0].addr_extended, LOCAL);
    assert_eq!(nodes[0].addr_short, ShortAddress(0x0001));
    assert_eq!(nodes[0].kind, NodeKind::Router);

    let pump = nodes.iter().find(|n| n.addr_extended == first).unwrap();
    assert_eq!(pump.addr_short, ShortAddress(0x0002));
    assert_eq!(pump.label, "pump");
    assert_eq!(pump.kind, NodeKind::Router);
    let valve = nodes.iter().find(|n| n.addr_extended == second).unwrap();
    assert_eq!(valve.label, "valve");

    // A non-blocking refresh returns the current list right away
    let nodes = driver.get_node_list(true, false).await.unwrap();
    assert_eq!(nodes.len(), 3);

    driver.shutdown().await;
}

/// Fails the first `failures` opens, then hands out pipes
struct FlakyOpener {
    failures: AtomicUsize,
    attempts: Arc<AtomicUsize>,
    inner: DuplexOpener,
}

impl PortOpener for FlakyOpener {
    fn open(&self, settings: &SerialSettings) -> io::Result<BoxedStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        self.inner.open(settings)
    }
}

/// Counts ERROR events
struct ErrorCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_open_retries_and_reports_once() {
    let errors = Arc::new(AtomicUsize::new(0));
    let _guard = tracing::subscriber::set_default(
        tracing_subscriber::registry().with(ErrorCounter(errors.clone())),
    );

    let (radios_tx, mut radios) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));
    let opener = FlakyOpener {
        failures: AtomicUsize::new(3),
        attempts: attempts.clone(),
        inner: DuplexOpener { radios: radios_tx },
    };
    let driver = Driver::with_opener(test_config("/dev/ttySIM0"), opener);
    assert!(driver.get_node_list(false, false).await.is_err());

    let (_, stream) = timeout(WAIT, radios.recv()).await.unwrap().unwrap();
    let _radio = SimRadio::spawn(stream);
    driver.wait_until_open(WAIT).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    driver.shutdown().await;
}
