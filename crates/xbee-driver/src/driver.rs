//! The driver handle and its public operations
//!
//! A [`Driver`] is a cheap, cloneable handle. Every public operation holds
//! the operation lock for its whole duration, so operations run one at a
//! time. Driver state sits behind a separate short-lived mutex that the
//! receive path also takes; it is never held across an await.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout_at, Instant};
use tracing::{debug, info, warn};
use xbee_core::message::{
    LocalAtCommand, LocalAtResponse, RegisterDevice, RemoteAtCommand, RemoteAtResponse,
    Transmit16, Transmit64, ZigbeeTransmit, REMOTE_AT_APPLY_CHANGES,
};
use xbee_core::node::{
    parse_node_discovery, register_u16, DIGI_MANUFACTURER_ID, DIGI_PROFILE_ID,
};
use xbee_core::{
    Address, ApiMessage, AtCommand, ExtendedAddress, FrameError, Node, NodeKind, RadioGeneration,
    RadioVersion, RawFrame, ShortAddress, SocketAddress,
};

use crate::cluster::{LqiAggregation, Step};
use crate::config::{DriverConfig, SerialSettings};
use crate::correlation::Outcome;
use crate::error::{DriverError, Result};
use crate::mailbox::{Datagram, MailboxId};
use crate::state::{trace_outbound, DriverState, FollowUp};
use crate::transport::{self, BoxedStream, LinkState, PortOpener, SerialPortOpener};

/// Timeout of the AT reads the driver issues on its own behalf
const INTERNAL_AT_TIMEOUT: Duration = Duration::from_secs(1);

/// A parameter value as accepted by `set_param` / `execute_command`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Bytes(Vec<u8>),
    /// Sent as minimal big-endian bytes, 0 as a single zero byte
    Int(u64),
}

impl ParamValue {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ParamValue::Bytes(bytes) => bytes.clone(),
            ParamValue::Int(value) => {
                let bytes = value.to_be_bytes();
                let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
                bytes[first..].to_vec()
            }
        }
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Int(value as u64)
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(value: Vec<u8>) -> Self {
        ParamValue::Bytes(value)
    }
}

impl From<&[u8]> for ParamValue {
    fn from(value: &[u8]) -> Self {
        ParamValue::Bytes(value.to_vec())
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Bytes(value.as_bytes().to_vec())
    }
}

/// Status and value of an AT-style reply
#[derive(Debug)]
struct Reply {
    status: u8,
    value: Vec<u8>,
}

impl Reply {
    /// The value, or `OperationFailed` for a non-zero status
    fn into_value(self, operation: &'static str, id: &str, address: String) -> Result<Vec<u8>> {
        if self.status != 0 {
            return Err(DriverError::OperationFailed {
                operation,
                id: id.to_string(),
                address,
                status: self.status,
            });
        }
        Ok(self.value)
    }
}

fn parse_id(id: &str) -> Result<AtCommand> {
    AtCommand::try_from(id).map_err(|_| DriverError::InvalidParameterId(id.to_string()))
}

fn describe(address: Option<ExtendedAddress>) -> String {
    address.map_or_else(|| "local".to_string(), |a| a.to_string())
}

fn malformed(register: &str, value: &[u8]) -> DriverError {
    DriverError::Frame(FrameError::Malformed {
        kind: "register value",
        reason: format!("{register} = {}", hex::encode(value)),
    })
}

/// Unsigned big-endian value of at most four bytes
fn be_u32(register: &str, value: &[u8]) -> Result<u64> {
    if value.is_empty() || value.len() > 4 {
        return Err(malformed(register, value));
    }
    Ok(value.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

/// State shared by every clone of a [`Driver`] and its background tasks
pub(crate) struct Shared {
    pub(crate) config: DriverConfig,
    state: Mutex<DriverState>,
    ops: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    inbound: Notify,
    link_tx: watch::Sender<LinkState>,
    settings_tx: watch::Sender<SerialSettings>,
    background: Mutex<JoinSet<()>>,
}

impl Shared {
    fn new(config: DriverConfig) -> Self {
        let (link_tx, _) = watch::channel(LinkState::Closed);
        let (settings_tx, _) = watch::channel(config.serial.clone());
        Self {
            config,
            state: Mutex::new(DriverState::new()),
            ops: tokio::sync::Mutex::new(()),
            writer: tokio::sync::Mutex::new(None),
            inbound: Notify::new(),
            link_tx,
            settings_tx,
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn link(&self) -> LinkState {
        *self.link_tx.borrow()
    }

    pub(crate) fn set_link(&self, state: LinkState) {
        let previous = self.link_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Link state");
        }
        if state == LinkState::Open {
            // Datagrams queued while closed become readable
            self.inbound.notify_waiters();
        }
    }

    pub(crate) fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished tasks so the set does not grow
        while background.try_join_next().is_some() {}
        background.spawn(task);
    }

    pub(crate) async fn attach_writer(&self, writer: WriteHalf<BoxedStream>) {
        *self.writer.lock().await = Some(writer);
    }

    /// Tear down the link: writer gone, topology forgotten, mailboxes kept
    pub(crate) async fn close_link(&self) {
        *self.writer.lock().await = None;
        self.state().on_link_closed();
        self.set_link(LinkState::Closed);
    }

    /// Route one inbound frame and run whatever it asks for
    pub(crate) fn dispatch(self: &Arc<Self>, raw: RawFrame) {
        let routed = self.state().route_inbound(raw, self.config.mesh_trace);
        if routed.delivered {
            self.inbound.notify_waiters();
        }
        for follow_up in routed.follow_ups {
            match follow_up {
                FollowUp::Aggregate(address) => spawn_aggregation(self, address),
            }
        }
    }

    pub(crate) async fn write_message(&self, message: &ApiMessage) -> Result<()> {
        let wire = message.encode()?;
        trace_outbound(message, &wire, self.config.mesh_trace);
        let mut writer = self.writer.lock().await;
        let port = writer.as_mut().ok_or(DriverError::PortNotOpen)?;
        port.write_all(&wire).await?;
        port.flush().await?;
        Ok(())
    }

    /// Send application data from `source_endpoint` to a remote radio
    ///
    /// Returns the frame id used; with `tag` set the transmit status is
    /// queued on the sender's mailbox when it arrives.
    pub(crate) async fn transmit(
        &self,
        source_endpoint: u8,
        destination: &SocketAddress,
        payload: &[u8],
        tag: Option<u32>,
    ) -> Result<u8> {
        if self.link() != LinkState::Open {
            return Err(DriverError::PortNotOpen);
        }
        let (frame_id, message) = {
            let mut state = self.state();
            let generation = state
                .version
                .map(|v| v.generation())
                .unwrap_or(RadioGeneration::Mesh);
            let frame_id = state.frame_ids.next_id();
            let message = data_frame(generation, frame_id, source_endpoint, destination, payload)?;
            if let Some(tag) = tag {
                state.mailboxes.track_tx_status(frame_id, tag, source_endpoint);
            }
            (frame_id, message)
        };
        if let Err(e) = self.write_message(&message).await {
            self.state().mailboxes.forget_tx_status(frame_id);
            return Err(e);
        }
        Ok(frame_id)
    }

    pub(crate) fn loopback(&self, source_endpoint: u8, destination: &SocketAddress, payload: &[u8]) -> bool {
        let delivered = self.state().mailboxes.loopback(source_endpoint, destination, payload);
        if delivered {
            self.inbound.notify_waiters();
        }
        delivered
    }

    pub(crate) fn register_mailbox(&self, id: MailboxId) -> bool {
        self.state().mailboxes.register(id)
    }

    pub(crate) fn unregister_mailbox(&self, id: MailboxId) -> bool {
        self.state().mailboxes.unregister(id)
    }

    /// Next datagram for `id`; nothing is readable while the link is down
    pub(crate) fn pop_datagram(&self, id: MailboxId) -> Option<Datagram> {
        if self.link() != LinkState::Open {
            return None;
        }
        self.state().mailboxes.pop(id)
    }

    /// Readable datagrams for `id`, recreating the mailbox if it vanished
    pub(crate) fn readable(&self, id: MailboxId) -> usize {
        let mut state = self.state();
        match state.mailboxes.pending(id) {
            Some(count) if self.link() == LinkState::Open => count,
            Some(_) => 0,
            None => {
                state.mailboxes.register(id);
                0
            }
        }
    }

    pub(crate) fn inbound(&self) -> &Notify {
        &self.inbound
    }
}

/// Build the radio frame for application data
fn data_frame(
    generation: RadioGeneration,
    frame_id: u8,
    source_endpoint: u8,
    destination: &SocketAddress,
    payload: &[u8],
) -> Result<ApiMessage> {
    let options = destination.options.unwrap_or(0);
    let data = payload.to_vec();
    let zigbee = |extended: ExtendedAddress, short: ShortAddress, data: Vec<u8>| {
        ApiMessage::ZigbeeTransmit(ZigbeeTransmit {
            frame_id,
            destination: extended,
            destination_short: short,
            source_endpoint,
            destination_endpoint: destination.endpoint,
            cluster_id: destination.cluster_id,
            profile_id: destination.profile_id,
            radius: 0,
            options,
            data,
        })
    };
    let message = match (generation, destination.address) {
        (_, Address::Local) => {
            return Err(DriverError::Frame(FrameError::Malformed {
                kind: "transmit",
                reason: "the local radio is reached by loopback".to_string(),
            }))
        }
        (RadioGeneration::Legacy802154, Address::Short(short)) => ApiMessage::Transmit16(Transmit16 {
            frame_id,
            destination: short,
            options,
            data,
        }),
        (RadioGeneration::Legacy802154, Address::Extended(extended)) => {
            ApiMessage::Transmit64(Transmit64 {
                frame_id,
                destination: extended,
                options,
                data,
            })
        }
        (RadioGeneration::Mesh, Address::Short(short)) => zigbee(ExtendedAddress::UNKNOWN, short, data),
        (RadioGeneration::Mesh, Address::Extended(extended)) => zigbee(extended, ShortAddress::UNKNOWN, data),
    };
    Ok(message)
}

fn spawn_aggregation(shared: &Arc<Shared>, destination: ExtendedAddress) {
    shared.spawn_background(run_aggregation(shared.clone(), destination));
}

/// Read one node's neighbor table page by page, then merge it
async fn run_aggregation(shared: Arc<Shared>, destination: ExtendedAddress) {
    let lqi_timeout = shared.config.timing.lqi_timeout();
    let mut aggregation = LqiAggregation::new();
    let mut start_index = aggregation.start();

    loop {
        let request = shared.state().lqi.send_command(destination, start_index, lqi_timeout);
        if let Err(e) = shared
            .transmit(0, &request.destination, &request.frame.encode(), None)
            .await
        {
            debug!(address = %destination, error = %e, "Unable to send Mgmt_Lqi_req");
            break;
        }
        match request.reply.await {
            Ok(Outcome::Matched(response)) => match aggregation.accept(response) {
                Step::Request(next) => start_index = next,
                Step::Done => break,
            },
            Ok(Outcome::TimedOut) | Err(_) => {
                debug!(address = %destination, start_index, "Mgmt_Lqi_req timed out");
                break;
            }
        }
    }

    let requests = aggregation.requests();
    let records = aggregation.into_records();
    let added = shared.state().directory.merge_lqi(&records);
    debug!(
        address = %destination,
        requests,
        records = records.len(),
        new_nodes = added.len(),
        "Neighbor table read"
    );
    for address in added {
        spawn_aggregation(&shared, address);
    }
}

/// Expire ZDO conversations at a fixed rate
async fn sweep_conversations(shared: Arc<Shared>) {
    let mut ticker = interval(shared.config.timing.tick_interval());
    loop {
        ticker.tick().await;
        let expired = shared.state().lqi.tick();
        if expired > 0 {
            debug!(expired, "Expired ZDO conversations");
        }
    }
}

/// Handle to a running XBee driver
#[derive(Clone)]
pub struct Driver {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("link", &self.shared.link())
            .field("port", &self.shared.settings_tx.borrow().port)
            .finish()
    }
}

impl Driver {
    /// Start a driver on the configured serial port
    ///
    /// Must be called from within a tokio runtime. The port is opened in the
    /// background; use [`Driver::wait_until_open`] to wait for the radio.
    pub fn new(config: DriverConfig) -> Self {
        Self::with_opener(config, SerialPortOpener)
    }

    /// Start a driver whose byte stream comes from `opener`
    pub fn with_opener(config: DriverConfig, opener: impl PortOpener) -> Self {
        let driver = Self::detached(config);
        let opener: Arc<dyn PortOpener> = Arc::new(opener);
        let settings_rx = driver.shared.settings_tx.subscribe();
        driver
            .shared
            .spawn_background(transport::run(driver.clone(), opener, settings_rx));
        driver
            .shared
            .spawn_background(sweep_conversations(driver.shared.clone()));
        driver
    }

    /// A driver without transport or sweep tasks
    pub(crate) fn detached(config: DriverConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.link()
    }

    /// Watch link state transitions
    pub fn subscribe_link(&self) -> watch::Receiver<LinkState> {
        self.shared.link_tx.subscribe()
    }

    /// Wait until the port is open and the radio probed
    pub async fn wait_until_open(&self, timeout: Duration) -> Result<()> {
        let mut link = self.subscribe_link();
        let opened = tokio::time::timeout(timeout, link.wait_for(|s| *s == LinkState::Open))
            .await
            .is_ok_and(|r| r.is_ok());
        if opened {
            Ok(())
        } else {
            Err(DriverError::PortNotOpen)
        }
    }

    /// Version registers read while probing, if the link is up
    pub fn radio_version(&self) -> Option<RadioVersion> {
        self.shared.state().version
    }

    pub fn settings(&self) -> SerialSettings {
        self.shared.settings_tx.borrow().clone()
    }

    /// Apply new serial settings; a different port or baud rate reopens the link
    pub fn update_settings(&self, settings: SerialSettings) {
        info!(port = %settings.port, baud = settings.baud, "Serial settings updated");
        self.shared.settings_tx.send_replace(settings);
    }

    /// Stop all background work and close the port
    pub async fn shutdown(&self) {
        self.shared
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
        self.shared.close_link().await;
        info!("Driver shut down");
    }

    fn gate(&self) -> Result<()> {
        if self.shared.link() != LinkState::Open {
            return Err(DriverError::PortNotOpen);
        }
        Ok(())
    }

    /// Send a frame built around a fresh frame id and wait for the reply
    ///
    /// Does not take the operation lock and ignores the link gate; callers
    /// handle both.
    async fn exchange(
        &self,
        operation: &'static str,
        id: &str,
        address: Option<ExtendedAddress>,
        timeout: Duration,
        build: impl FnOnce(u8) -> ApiMessage,
    ) -> Result<Reply> {
        let (frame_id, mut replies, message) = {
            let mut state = self.shared.state();
            let frame_id = state.frame_ids.next_id();
            let replies = state.pending.open(frame_id);
            (frame_id, replies, build(frame_id))
        };

        let deadline = Instant::now() + timeout;
        let outcome = match self.shared.write_message(&message).await {
            Ok(()) => timeout_at(deadline, replies.recv()).await,
            Err(e) => {
                self.shared.state().pending.close(frame_id);
                return Err(e);
            }
        };
        self.shared.state().pending.close(frame_id);

        let reply = match outcome {
            Ok(Some(reply)) => reply,
            Ok(None) | Err(_) => {
                return Err(DriverError::Timeout {
                    operation,
                    id: id.to_string(),
                    address: describe(address),
                })
            }
        };
        match reply {
            ApiMessage::LocalAtResponse(LocalAtResponse { status, value, .. })
            | ApiMessage::RemoteAtResponse(RemoteAtResponse { status, value, .. }) => {
                Ok(Reply { status, value })
            }
            ApiMessage::RegisterDeviceStatus(r) => Ok(Reply {
                status: r.status,
                value: Vec::new(),
            }),
            other => Err(DriverError::Frame(FrameError::Malformed {
                kind: "reply",
                reason: format!("unexpected api id {:#04x}", other.api_id()),
            })),
        }
    }

    async fn at_command(
        &self,
        operation: &'static str,
        address: Option<ExtendedAddress>,
        command: AtCommand,
        parameter: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let reply = self
            .exchange(operation, command.as_str(), address, timeout, |frame_id| match address {
                None => ApiMessage::LocalAtCommand(LocalAtCommand {
                    frame_id,
                    command,
                    parameter,
                }),
                Some(destination) => ApiMessage::RemoteAtCommand(RemoteAtCommand {
                    frame_id,
                    destination,
                    destination_short: ShortAddress::UNKNOWN,
                    options: REMOTE_AT_APPLY_CHANGES,
                    command,
                    parameter,
                }),
            })
            .await?;
        reply.into_value(operation, command.as_str(), describe(address))
    }

    /// Read a register of the local radio
    async fn read_local(&self, operation: &'static str, register: &[u8; 2]) -> Result<Vec<u8>> {
        self.at_command(operation, None, AtCommand(*register), Vec::new(), INTERNAL_AT_TIMEOUT)
            .await
    }

    /// Validate `id`, then run one AT exchange under the operation lock
    async fn locked_at_command(
        &self,
        operation: &'static str,
        address: Option<ExtendedAddress>,
        id: &str,
        parameter: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let command = parse_id(id)?;
        let _ops = self.shared.ops.lock().await;
        self.gate()?;
        self.at_command(operation, address, command, parameter, timeout)
            .await
    }

    /// Read a parameter; `None` addresses the local radio
    pub async fn get_param(
        &self,
        address: Option<ExtendedAddress>,
        id: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.locked_at_command("get_param", address, id, Vec::new(), timeout)
            .await
    }

    /// Write a parameter
    pub async fn set_param(
        &self,
        address: Option<ExtendedAddress>,
        id: &str,
        value: impl Into<ParamValue>,
        timeout: Duration,
    ) -> Result<()> {
        let value = value.into().to_bytes();
        self.locked_at_command("set_param", address, id, value, timeout)
            .await?;
        Ok(())
    }

    /// Run a command; an empty reply value comes back as `None`
    pub async fn execute_command(
        &self,
        address: Option<ExtendedAddress>,
        id: &str,
        param: Option<ParamValue>,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let param = param.map(|p| p.to_bytes()).unwrap_or_default();
        let value = self
            .locked_at_command("execute_command", address, id, param, timeout)
            .await?;
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    /// Register a joining device with its link key (at most 16 bytes)
    ///
    /// A zero timeout sends the request without waiting for the status.
    pub async fn register_joining_device(
        &self,
        address: ExtendedAddress,
        key: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        if key.len() > 16 {
            return Err(DriverError::InvalidKey(key.len()));
        }
        let _ops = self.shared.ops.lock().await;
        self.gate()?;
        self.register_device("register_joining_device", address, key.to_vec(), timeout)
            .await
    }

    /// Remove a device and its link key from the radio
    pub async fn unregister_joining_device(&self, address: ExtendedAddress, timeout: Duration) -> Result<()> {
        let _ops = self.shared.ops.lock().await;
        self.gate()?;
        self.register_device("unregister_joining_device", address, Vec::new(), timeout)
            .await
    }

    async fn register_device(
        &self,
        operation: &'static str,
        device: ExtendedAddress,
        link_key: Vec<u8>,
        timeout: Duration,
    ) -> Result<()> {
        if timeout.is_zero() {
            let frame_id = self.shared.state().frame_ids.next_id();
            return self
                .shared
                .write_message(&ApiMessage::RegisterDevice(RegisterDevice {
                    frame_id,
                    device,
                    link_key,
                }))
                .await;
        }
        let reply = self
            .exchange(operation, "register", Some(device), timeout, |frame_id| {
                ApiMessage::RegisterDevice(RegisterDevice {
                    frame_id,
                    device,
                    link_key,
                })
            })
            .await?;
        reply.into_value(operation, "register", device.to_string())?;
        Ok(())
    }

    /// Known nodes, local radio first
    ///
    /// With `refresh` a discovery is started; `blocking` waits for its window
    /// (3 s for mesh radios, NT/10 s for 802.15.4), otherwise it finishes in
    /// the background and the current snapshot is returned.
    pub async fn get_node_list(&self, refresh: bool, blocking: bool) -> Result<Vec<Node>> {
        let _ops = self.shared.ops.lock().await;

        if self.shared.state().directory.is_empty() {
            self.gate()?;
            let local = self.create_local_node().await?;
            info!(address = %local.addr_extended, kind = %local.kind, label = %local.label, "Local node");
            self.shared.state().directory.set_local(local);
        }

        if refresh {
            self.gate()?;
            let version = self.radio_version().ok_or(DriverError::PortNotOpen)?;
            match version.generation() {
                RadioGeneration::Legacy802154 if blocking => self.legacy_discovery().await?,
                RadioGeneration::Legacy802154 => {
                    let driver = self.clone();
                    self.shared.spawn_background(async move {
                        let _ops = driver.shared.ops.lock().await;
                        if let Err(e) = driver.legacy_discovery().await {
                            warn!(error = %e, "Node discovery failed");
                        }
                    });
                }
                RadioGeneration::Mesh => {
                    self.mesh_discovery();
                    if blocking {
                        sleep(self.shared.config.timing.discovery_window()).await;
                    }
                }
            }
        }

        Ok(self.shared.state().directory.snapshot())
    }

    /// Start a neighbor table read for every known node
    fn mesh_discovery(&self) {
        let addresses = {
            let mut state = self.shared.state();
            let addresses = state.directory.addresses();
            state.directory.reset_to_local();
            addresses
        };
        info!(nodes = addresses.len(), "Starting mesh discovery");
        for address in addresses {
            spawn_aggregation(&self.shared, address);
        }
    }

    /// `ND` sweep for 802.15.4 radios
    async fn legacy_discovery(&self) -> Result<()> {
        let nt = self.read_local("get_node_list", b"NT").await?;
        let nt = register_u16(&nt).unwrap_or(0xFF);
        let window = Duration::from_millis(nt as u64 * 100);

        let (frame_id, mut replies) = {
            let mut state = self.shared.state();
            let frame_id = state.frame_ids.next_id();
            (frame_id, state.pending.open(frame_id))
        };
        info!(window_ms = window.as_millis() as u64, "Starting node discovery");

        let command = ApiMessage::LocalAtCommand(LocalAtCommand {
            frame_id,
            command: AtCommand(*b"ND"),
            parameter: Vec::new(),
        });
        let mut collected = Vec::new();
        let sent = self.shared.write_message(&command).await;
        if sent.is_ok() {
            let deadline = Instant::now() + window;
            while let Ok(Some(reply)) = timeout_at(deadline, replies.recv()).await {
                collected.push(reply);
            }
        }
        self.shared.state().pending.close(frame_id);
        sent?;

        let generation = self
            .radio_version()
            .map(|v| v.generation())
            .unwrap_or(RadioGeneration::Legacy802154);
        let nodes: Vec<Node> = collected
            .iter()
            .filter_map(|reply| match reply {
                ApiMessage::LocalAtResponse(r) => Some(&r.value),
                _ => None,
            })
            .filter_map(|value| match parse_node_discovery(value, generation) {
                Ok(node) => Some(node),
                Err(e) => {
                    debug!(error = %e, "Skipping malformed ND reply");
                    None
                }
            })
            .collect();
        self.shared.state().directory.replace_remote(nodes);
        Ok(())
    }

    /// Build the local node from its own registers
    async fn create_local_node(&self) -> Result<Node> {
        let version = self.radio_version().ok_or(DriverError::PortNotOpen)?;
        let op = "get_node_list";

        let my = self.read_local(op, b"MY").await?;
        let sh = self.read_local(op, b"SH").await?;
        let sl = self.read_local(op, b"SL").await?;

        let addr_short = ShortAddress(register_u16(&my).ok_or_else(|| malformed("MY", &my))?);
        let addr_extended = ExtendedAddress((be_u32("SH", &sh)? << 32) | be_u32("SL", &sl)?);

        let label = if version.has_label() {
            let ni = self.read_local(op, b"NI").await?;
            String::from_utf8_lossy(&ni).into_owned()
        } else {
            String::new()
        };

        let kind = version.local_kind();
        let addr_parent = if kind == NodeKind::End {
            let mp = self.read_local(op, b"MP").await?;
            ShortAddress(register_u16(&mp).ok_or_else(|| malformed("MP", &mp))?)
        } else {
            ShortAddress::UNKNOWN
        };

        Ok(Node {
            kind,
            addr_extended,
            addr_short,
            addr_parent,
            profile_id: DIGI_PROFILE_ID,
            manufacturer_id: DIGI_MANUFACTURER_ID,
            label,
        })
    }

    /// Read `HV` and `VR` while the link is still probing
    pub(crate) async fn probe_version(&self) -> Result<RadioVersion> {
        let hv = self.read_local("probe", b"HV").await?;
        let vr = self.read_local("probe", b"VR").await?;
        let version = RadioVersion::new(
            register_u16(&hv).ok_or_else(|| malformed("HV", &hv))?,
            register_u16(&vr).ok_or_else(|| malformed("VR", &vr))?,
        );
        self.shared.state().version = Some(version);
        Ok(version)
    }

    /// Settings the gateway relies on; failures are not fatal
    pub(crate) async fn initialize_radio(&self, version: RadioVersion) {
        let mut settings = vec![(AtCommand(*b"D6"), 1u64), (AtCommand(*b"D7"), 1)];
        // AO is not supported on series 1 hardware
        if !version.is_series_1() {
            settings.push((AtCommand(*b"AO"), 3));
        }
        for (command, value) in settings {
            let value = ParamValue::Int(value).to_bytes();
            if let Err(e) = self
                .at_command("initialize", None, command, value, INTERNAL_AT_TIMEOUT)
                .await
            {
                warn!(command = %command, error = %e, "Unable to initialize radio parameter");
            }
        }
    }
}
