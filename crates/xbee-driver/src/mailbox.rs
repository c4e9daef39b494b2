//! Per-endpoint receive queues
//!
//! Inbound data frames are turned into [`Datagram`]s and queued on the
//! mailbox of the endpoint they address. Raw taps receive byte-exact copies
//! of every frame (or every frame of one API id) for `Xapi` sockets.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};
use xbee_core::address::options;
use xbee_core::message::{api_id, delivery, Receive16, Receive64, ZigbeeReceive, ZigbeeTxStatus};
use xbee_core::node::DIGI_PROFILE_ID;
use xbee_core::{Address, ApiMessage, ExtendedAddress, RawFrame, ShortAddress, SocketAddress};

/// Endpoint whose traffic is duplicated to every bound endpoint except 0
pub const BROADCAST_ENDPOINT: u8 = 0xFF;
/// Source endpoint reported for 802.15.4 IO samples
pub const IO_SOURCE_ENDPOINT: u8 = 0xE8;
/// Cluster ids reported for 802.15.4 IO samples (64-bit and 16-bit source)
pub const IO_CLUSTER_64: u16 = 0x92;
pub const IO_CLUSTER_16: u16 = 0x93;

/// Key of a receive queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailboxId {
    /// Application endpoint
    Endpoint(u8),
    /// Raw frames of one API id
    Tap(u8),
}

impl MailboxId {
    /// Raw copy of every frame regardless of API id
    pub const ALL_FRAMES: MailboxId = MailboxId::Tap(0xFF);
}

/// One received payload and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub source: SocketAddress,
}

impl Datagram {
    pub fn new(payload: Vec<u8>, source: SocketAddress) -> Self {
        Self { payload, source }
    }
}

#[derive(Debug, Clone, Copy)]
struct TxStatusWaiter {
    tag: u32,
    endpoint: u8,
}

/// Source address of a ZigBee receive; the short address stands in when the
/// radio does not know the 64-bit one
pub fn zigbee_source(rx: &ZigbeeReceive) -> Address {
    if rx.source == ExtendedAddress::UNKNOWN {
        Address::Short(rx.source_short)
    } else {
        Address::Extended(rx.source)
    }
}

#[derive(Debug, Default)]
pub struct Mailboxes {
    queues: HashMap<MailboxId, VecDeque<Datagram>>,
    tx_status: HashMap<u8, TxStatusWaiter>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the queue for `id`; returns false if it already exists
    pub fn register(&mut self, id: MailboxId) -> bool {
        if self.queues.contains_key(&id) {
            return false;
        }
        self.queues.insert(id, VecDeque::new());
        true
    }

    /// Drop the queue for `id` along with anything still queued on it
    pub fn unregister(&mut self, id: MailboxId) -> bool {
        self.queues.remove(&id).is_some()
    }

    pub fn is_registered(&self, id: MailboxId) -> bool {
        self.queues.contains_key(&id)
    }

    /// Queue a datagram; dropped when nobody is bound to `id`
    pub fn push(&mut self, id: MailboxId, datagram: Datagram) -> bool {
        match self.queues.get_mut(&id) {
            Some(queue) => {
                queue.push_back(datagram);
                true
            }
            None => false,
        }
    }

    pub fn pop(&mut self, id: MailboxId) -> Option<Datagram> {
        self.queues.get_mut(&id)?.pop_front()
    }

    /// Number of queued datagrams, `None` if the mailbox does not exist
    pub fn pending(&self, id: MailboxId) -> Option<usize> {
        self.queues.get(&id).map(VecDeque::len)
    }

    /// Copy a raw frame into the all-frames tap and the tap for its API id
    pub fn tap(&mut self, raw: &RawFrame) -> usize {
        let source = SocketAddress::new(Address::Short(ShortAddress::ZERO), 0, 0, 0)
            .with_options(0)
            .with_tag(0);
        let mut copies = 0;
        for id in [MailboxId::ALL_FRAMES, MailboxId::Tap(raw.frame.api_id)] {
            if self.push(id, Datagram::new(raw.wire.clone(), source.clone())) {
                copies += 1;
            }
            // A frame with api id 0xFF must only be copied once
            if raw.frame.api_id == 0xFF {
                break;
            }
        }
        copies
    }

    /// Queue a ZigBee explicit receive on its destination endpoint
    pub fn deliver_zigbee(&mut self, rx: &ZigbeeReceive) -> usize {
        let source = SocketAddress::new(zigbee_source(rx), rx.source_endpoint, rx.profile_id, rx.cluster_id)
            .with_options(rx.options);
        let datagram = Datagram::new(rx.data.clone(), source);

        if rx.destination_endpoint != BROADCAST_ENDPOINT {
            return usize::from(self.push(MailboxId::Endpoint(rx.destination_endpoint), datagram));
        }

        let mut delivered = 0;
        for (id, queue) in self.queues.iter_mut() {
            if matches!(id, MailboxId::Endpoint(ep) if *ep != 0) {
                queue.push_back(datagram.clone());
                delivered += 1;
            }
        }
        trace!(delivered, "Broadcast endpoint fan-out");
        delivered
    }

    /// 802.15.4 data always lands on endpoint 0
    pub fn deliver_802_15_4(&mut self, message: &ApiMessage) -> bool {
        let datagram = match message {
            ApiMessage::Receive64(Receive64 { source, options: opts, data, .. }) => Datagram::new(
                data.clone(),
                SocketAddress::new(Address::Extended(*source), 0, 0, 0).with_options(*opts),
            ),
            ApiMessage::Receive16(Receive16 { source, options: opts, data, .. }) => Datagram::new(
                data.clone(),
                SocketAddress::new(Address::Short(*source), 0, 0, 0).with_options(*opts),
            ),
            ApiMessage::IoSample64(Receive64 { source, options: opts, data, .. }) => Datagram::new(
                data.clone(),
                SocketAddress::new(Address::Extended(*source), IO_SOURCE_ENDPOINT, 0, IO_CLUSTER_64)
                    .with_options(*opts),
            ),
            ApiMessage::IoSample16(Receive16 { source, options: opts, data, .. }) => Datagram::new(
                data.clone(),
                SocketAddress::new(Address::Short(*source), IO_SOURCE_ENDPOINT, 0, IO_CLUSTER_16)
                    .with_options(*opts),
            ),
            _ => return false,
        };
        self.push(MailboxId::Endpoint(0), datagram)
    }

    /// Remember that the transmit with `frame_id` wants its status on `endpoint`
    pub fn track_tx_status(&mut self, frame_id: u8, tag: u32, endpoint: u8) {
        self.tx_status.insert(frame_id, TxStatusWaiter { tag, endpoint });
    }

    /// Drop a status request whose transmit never reached the radio
    pub fn forget_tx_status(&mut self, frame_id: u8) {
        self.tx_status.remove(&frame_id);
    }

    #[cfg(test)]
    pub fn tracked_tx_status(&self) -> usize {
        self.tx_status.len()
    }

    /// Route a transmit status frame to the socket that asked for it
    pub fn deliver_tx_status(&mut self, message: &ApiMessage) -> bool {
        let Some(frame_id) = message.frame_id() else {
            return false;
        };
        let Some(waiter) = self.tx_status.remove(&frame_id) else {
            debug!(frame_id, "Transmit status nobody asked for");
            return false;
        };
        let mut payload = vec![message.api_id()];
        payload.extend(message.encode_payload());
        let source = SocketAddress::new(
            Address::Extended(ExtendedAddress::ZERO),
            waiter.endpoint,
            DIGI_PROFILE_ID,
            message.api_id() as u16,
        )
        .with_options(0)
        .with_tag(waiter.tag);
        self.push(MailboxId::Endpoint(waiter.endpoint), Datagram::new(payload, source))
    }

    /// Deliver a send to the local radio straight into the destination queue
    pub fn loopback(&mut self, source_endpoint: u8, destination: &SocketAddress, payload: &[u8]) -> bool {
        let local = MailboxId::Endpoint(destination.endpoint);
        if !self.is_registered(local) {
            debug!(endpoint = destination.endpoint, "Loopback to unbound endpoint dropped");
            return false;
        }

        if let Some(tag) = destination.tag {
            let status = ApiMessage::ZigbeeTxStatus(ZigbeeTxStatus {
                frame_id: 0,
                remote_short: ShortAddress::UNKNOWN,
                retry_count: 0,
                delivery_status: delivery::SUCCESS,
                discovery_status: 0,
            });
            let mut record = vec![api_id::ZIGBEE_TX_STATUS];
            record.extend(status.encode_payload());
            let source = SocketAddress::new(
                Address::Extended(ExtendedAddress::ZERO),
                source_endpoint,
                DIGI_PROFILE_ID,
                api_id::ZIGBEE_TX_STATUS as u16,
            )
            .with_options(0)
            .with_tag(tag);
            self.push(MailboxId::Endpoint(source_endpoint), Datagram::new(record, source));
        }

        // Secured sends stay flagged; acknowledged unless NOACK was asked for
        let rx_options = destination
            .options
            .map(|o| (o & options::TX_APSSEC) | (o ^ options::RX_ACK))
            .unwrap_or(0);
        let source = SocketAddress::new(
            Address::Local,
            source_endpoint,
            destination.profile_id,
            destination.cluster_id,
        )
        .with_options(rx_options);
        self.push(local, Datagram::new(payload.to_vec(), source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xbee_core::message::TxStatus;
    use xbee_core::ApiFrame;

    fn zb_rx(destination_endpoint: u8, data: &[u8]) -> ZigbeeReceive {
        ZigbeeReceive {
            source: ExtendedAddress(0x0013_A200_4000_0001),
            source_short: ShortAddress(0x1234),
            source_endpoint: 0xE8,
            destination_endpoint,
            cluster_id: 0x0011,
            profile_id: DIGI_PROFILE_ID,
            options: options::RX_ACK,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_register_is_exclusive() {
        let mut boxes = Mailboxes::new();
        assert!(boxes.register(MailboxId::Endpoint(0xE8)));
        assert!(!boxes.register(MailboxId::Endpoint(0xE8)));
        assert!(boxes.register(MailboxId::Tap(0xE8)));
        assert!(boxes.unregister(MailboxId::Endpoint(0xE8)));
        assert_eq!(boxes.pending(MailboxId::Endpoint(0xE8)), None);
        assert!(boxes.pop(MailboxId::Endpoint(0xE8)).is_none());
    }

    #[test]
    fn test_zigbee_delivery_and_source() {
        let mut boxes = Mailboxes::new();
        boxes.register(MailboxId::Endpoint(0xE8));
        assert_eq!(boxes.deliver_zigbee(&zb_rx(0xE8, b"hi")), 1);
        assert_eq!(boxes.deliver_zigbee(&zb_rx(0xE9, b"lost")), 0);

        let got = boxes.pop(MailboxId::Endpoint(0xE8)).unwrap();
        assert_eq!(got.payload, b"hi");
        assert_eq!(got.source.address.to_string(), "[00:13:a2:00:40:00:00:01]!");
        assert_eq!(got.source.endpoint, 0xE8);
        assert_eq!(got.source.cluster_id, 0x0011);
        assert_eq!(got.source.options, Some(options::RX_ACK));
    }

    #[test]
    fn test_short_source_when_extended_unknown() {
        let mut rx = zb_rx(0xE8, b"x");
        rx.source = ExtendedAddress::UNKNOWN;
        assert_eq!(zigbee_source(&rx), Address::Short(ShortAddress(0x1234)));
    }

    #[test]
    fn test_broadcast_fan_out_skips_endpoint_zero() {
        let mut boxes = Mailboxes::new();
        for ep in [0x00, 0x10, 0xE8] {
            boxes.register(MailboxId::Endpoint(ep));
        }
        boxes.register(MailboxId::Tap(0x91));

        assert_eq!(boxes.deliver_zigbee(&zb_rx(BROADCAST_ENDPOINT, b"all")), 2);
        assert_eq!(boxes.pending(MailboxId::Endpoint(0x00)), Some(0));
        assert_eq!(boxes.pending(MailboxId::Endpoint(0x10)), Some(1));
        assert_eq!(boxes.pending(MailboxId::Endpoint(0xE8)), Some(1));
        assert_eq!(boxes.pending(MailboxId::Tap(0x91)), Some(0));
    }

    #[test]
    fn test_raw_taps_get_wire_bytes() {
        let mut boxes = Mailboxes::new();
        boxes.register(MailboxId::ALL_FRAMES);
        boxes.register(MailboxId::Tap(0x88));
        boxes.register(MailboxId::Tap(0x8B));

        let frame = ApiFrame::new(0x88, vec![0x01, b'N', b'I', 0x00]);
        let raw = RawFrame {
            wire: frame.encode().unwrap(),
            frame,
        };
        assert_eq!(boxes.tap(&raw), 2);
        let copy = boxes.pop(MailboxId::Tap(0x88)).unwrap();
        assert_eq!(copy.payload, raw.wire);
        assert_eq!(copy.source.address.to_string(), "[0000]!");
        assert_eq!(boxes.pending(MailboxId::Tap(0x8B)), Some(0));
    }

    #[test]
    fn test_io_sample_on_endpoint_zero() {
        let mut boxes = Mailboxes::new();
        boxes.register(MailboxId::Endpoint(0));
        let io = ApiMessage::IoSample16(Receive16 {
            source: ShortAddress(0x0042),
            rssi: 0x30,
            options: 0,
            data: vec![0x01, 0x02, 0x00, 0x02],
        });
        assert!(boxes.deliver_802_15_4(&io));
        let got = boxes.pop(MailboxId::Endpoint(0)).unwrap();
        assert_eq!(got.source.endpoint, IO_SOURCE_ENDPOINT);
        assert_eq!(got.source.cluster_id, IO_CLUSTER_16);
        assert_eq!(got.source.profile_id, 0);
    }

    #[test]
    fn test_tx_status_consumed_once() {
        let mut boxes = Mailboxes::new();
        boxes.register(MailboxId::Endpoint(0xE8));
        boxes.track_tx_status(9, 77, 0xE8);

        let status = ApiMessage::TxStatus(TxStatus { frame_id: 9, status: 0 });
        assert!(boxes.deliver_tx_status(&status));
        assert!(!boxes.deliver_tx_status(&status));
        assert_eq!(boxes.tracked_tx_status(), 0);

        let record = boxes.pop(MailboxId::Endpoint(0xE8)).unwrap();
        assert_eq!(record.payload, vec![api_id::TX_STATUS, 9, 0]);
        assert_eq!(record.source.tag, Some(77));
        assert_eq!(record.source.cluster_id, api_id::TX_STATUS as u16);
        assert_eq!(record.source.address.to_string(), "[00:00:00:00:00:00:00:00]!");
    }

    #[test]
    fn test_loopback_with_tag() {
        let mut boxes = Mailboxes::new();
        boxes.register(MailboxId::Endpoint(0xE8));
        boxes.register(MailboxId::Endpoint(0xE9));

        let dest = SocketAddress::new(Address::Local, 0xE9, DIGI_PROFILE_ID, 0x11)
            .with_options(0)
            .with_tag(5);
        assert!(boxes.loopback(0xE8, &dest, b"ping"));

        let got = boxes.pop(MailboxId::Endpoint(0xE9)).unwrap();
        assert_eq!(got.payload, b"ping");
        assert_eq!(got.source.address, Address::Local);
        assert_eq!(got.source.endpoint, 0xE8);
        assert_eq!(got.source.options, Some(options::RX_ACK));

        let status = boxes.pop(MailboxId::Endpoint(0xE8)).unwrap();
        assert_eq!(status.payload[0], api_id::ZIGBEE_TX_STATUS);
        assert_eq!(status.payload[5], delivery::SUCCESS);
        assert_eq!(status.source.tag, Some(5));
    }

    #[test]
    fn test_loopback_noack_clears_ack_flag() {
        let mut boxes = Mailboxes::new();
        boxes.register(MailboxId::Endpoint(0xE9));
        let dest = SocketAddress::new(Address::Local, 0xE9, 0, 0)
            .with_options(options::TX_NOACK | options::TX_APSSEC);
        assert!(boxes.loopback(0xE8, &dest, b"x"));
        let got = boxes.pop(MailboxId::Endpoint(0xE9)).unwrap();
        assert_eq!(got.source.options, Some(options::RX_APSSEC));
    }
}
