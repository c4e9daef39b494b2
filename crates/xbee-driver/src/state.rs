//! Driver state behind the state mutex, and inbound frame routing

use tracing::{debug, trace};
use xbee_core::message::{ZigbeeReceive, ZigbeeTransmit};
use xbee_core::zdo::{cluster, ZDO_ENDPOINT, ZDO_PROFILE};
use xbee_core::{ApiMessage, ExtendedAddress, RadioVersion, RawFrame, ZdoFrame};

use crate::cluster::{handle_device_announce, MgmtLqiClient};
use crate::correlation::{FrameIdAllocator, PendingReply};
use crate::directory::NodeDirectory;
use crate::mailbox::{zigbee_source, Mailboxes};

/// Work the receive path cannot do while holding the state lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// Read the neighbor table of a newly seen node
    Aggregate(ExtendedAddress),
}

/// Result of routing one inbound frame
#[derive(Debug, Default)]
pub struct Routed {
    /// Something was queued on a mailbox
    pub delivered: bool,
    pub follow_ups: Vec<FollowUp>,
}

#[derive(Debug, Default)]
pub struct DriverState {
    pub frame_ids: FrameIdAllocator,
    pub pending: PendingReply,
    pub lqi: MgmtLqiClient,
    pub mailboxes: Mailboxes,
    pub directory: NodeDirectory,
    pub version: Option<RadioVersion>,
}

impl DriverState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch one validated frame read from the radio
    pub fn route_inbound(&mut self, raw: RawFrame, mesh_trace: bool) -> Routed {
        let mut routed = Routed {
            delivered: self.mailboxes.tap(&raw) > 0,
            follow_ups: Vec::new(),
        };

        let message = match ApiMessage::decode(&raw.frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(api_id = raw.frame.api_id, error = %e, "Dropping undecodable frame");
                return routed;
            }
        };

        match &message {
            ApiMessage::ZigbeeReceive(rx) => {
                trace_zigbee_receive(rx, mesh_trace);
                if rx.destination_endpoint == ZDO_ENDPOINT && rx.profile_id == ZDO_PROFILE {
                    self.handle_zdo(rx, &mut routed);
                }
                routed.delivered |= self.mailboxes.deliver_zigbee(rx) > 0;
            }
            ApiMessage::Receive64(_)
            | ApiMessage::Receive16(_)
            | ApiMessage::IoSample64(_)
            | ApiMessage::IoSample16(_) => {
                trace!(api_id = message.api_id(), payload = %hex::encode(&raw.frame.payload), "RX");
                routed.delivered |= self.mailboxes.deliver_802_15_4(&message);
            }
            ApiMessage::LocalAtResponse(_)
            | ApiMessage::RemoteAtResponse(_)
            | ApiMessage::RegisterDeviceStatus(_) => {
                trace!(api_id = message.api_id(), frame_id = ?message.frame_id(), "RX reply");
                if !self.pending.offer(message.clone()) {
                    debug!(frame_id = ?message.frame_id(), "Reply nobody is waiting for");
                }
            }
            ApiMessage::ZigbeeTxStatus(_) | ApiMessage::TxStatus(_) => {
                trace!(api_id = message.api_id(), frame_id = ?message.frame_id(), "RX status");
                routed.delivered |= self.mailboxes.deliver_tx_status(&message);
            }
            other => {
                debug!(api_id = other.api_id(), "Not handling API frame");
            }
        }
        routed
    }

    fn handle_zdo(&mut self, rx: &ZigbeeReceive, routed: &mut Routed) {
        let frame = match ZdoFrame::decode(&rx.data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Empty ZDO payload");
                return;
            }
        };
        match rx.cluster_id {
            cluster::DEVICE_ANNOUNCE => {
                let Some(announce) = handle_device_announce(&frame) else {
                    return;
                };
                // Entry 0 must be the local node; announcements before it exists are ignored
                if self.directory.is_empty() {
                    debug!(address = %announce.ieee_addr, "Announce before local node is known");
                    return;
                }
                if let Some(address) = self.directory.on_announce(&announce) {
                    routed.follow_ups.push(FollowUp::Aggregate(address));
                }
            }
            cluster::MGMT_LQI_RESPONSE => {
                self.lqi.handle_response(zigbee_source(rx), &frame);
            }
            other => debug!(cluster = other, "Unhandled ZDO cluster"),
        }
    }

    /// Drop per-link state after the serial port closes
    pub fn on_link_closed(&mut self) {
        self.directory.clear();
        self.version = None;
    }
}

fn trace_zigbee_receive(rx: &ZigbeeReceive, mesh_trace: bool) {
    if mesh_trace {
        debug!(
            source = %rx.source,
            source_short = %rx.source_short,
            source_endpoint = rx.source_endpoint,
            destination_endpoint = rx.destination_endpoint,
            cluster = rx.cluster_id,
            profile = rx.profile_id,
            options = rx.options,
            payload = %hex::encode(&rx.data),
            "RX ZigBee"
        );
    } else {
        trace!(
            source = %rx.source,
            cluster = rx.cluster_id,
            len = rx.data.len(),
            "RX ZigBee"
        );
    }
}

/// Outbound counterpart of [`trace_zigbee_receive`]
pub fn trace_outbound(message: &ApiMessage, wire: &[u8], mesh_trace: bool) {
    match message {
        ApiMessage::ZigbeeTransmit(tx) if mesh_trace => trace_zigbee_transmit(tx),
        _ => trace!(
            api_id = message.api_id(),
            frame_id = ?message.frame_id(),
            wire = %hex::encode(wire),
            "TX"
        ),
    }
}

fn trace_zigbee_transmit(tx: &ZigbeeTransmit) {
    debug!(
        frame_id = tx.frame_id,
        destination = %tx.destination,
        destination_short = %tx.destination_short,
        source_endpoint = tx.source_endpoint,
        destination_endpoint = tx.destination_endpoint,
        cluster = tx.cluster_id,
        profile = tx.profile_id,
        radius = tx.radius,
        options = tx.options,
        payload = %hex::encode(&tx.data),
        "TX ZigBee"
    );
}
