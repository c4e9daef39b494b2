//! The two ZDO clusters used for topology discovery
//!
//! - Device announce server (0x0013): learns about devices joining the network
//! - Management LQI client (0x0031 / 0x8031): pages through neighbor tables

use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;
use xbee_core::zdo::{cluster, mgmt_lqi_request, ZDO_ENDPOINT, ZDO_PROFILE};
use xbee_core::{
    Address, DeviceAnnounce, ExtendedAddress, MgmtLqiResponse, NeighborTableRecord, SocketAddress,
    ZdoFrame,
};

use crate::correlation::{ConversationTable, Outcome};

/// Decode a device announce; malformed payloads are dropped
pub fn handle_device_announce(frame: &ZdoFrame) -> Option<DeviceAnnounce> {
    match DeviceAnnounce::decode(&frame.payload) {
        Ok(announce) => Some(announce),
        Err(e) => {
            debug!(tsn = frame.tsn, error = %e, "Dropping malformed device announce");
            None
        }
    }
}

/// An Mgmt_Lqi_req ready to transmit
#[derive(Debug)]
pub struct LqiRequest {
    pub destination: SocketAddress,
    pub frame: ZdoFrame,
    pub reply: oneshot::Receiver<Outcome<MgmtLqiResponse>>,
}

/// Client side of the Mgmt-LQI cluster
#[derive(Debug, Default)]
pub struct MgmtLqiClient {
    tsn: u8,
    conversations: ConversationTable<MgmtLqiResponse>,
}

impl MgmtLqiClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_tsn(&mut self) -> u8 {
        self.tsn = self.tsn.wrapping_add(1);
        self.tsn
    }

    /// Build the request for one page of `destination`'s neighbor table
    pub fn send_command(&mut self, destination: ExtendedAddress, start_index: u8, timeout: Duration) -> LqiRequest {
        let tsn = self.next_tsn();
        let address = Address::Extended(destination);
        let reply = self.conversations.issue(address, tsn, timeout);
        LqiRequest {
            destination: SocketAddress::new(address, ZDO_ENDPOINT, ZDO_PROFILE, cluster::MGMT_LQI_REQUEST),
            frame: mgmt_lqi_request(tsn, start_index),
            reply,
        }
    }

    /// Feed an Mgmt_Lqi_rsp; returns false when it answers nothing outstanding
    pub fn handle_response(&mut self, source: Address, frame: &ZdoFrame) -> bool {
        let response = match MgmtLqiResponse::decode(&frame.payload) {
            Ok(response) => response,
            Err(e) => {
                debug!(address = %source, tsn = frame.tsn, error = %e, "Malformed Mgmt_Lqi_rsp");
                return false;
            }
        };
        match self.conversations.on_frame_received(source, frame.tsn, response) {
            Ok(()) => true,
            Err(_) => {
                debug!(address = %source, tsn = frame.tsn, "Unexpected Mgmt_Lqi_rsp");
                false
            }
        }
    }

    pub fn tick(&mut self) -> usize {
        self.conversations.tick()
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.conversations.active()
    }
}

/// Next action of a paginated neighbor table read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Request the page starting at this index
    Request(u8),
    /// All pages read (or the node stopped answering properly)
    Done,
}

/// Collects the whole neighbor table of one node, page by page
#[derive(Debug, Default)]
pub struct LqiAggregation {
    records: Vec<NeighborTableRecord>,
    requests: usize,
    requested: u8,
}

impl LqiAggregation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the first page
    pub fn start(&mut self) -> u8 {
        self.requests = 1;
        self.requested = 0;
        0
    }

    /// Take the page answering the last request
    ///
    /// A page that does not reach past the requested index ends the read.
    pub fn accept(&mut self, response: MgmtLqiResponse) -> Step {
        if !response.is_success() || response.records.is_empty() {
            return Step::Done;
        }
        let end_index = response.start_index as usize + response.records.len();
        if end_index <= self.requested as usize {
            debug!(
                requested = self.requested,
                start_index = response.start_index,
                "Neighbor table page does not advance"
            );
            return Step::Done;
        }
        self.records.extend(response.records);
        if end_index < response.neighbor_table_entries as usize {
            self.requests += 1;
            self.requested = end_index as u8;
            Step::Request(self.requested)
        } else {
            Step::Done
        }
    }

    /// Requests issued so far, including the first
    pub fn requests(&self) -> usize {
        self.requests
    }

    pub fn into_records(self) -> Vec<NeighborTableRecord> {
        self.records
    }
}
