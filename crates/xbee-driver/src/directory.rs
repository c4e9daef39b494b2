//! Known nodes of the network
//!
//! The local radio is always entry 0. Remote nodes are keyed by extended
//! address and only ever added or updated, never evicted; a mesh refresh
//! starts over from the local node.

use tracing::{debug, info};
use xbee_core::{DeviceAnnounce, ExtendedAddress, NeighborTableRecord, Node, NodeKind};

#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: Vec<Node>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn local(&self) -> Option<&Node> {
        self.nodes.first()
    }

    /// Install the local node as entry 0
    pub fn set_local(&mut self, node: Node) {
        if self.nodes.is_empty() {
            self.nodes.push(node);
        } else {
            self.nodes[0] = node;
        }
    }

    pub fn get(&self, addr: ExtendedAddress) -> Option<&Node> {
        self.nodes.iter().find(|n| n.addr_extended == addr)
    }

    fn get_mut(&mut self, addr: ExtendedAddress) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.addr_extended == addr)
    }

    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    /// Extended addresses of every known node, local first
    pub fn addresses(&self) -> Vec<ExtendedAddress> {
        self.nodes.iter().map(|n| n.addr_extended).collect()
    }

    /// Forget all remote nodes
    pub fn reset_to_local(&mut self) {
        self.nodes.truncate(1);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Replace remote nodes with the result of a legacy `ND` sweep
    pub fn replace_remote(&mut self, nodes: Vec<Node>) {
        self.reset_to_local();
        for node in nodes {
            if self.get(node.addr_extended).is_none() {
                self.nodes.push(node);
            }
        }
        info!(nodes = self.nodes.len(), "Node discovery complete");
    }

    /// Merge a finished neighbor table read
    ///
    /// Returns the addresses that were not known before; each of them needs
    /// its own neighbor table read.
    pub fn merge_lqi(&mut self, records: &[NeighborTableRecord]) -> Vec<ExtendedAddress> {
        let mut added = Vec::new();
        for record in records {
            let kind = NodeKind::from_device_type(record.device_type);
            match self.get_mut(record.extended_address) {
                Some(node) => {
                    node.addr_short = record.short_address;
                    if node.kind == NodeKind::Unknown {
                        node.kind = kind;
                    }
                }
                None => {
                    debug!(
                        address = %record.extended_address,
                        short = %record.short_address,
                        kind = %kind,
                        "New node from neighbor table"
                    );
                    self.nodes.push(Node::remote(record.extended_address, record.short_address, kind));
                    added.push(record.extended_address);
                }
            }
        }
        added
    }

    /// Apply a device announce; returns the address if the node is new
    pub fn on_announce(&mut self, announce: &DeviceAnnounce) -> Option<ExtendedAddress> {
        if let Some(node) = self.get_mut(announce.ieee_addr) {
            node.addr_short = announce.nwk_addr;
            return None;
        }
        info!(
            address = %announce.ieee_addr,
            short = %announce.nwk_addr,
            "Device announced"
        );
        self.nodes.push(Node::remote(announce.ieee_addr, announce.nwk_addr, NodeKind::Unknown));
        Some(announce.ieee_addr)
    }
}
