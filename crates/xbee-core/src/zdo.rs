//! ZigBee Device Object wire records
//!
//! ZDO payloads are little-endian, unlike the API frame headers around them.
//! Every ZDO payload starts with a one-byte transaction sequence number.

use bytes::{Buf, BufMut};

use crate::address::{ExtendedAddress, ShortAddress};
use crate::frame::FrameError;

/// ZDO traffic uses endpoint 0 and profile 0
pub const ZDO_ENDPOINT: u8 = 0x00;
pub const ZDO_PROFILE: u16 = 0x0000;

pub mod cluster {
    pub const DEVICE_ANNOUNCE: u16 = 0x0013;
    pub const MGMT_LQI_REQUEST: u16 = 0x0031;
    pub const MGMT_LQI_RESPONSE: u16 = 0x8031;
}

/// ZDO status code for success
pub const STATUS_SUCCESS: u8 = 0x00;

/// Size of one neighbor table record on the wire
pub const NEIGHBOR_RECORD_LEN: usize = 22;

/// A ZDO payload split into its sequence number and body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZdoFrame {
    pub tsn: u8,
    pub payload: Vec<u8>,
}

impl ZdoFrame {
    pub fn new(tsn: u8, payload: Vec<u8>) -> Self {
        Self { tsn, payload }
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        match data.split_first() {
            Some((&tsn, rest)) => Ok(Self::new(tsn, rest.to_vec())),
            None => Err(FrameError::Truncated {
                kind: "ZDO frame",
                needed: 1,
                actual: 0,
            }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 1);
        out.put_u8(self.tsn);
        out.put_slice(&self.payload);
        out
    }
}

/// Device_annce, broadcast by a device when it joins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAnnounce {
    pub nwk_addr: ShortAddress,
    pub ieee_addr: ExtendedAddress,
    pub capability: u8,
}

impl DeviceAnnounce {
    pub const LEN: usize = 11;

    pub fn decode(mut p: &[u8]) -> Result<Self, FrameError> {
        if p.len() < Self::LEN {
            return Err(FrameError::Truncated {
                kind: "device announce",
                needed: Self::LEN,
                actual: p.len(),
            });
        }
        Ok(Self {
            nwk_addr: ShortAddress(p.get_u16_le()),
            ieee_addr: ExtendedAddress(p.get_u64_le()),
            capability: p.get_u8(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_u16_le(self.nwk_addr.0);
        out.put_u64_le(self.ieee_addr.0);
        out.put_u8(self.capability);
        out
    }
}

/// One row of a neighbor table as reported by Mgmt_Lqi_rsp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborTableRecord {
    pub extended_pan_id: u64,
    pub extended_address: ExtendedAddress,
    pub short_address: ShortAddress,
    /// 0 coordinator, 1 router, 2 end device, 3 unknown
    pub device_type: u8,
    pub rx_on_when_idle: u8,
    pub relationship: u8,
    pub permit_joining: u8,
    pub depth: u8,
    pub lqi: u8,
}

impl NeighborTableRecord {
    pub fn decode(mut p: &[u8]) -> Result<Self, FrameError> {
        if p.len() < NEIGHBOR_RECORD_LEN {
            return Err(FrameError::Truncated {
                kind: "neighbor table record",
                needed: NEIGHBOR_RECORD_LEN,
                actual: p.len(),
            });
        }
        let extended_pan_id = p.get_u64_le();
        let extended_address = ExtendedAddress(p.get_u64_le());
        let short_address = ShortAddress(p.get_u16_le());
        let flags = p.get_u8();
        let joining = p.get_u8();
        Ok(Self {
            extended_pan_id,
            extended_address,
            short_address,
            device_type: flags & 0x03,
            rx_on_when_idle: (flags & 0x0C) >> 2,
            relationship: (flags & 0x70) >> 4,
            permit_joining: joining & 0x03,
            depth: p.get_u8(),
            lqi: p.get_u8(),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let flags = (self.device_type & 0x03)
            | ((self.rx_on_when_idle & 0x03) << 2)
            | ((self.relationship & 0x07) << 4);
        out.put_u64_le(self.extended_pan_id);
        out.put_u64_le(self.extended_address.0);
        out.put_u16_le(self.short_address.0);
        out.put_u8(flags);
        out.put_u8(self.permit_joining & 0x03);
        out.put_u8(self.depth);
        out.put_u8(self.lqi);
    }
}

/// Mgmt_Lqi_req body (after the sequence number)
pub fn mgmt_lqi_request(tsn: u8, start_index: u8) -> ZdoFrame {
    ZdoFrame::new(tsn, vec![start_index])
}

/// Mgmt_Lqi_rsp body; `records` is only populated on success
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtLqiResponse {
    pub status: u8,
    pub neighbor_table_entries: u8,
    pub start_index: u8,
    pub records: Vec<NeighborTableRecord>,
}

impl MgmtLqiResponse {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    pub fn decode(mut p: &[u8]) -> Result<Self, FrameError> {
        if p.is_empty() {
            return Err(FrameError::Truncated {
                kind: "Mgmt_Lqi_rsp",
                needed: 1,
                actual: 0,
            });
        }
        let status = p.get_u8();
        if status != STATUS_SUCCESS {
            return Ok(Self {
                status,
                neighbor_table_entries: 0,
                start_index: 0,
                records: Vec::new(),
            });
        }
        if p.len() < 3 {
            return Err(FrameError::Truncated {
                kind: "Mgmt_Lqi_rsp",
                needed: 4,
                actual: p.len() + 1,
            });
        }
        let neighbor_table_entries = p.get_u8();
        let start_index = p.get_u8();
        let count = p.get_u8() as usize;

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(NeighborTableRecord::decode(p)?);
            p.advance(NEIGHBOR_RECORD_LEN);
        }
        Ok(Self {
            status,
            neighbor_table_entries,
            start_index,
            records,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.records.len() * NEIGHBOR_RECORD_LEN);
        out.put_u8(self.status);
        out.put_u8(self.neighbor_table_entries);
        out.put_u8(self.start_index);
        out.put_u8(self.records.len() as u8);
        for record in &self.records {
            record.encode(&mut out);
        }
        out
    }
}
