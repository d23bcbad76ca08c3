
use crate::interface::InterfaceId;

use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// source address for sending, or destination address for receiving
    pub addr: std::net::Ipv6Addr,

    /// interface where the packet is sent or received
    pub if_index: InterfaceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHopLimit {
    pub hop_limit: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHopByHop {
    /// hop-by-hop extension header, starting with its next header byte
    pub hop_by_hop: Vec<u8>,
}

#[derive(Clone)]
pub struct Packet {
    /// destination address for sending, or source address for receiving
    pub target_addr: std::net::Ipv6Addr,

    /// ICMPv6 message
    pub data: Vec<u8>,

    pub info: Option<PacketInfo>,
    pub hop_limit: Option<PacketHopLimit>,
    pub hop_by_hop: Option<PacketHopByHop>,
}

impl Packet {
    /// receive buffer size
    pub const MAX_LEN: usize = 65536;

    pub fn new() -> Self {
        Self {
            target_addr: std::net::Ipv6Addr::UNSPECIFIED,
            data: Vec::new(),
            info: None,
            hop_limit: None,
            hop_by_hop: None,
        }
    }

    /// A packet carrying only message bytes, without ancillary data.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            ..Self::new()
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Packet");
        let mut debug = debug.field("target_addr", &self.target_addr)
            .field("data_len", &self.data.len());
        if let Some(info) = &self.info {
            debug = debug.field("info", &info);
        }
        if let Some(hop_limit) = &self.hop_limit {
            debug = debug.field("hop_limit", &hop_limit);
        }
        if let Some(hop_by_hop) = &self.hop_by_hop {
            debug = debug.field("hop_by_hop", &hop_by_hop);
        }
        debug.finish()
    }
}
