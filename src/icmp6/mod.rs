
pub mod socket;
pub mod packet;
pub mod mld;

pub use socket::RawIcmp6Socket;
pub use socket::AsyncIcmp6Socket;

use mld::*;

use crate::util::checksum;

use std::net::Ipv6Addr;

/// IPv6 next header value of ICMPv6
pub const IPPROTO_ICMPV6: u8 = 58;

const HBH_OPT_PAD1: u8 = 0x00;
const HBH_OPT_PADN: u8 = 0x01;
const HBH_OPT_ROUTER_ALERT: u8 = 0x05;

/// Router Alert value for MLD (RFC 2711)
const ROUTER_ALERT_MLD: u16 = 0;

/// Largest message we are willing to build.
const MAX_MESSAGE_LEN: usize = 1500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Icmp6Error {
    message: &'static str,
}

impl Icmp6Error {
    pub fn new(message: &'static str) -> Self {
        Self {
            message,
        }
    }
}

impl std::fmt::Display for Icmp6Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Icmp6Error {}

/// ICMPv6 checksum over the IPv6 pseudo-header and `data`.
///
/// `data` is expected to carry zero in the checksum field when building, or
/// the received checksum when verifying (a valid message then sums to zero).
pub fn icmp6_checksum(source: &Ipv6Addr, destination: &Ipv6Addr, data: &[u8]) -> u16 {
    let mut sum = checksum::sum(&source.octets(), 0);
    sum = checksum::sum(&destination.octets(), sum);
    sum += data.len() as u64;
    sum += IPPROTO_ICMPV6 as u64;
    checksum::finish(checksum::sum(data, sum))
}

fn read_addr(data: &[u8], offset: usize) -> Result<Ipv6Addr, Icmp6Error> {
    let octets: [u8; 16] = data.get(offset..offset + 16)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(Icmp6Error::new("MLD packet too short"))?;
    Ok(Ipv6Addr::from(octets))
}

pub struct Icmp6Parser {
    pub(crate) packet: packet::Packet,
}

impl Icmp6Parser {
    pub fn new() -> Self {
        Self {
            packet: packet::Packet::new(),
        }
    }

    pub fn new_from_packet(packet: packet::Packet) -> Self {
        Self {
            packet,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        Self::new_from_packet(packet::Packet::from_bytes(data))
    }

    pub fn packet(&self) -> &packet::Packet {
        &self.packet
    }

    /// Value of the Router Alert option in the received hop-by-hop header.
    fn router_alert(&self) -> Result<Option<u16>, Icmp6Error> {
        let data = match &self.packet.hop_by_hop {
            Some(hop_by_hop) => &hop_by_hop.hop_by_hop,
            None => return Ok(None),
        };
        if data.len() < 2 {
            return Err(Icmp6Error::new("HBH: <bad length>"));
        }
        let total = (data[1] as usize + 1) * 8;
        let options = &data[2..total.min(data.len())];

        let mut i = 0;
        while i < options.len() {
            let opt_type = options[i];
            if opt_type == HBH_OPT_PAD1 {
                i += 1;
                continue;
            }
            if i + 2 > options.len() {
                return Err(Icmp6Error::new("HBH: truncated option"));
            }
            let len = options[i + 1] as usize;
            let value = options.get((i + 2)..(i + 2 + len))
                .ok_or(Icmp6Error::new("HBH: truncated option"))?;
            match opt_type {
                HBH_OPT_ROUTER_ALERT if len == 2 => {
                    return Ok(Some(u16::from_be_bytes([value[0], value[1]])));
                }
                HBH_OPT_PADN => {}
                _ => {}
            }
            i += 2 + len;
        }
        Ok(None)
    }

    /// Link-local scope checks, applied only when the ancillary data is known.
    fn check_mld(&self) -> Result<(), Icmp6Error> {
        if let Some(hop_limit) = self.packet.hop_limit {
            if hop_limit.hop_limit != 1 {
                return Err(Icmp6Error::new("MLD packet hop limit != 1"));
            }
        }
        if self.packet.hop_by_hop.is_some() && self.router_alert()? != Some(ROUTER_ALERT_MLD) {
            return Err(Icmp6Error::new("MLD packet without router alert"));
        }
        Ok(())
    }

    pub fn parse(&self) -> Result<Icmp6Packet, Icmp6Error> {
        let data = self.packet.data();
        if data.len() < 4 {
            return Err(Icmp6Error::new("ICMPv6 packet too short"));
        }
        let icmp6_type = data[0];
        let icmp6_code = data[1];

        match icmp6_type {
            MLD_LISTENER_QUERY => {
                self.check_mld()?;
                if data.len() < MLDV1_MESSAGE_LEN {
                    return Err(Icmp6Error::new("MLD packet too short"));
                }
                let maximum_response_delay = u16::from_be_bytes([data[4], data[5]]);
                let group_address = read_addr(data, 8)?;

                if data.len() == MLDV1_MESSAGE_LEN {
                    return Ok(Icmp6Packet::MulticastListenerQuery(MulticastListenerQuery {
                        version: crate::family::ProtocolVersion::V1,
                        maximum_response_delay,
                        group_address,
                        suppress_router_processing: false,
                        qrv: 0,
                        qqic: 0,
                        source_addresses: Vec::new(),
                    }));
                }
                if data.len() < MLDV2_QUERY_MIN_LEN {
                    return Err(Icmp6Error::new("MLD query bad length"));
                }

                let suppress_router_processing = data[24] & 0x08 != 0;
                let qrv = data[24] & 0x07;
                let qqic = data[25];
                let numsources = u16::from_be_bytes([data[26], data[27]]) as usize;
                if MLDV2_QUERY_MIN_LEN + 16 * numsources > data.len() {
                    return Err(Icmp6Error::new("MLD query too short for its sources"));
                }
                let source_addresses = (0..numsources)
                    .map(|j| read_addr(data, MLDV2_QUERY_MIN_LEN + 16 * j))
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(Icmp6Packet::MulticastListenerQuery(MulticastListenerQuery {
                    version: crate::family::ProtocolVersion::V2,
                    maximum_response_delay,
                    group_address,
                    suppress_router_processing,
                    qrv,
                    qqic,
                    source_addresses,
                }))
            }

            MLDV1_LISTENER_REPORT => {
                self.check_mld()?;
                if data.len() < MLDV1_MESSAGE_LEN {
                    return Err(Icmp6Error::new("MLD packet too short"));
                }
                Ok(Icmp6Packet::V1MulticastListenerReport(V1MulticastListenerReport {
                    group_address: read_addr(data, 8)?,
                }))
            }

            MLDV1_LISTENER_DONE => {
                self.check_mld()?;
                if data.len() < MLDV1_MESSAGE_LEN {
                    return Err(Icmp6Error::new("MLD packet too short"));
                }
                Ok(Icmp6Packet::V1MulticastListenerDone(V1MulticastListenerDone {
                    group_address: read_addr(data, 8)?,
                }))
            }

            MLDV2_LISTENER_REPORT => {
                self.check_mld()?;
                if data.len() < 8 {
                    return Err(Icmp6Error::new("MLDv2 packet too short"));
                }

                let numrecords = u16::from_be_bytes([data[6], data[7]]);
                let mut records = Vec::new();

                let mut offset = 8;
                for _ in 0..numrecords {
                    if offset + 20 > data.len() {
                        return Err(Icmp6Error::new("MLDv2 packet too short"));
                    }

                    let record_type = data[offset];
                    let aux_data_len = data[offset + 1] as usize * 4;
                    let numsources = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;

                    let end_offset = offset + 20 + 16 * numsources + aux_data_len;
                    if end_offset > data.len() {
                        return Err(Icmp6Error::new("MLDv2 packet too short"));
                    }
                    let multicast_address = read_addr(data, offset + 4)?;
                    let source_addresses = (0..numsources)
                        .map(|j| read_addr(data, offset + 20 + 16 * j))
                        .collect::<Result<Vec<_>, _>>()?;

                    records.push(MulticastReportRecord {
                        record_type,
                        multicast_address,
                        source_addresses,
                    });

                    offset = end_offset;
                }
                Ok(Icmp6Packet::V2MulticastListenerReport(V2MulticastListenerReport {
                    records,
                }))
            }

            _ => {
                Ok(Icmp6Packet::Unknown(icmp6_type, icmp6_code))
            }
        }
    }
}

impl Default for Icmp6Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Icmp6Packet {
    /// type 130
    MulticastListenerQuery(MulticastListenerQuery),

    /// type 131
    V1MulticastListenerReport(V1MulticastListenerReport),

    /// type 132
    V1MulticastListenerDone(V1MulticastListenerDone),

    /// type 143
    V2MulticastListenerReport(V2MulticastListenerReport),

    /// type, code
    Unknown(u8, u8),
}

#[derive(Debug)]
pub struct Icmp6Writer {
    pub(crate) packet: packet::Packet,
}

impl Icmp6Writer {
    pub fn new() -> Self {
        Self {
            packet: packet::Packet::new(),
        }
    }

    pub fn packet(&self) -> &packet::Packet {
        &self.packet
    }

    pub fn set_destination(&mut self, addr: Ipv6Addr) {
        self.packet.target_addr = addr;
    }

    pub fn set_hop_limit(&mut self, hop_limit: Option<u8>) {
        self.packet.hop_limit = hop_limit.map(|hop_limit| packet::PacketHopLimit { hop_limit });
    }

    pub fn set_hop_by_hop(&mut self, hop_by_hop: Option<Vec<u8>>) {
        self.packet.hop_by_hop = hop_by_hop.map(|hop_by_hop| packet::PacketHopByHop { hop_by_hop });
    }

    pub fn set_packet_info(&mut self, info: Option<packet::PacketInfo>) {
        self.packet.info = info;
    }

    /// Hop limit 1 and a hop-by-hop header carrying Router Alert (MLD).
    pub fn setup_mld(&mut self) {
        self.set_hop_limit(Some(1));
        self.set_hop_by_hop(Some(mld_hop_by_hop()));
    }

    /// Serializes `packet` with a zero checksum; see [`Icmp6Writer::set_checksum`].
    pub fn set_packet(&mut self, packet: &Icmp6Packet) -> Result<(), Icmp6Error> {
        let mut data = Vec::new();
        match packet {
            Icmp6Packet::MulticastListenerQuery(query) => {
                data.extend_from_slice(&[MLD_LISTENER_QUERY, 0, 0, 0]);
                data.extend_from_slice(&query.maximum_response_delay.to_be_bytes());
                data.extend_from_slice(&[0, 0]);
                data.extend_from_slice(&query.group_address.octets());

                if query.version == crate::family::ProtocolVersion::V2 {
                    if query.source_addresses.len() > MLDV2_QUERY_MAX_SOURCES {
                        return Err(Icmp6Error::new("MLD query source addresses too many"));
                    }
                    let mut flags = query.qrv & 0x07;
                    if query.suppress_router_processing {
                        flags |= 0x08;
                    }
                    data.push(flags);
                    data.push(query.qqic);
                    data.extend_from_slice(&(query.source_addresses.len() as u16).to_be_bytes());
                    for source_address in query.source_addresses.iter() {
                        data.extend_from_slice(&source_address.octets());
                    }
                }
            }

            Icmp6Packet::V1MulticastListenerReport(report) => {
                data.extend_from_slice(&[MLDV1_LISTENER_REPORT, 0, 0, 0, 0, 0, 0, 0]);
                data.extend_from_slice(&report.group_address.octets());
            }

            Icmp6Packet::V1MulticastListenerDone(done) => {
                data.extend_from_slice(&[MLDV1_LISTENER_DONE, 0, 0, 0, 0, 0, 0, 0]);
                data.extend_from_slice(&done.group_address.octets());
            }

            Icmp6Packet::V2MulticastListenerReport(report) => {
                data.extend_from_slice(&[MLDV2_LISTENER_REPORT, 0, 0, 0, 0, 0]);
                data.extend_from_slice(&(report.records.len() as u16).to_be_bytes());

                for record in report.records.iter() {
                    if record.source_addresses.len() > MLDV2_QUERY_MAX_SOURCES {
                        return Err(Icmp6Error::new("MLDv2 report source addresses too many"));
                    }
                    data.push(record.record_type);
                    data.push(0);
                    data.extend_from_slice(&(record.source_addresses.len() as u16).to_be_bytes());
                    data.extend_from_slice(&record.multicast_address.octets());
                    for source_address in record.source_addresses.iter() {
                        data.extend_from_slice(&source_address.octets());
                    }
                    if data.len() > MAX_MESSAGE_LEN {
                        return Err(Icmp6Error::new("MLDv2 packet too long"));
                    }
                }
            }

            Icmp6Packet::Unknown(..) => {
                return Err(Icmp6Error::new("ICMPv6 packet type is not supported"));
            }
        }

        self.packet.data = data;
        self.setup_mld();
        Ok(())
    }

    /// Fills in the checksum for the current destination and `source`.
    pub fn set_checksum(&mut self, source: &Ipv6Addr) {
        if self.packet.data.len() < 4 {
            return;
        }
        self.packet.data[2] = 0;
        self.packet.data[3] = 0;
        let checksum = icmp6_checksum(source, &self.packet.target_addr, &self.packet.data);
        self.packet.data[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
}

impl Default for Icmp6Writer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::ProtocolVersion;

    fn group() -> Ipv6Addr {
        "ff05::1:3".parse().unwrap()
    }

    fn written(packet: &Icmp6Packet) -> Vec<u8> {
        let mut writer = Icmp6Writer::new();
        writer.set_packet(packet).unwrap();
        writer.packet().data().to_vec()
    }

    #[test]
    fn test_icmp6_v1_report_layout() {
        let data = written(&Icmp6Packet::V1MulticastListenerReport(V1MulticastListenerReport { group_address: group() }));
        assert_eq!(data.len(), 24);
        assert_eq!(data[0], 131);
        assert_eq!(&data[8..24], &group().octets());
    }

    #[test]
    fn test_icmp6_v2_report_layout() {
        let source: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let data = written(&Icmp6Packet::V2MulticastListenerReport(V2MulticastListenerReport {
            records: vec![MulticastReportRecord {
                record_type: 4,
                multicast_address: group(),
                source_addresses: vec![source],
            }],
        }));
        assert_eq!(data.len(), 8 + 20 + 16);
        assert_eq!(data[0], 143);
        assert_eq!(&data[6..8], &[0, 1]);
        assert_eq!(&data[8..12], &[4, 0, 0, 1]);
        assert_eq!(&data[12..28], &group().octets());
        assert_eq!(&data[28..44], &source.octets());
    }

    #[test]
    fn test_icmp6_query_versions() {
        let v1 = written(&Icmp6Packet::MulticastListenerQuery(MulticastListenerQuery {
            version: ProtocolVersion::V1,
            maximum_response_delay: 1000,
            group_address: Ipv6Addr::UNSPECIFIED,
            suppress_router_processing: false,
            qrv: 0,
            qqic: 0,
            source_addresses: vec![],
        }));
        assert_eq!(v1.len(), 24);

        let source: Ipv6Addr = "2001:db8::7".parse().unwrap();
        let v2 = written(&Icmp6Packet::MulticastListenerQuery(MulticastListenerQuery {
            version: ProtocolVersion::V2,
            maximum_response_delay: 0x8123,
            group_address: group(),
            suppress_router_processing: true,
            qrv: 2,
            qqic: 125,
            source_addresses: vec![source],
        }));
        assert_eq!(v2.len(), 44);
        assert_eq!(v2[24], 0x0a);

        match Icmp6Parser::from_bytes(&v2).parse().unwrap() {
            Icmp6Packet::MulticastListenerQuery(query) => {
                assert_eq!(query.version, ProtocolVersion::V2);
                assert_eq!(query.maximum_response_delay, 0x8123);
                assert!(query.suppress_router_processing);
                assert_eq!(query.qrv, 2);
                assert_eq!(query.source_addresses, vec![source]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_icmp6_query_bad_lengths() {
        let mut data = vec![130u8; 26];
        data[1] = 0;
        assert!(Icmp6Parser::from_bytes(&data).parse().is_err());
        assert!(Icmp6Parser::from_bytes(&data[..20]).parse().is_err());

        // advertises two sources but carries none
        let mut data = vec![0u8; 28];
        data[0] = 130;
        data[27] = 2;
        assert!(Icmp6Parser::from_bytes(&data).parse().is_err());
    }

    #[test]
    fn test_icmp6_truncated_v2_report() {
        let mut data = written(&Icmp6Packet::V2MulticastListenerReport(V2MulticastListenerReport {
            records: vec![MulticastReportRecord { record_type: 2, multicast_address: group(), source_addresses: vec![] }],
        }));
        data.truncate(20);
        assert!(Icmp6Parser::from_bytes(&data).parse().is_err());
    }

    #[test]
    fn test_icmp6_scope_checks_with_ancillary_data() {
        let data = written(&Icmp6Packet::V1MulticastListenerReport(V1MulticastListenerReport { group_address: group() }));

        let mut packet = packet::Packet::from_bytes(&data);
        packet.hop_limit = Some(packet::PacketHopLimit { hop_limit: 64 });
        assert!(Icmp6Parser::new_from_packet(packet).parse().is_err());

        let mut packet = packet::Packet::from_bytes(&data);
        packet.hop_limit = Some(packet::PacketHopLimit { hop_limit: 1 });
        packet.hop_by_hop = Some(packet::PacketHopByHop { hop_by_hop: vec![0x3a, 0, 0x01, 0x04, 0, 0, 0, 0] });
        assert!(Icmp6Parser::new_from_packet(packet).parse().is_err());

        let mut packet = packet::Packet::from_bytes(&data);
        packet.hop_limit = Some(packet::PacketHopLimit { hop_limit: 1 });
        packet.hop_by_hop = Some(packet::PacketHopByHop { hop_by_hop: mld_hop_by_hop() });
        assert!(Icmp6Parser::new_from_packet(packet).parse().is_ok());
    }

    #[test]
    fn test_icmp6_unknown_type() {
        assert_eq!(Icmp6Parser::from_bytes(&[128, 0, 0, 0, 0, 0, 0, 0]).parse().unwrap(), Icmp6Packet::Unknown(128, 0));
    }

    #[test]
    fn test_icmp6_checksum_verifies() {
        let source: Ipv6Addr = "fe80::1".parse().unwrap();
        let mut writer = Icmp6Writer::new();
        writer.set_packet(&Icmp6Packet::V1MulticastListenerDone(V1MulticastListenerDone { group_address: group() })).unwrap();
        writer.set_destination(MLD_ALL_ROUTERS);
        writer.set_checksum(&source);
        let data = writer.packet().data();
        assert_ne!(&data[2..4], &[0, 0]);
        assert_eq!(icmp6_checksum(&source, &MLD_ALL_ROUTERS, data), 0);
    }
}
