
use super::{Icmp6Packet, Icmp6Parser, Icmp6Writer};

use crate::error::MulticastError;
use crate::family::{AddressFamily, Message, Mld, ProtocolVersion, Query, Record, RecordType};

use std::net::Ipv6Addr;
use std::time::Duration;

pub const MLD_LISTENER_QUERY: u8 = 130;
pub const MLDV1_LISTENER_REPORT: u8 = 131;
pub const MLDV1_LISTENER_DONE: u8 = 132;
pub const MLDV2_LISTENER_REPORT: u8 = 143;

/// length of every MLDv1 message, and of the shortest acceptable MLD message
pub const MLDV1_MESSAGE_LEN: usize = 24;
pub const MLDV2_QUERY_MIN_LEN: usize = 28;
pub const MLDV2_QUERY_MAX_SOURCES: usize = 80;

pub const MLD_ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
pub const MLD_ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);
pub const MLDV2_ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x16);

/// Hop-by-hop header for MLD: next header ICMPv6, Router Alert (MLD), PadN.
pub fn mld_hop_by_hop() -> Vec<u8> {
    vec![super::IPPROTO_ICMPV6, 0x00, 0x05, 0x02, 0x00, 0x00, 0x01, 0x00]
}

/// Maximum Response Code of an MLDv2 query, in milliseconds (RFC 3810 5.1.3).
pub fn decode_max_response_code(code: u16) -> Duration {
    if code < 0x8000 {
        return Duration::from_millis(code as u64);
    }
    let mant = (code & 0x0fff) as u64;
    let exp = ((code >> 12) & 0x07) as u64;
    Duration::from_millis((mant | 0x1000) << (exp + 3))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastReportRecord {
    pub record_type: u8,
    pub multicast_address: Ipv6Addr,
    pub source_addresses: Vec<Ipv6Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastListenerQuery {
    /// V1 for 24-byte queries, V2 otherwise
    pub version: ProtocolVersion,
    pub maximum_response_delay: u16,
    pub group_address: Ipv6Addr,
    pub suppress_router_processing: bool,
    pub qrv: u8,
    pub qqic: u8,
    pub source_addresses: Vec<Ipv6Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1MulticastListenerReport {
    pub group_address: Ipv6Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1MulticastListenerDone {
    pub group_address: Ipv6Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2MulticastListenerReport {
    pub records: Vec<MulticastReportRecord>,
}

impl Icmp6Packet {
    pub fn from_message(message: &Message<Mld>) -> Result<Self, MulticastError> {
        let packet = match message {
            Message::Query(query) => Icmp6Packet::MulticastListenerQuery(MulticastListenerQuery {
                version: query.version,
                maximum_response_delay: query.max_response_code,
                group_address: query.group,
                suppress_router_processing: query.suppress_router_processing,
                qrv: query.qrv,
                qqic: query.qqic,
                source_addresses: query.sources.clone(),
            }),
            Message::Report(records) => Icmp6Packet::V2MulticastListenerReport(V2MulticastListenerReport {
                records: records.iter().map(|record| MulticastReportRecord {
                    record_type: record.record_type.to_u8(),
                    multicast_address: record.group,
                    source_addresses: record.sources.clone(),
                }).collect(),
            }),
            Message::OlderReport { version: ProtocolVersion::V1, group } => {
                Icmp6Packet::V1MulticastListenerReport(V1MulticastListenerReport { group_address: *group })
            }
            Message::OlderReport { .. } => return Err(MulticastError::InvalidParameter),
            Message::Leave { group } => {
                Icmp6Packet::V1MulticastListenerDone(V1MulticastListenerDone { group_address: *group })
            }
        };
        Ok(packet)
    }

    pub fn into_message(self) -> Result<Message<Mld>, MulticastError> {
        let message = match self {
            Icmp6Packet::MulticastListenerQuery(query) => Message::Query(Query {
                version: query.version,
                group: query.group_address,
                max_response_code: query.maximum_response_delay,
                suppress_router_processing: query.suppress_router_processing,
                qrv: query.qrv,
                qqic: query.qqic,
                sources: query.source_addresses,
            }),
            Icmp6Packet::V1MulticastListenerReport(report) => Message::OlderReport {
                version: ProtocolVersion::V1,
                group: report.group_address,
            },
            Icmp6Packet::V1MulticastListenerDone(done) => Message::Leave { group: done.group_address },
            Icmp6Packet::V2MulticastListenerReport(report) => {
                let mut records = Vec::with_capacity(report.records.len());
                for record in report.records {
                    let record_type = RecordType::from_u8(record.record_type).ok_or(MulticastError::Invalid)?;
                    records.push(Record {
                        record_type,
                        group: record.multicast_address,
                        sources: record.source_addresses,
                    });
                }
                Message::Report(records)
            }
            Icmp6Packet::Unknown(..) => return Err(MulticastError::Invalid),
        };
        Ok(message)
    }
}

impl AddressFamily for Mld {
    type Addr = Ipv6Addr;

    const NAME: &'static str = "MLD";
    const UNSPECIFIED: Ipv6Addr = Ipv6Addr::UNSPECIFIED;
    const ALL_NODES: Ipv6Addr = MLD_ALL_NODES;
    const ALL_ROUTERS: Ipv6Addr = MLD_ALL_ROUTERS;
    const REPORT_DESTINATION: Ipv6Addr = MLDV2_ALL_ROUTERS;
    const FULL_VERSION: ProtocolVersion = ProtocolVersion::V2;
    const OLDER_VERSIONS: &'static [ProtocolVersion] = &[ProtocolVersion::V1];

    fn is_multicast(addr: &Ipv6Addr) -> bool {
        addr.is_multicast()
    }

    fn can_participate(addr: &Ipv6Addr) -> bool {
        // reserved and interface-local scopes
        let scope = addr.segments()[0] & 0x000f;
        scope > 1
    }

    fn is_valid_source(addr: &Ipv6Addr) -> bool {
        addr.segments()[0] & 0xffc0 == 0xfe80
    }

    fn min_message_len() -> usize {
        MLDV1_MESSAGE_LEN
    }

    fn router_alert_option() -> Vec<u8> {
        mld_hop_by_hop()
    }

    fn max_response_delay(query: &Query<Self>) -> Duration {
        match query.version {
            ProtocolVersion::V1 => Duration::from_millis(query.max_response_code as u64),
            _ => decode_max_response_code(query.max_response_code),
        }
    }

    fn build(message: &Message<Self>, source: &Ipv6Addr, destination: &Ipv6Addr) -> Result<Vec<u8>, MulticastError> {
        let packet = Icmp6Packet::from_message(message)?;
        let mut writer = Icmp6Writer::new();
        writer.set_packet(&packet)?;
        writer.set_destination(*destination);
        writer.set_checksum(source);
        Ok(writer.packet().data().to_vec())
    }

    fn parse(data: &[u8]) -> Result<Message<Self>, MulticastError> {
        let packet = Icmp6Parser::from_bytes(data).parse().map_err(|e| {
            log::debug!("MLD parse error: {}", e);
            MulticastError::Invalid
        })?;
        packet.into_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> Ipv6Addr {
        "ff05::1:3".parse().unwrap()
    }

    #[test]
    fn test_mld_max_response_code() {
        assert_eq!(decode_max_response_code(0), Duration::ZERO);
        assert_eq!(decode_max_response_code(10000), Duration::from_millis(10000));
        assert_eq!(decode_max_response_code(0x7fff), Duration::from_millis(0x7fff));
        // exp 0, mant 0: 0x1000 << 3
        assert_eq!(decode_max_response_code(0x8000), Duration::from_millis(32768));
        assert_eq!(decode_max_response_code(0xffff), Duration::from_millis(0x1fff << 10));
    }

    #[test]
    fn test_mld_max_response_delay_by_version() {
        let mut query = Query::<Mld> {
            version: ProtocolVersion::V1,
            group: Ipv6Addr::UNSPECIFIED,
            max_response_code: 0x8000,
            suppress_router_processing: false,
            qrv: 0,
            qqic: 0,
            sources: vec![],
        };
        assert_eq!(Mld::max_response_delay(&query), Duration::from_millis(0x8000));
        query.version = ProtocolVersion::V2;
        assert_eq!(Mld::max_response_delay(&query), Duration::from_millis(32768));
    }

    #[test]
    fn test_mld_address_checks() {
        assert!(Mld::can_participate(&group()));
        assert!(Mld::can_participate(&"ff02::1:ff00:1".parse().unwrap()));
        assert!(!Mld::can_participate(&"ff01::5".parse().unwrap()));
        assert!(!Mld::can_participate(&"ff00::5".parse().unwrap()));

        assert!(Mld::is_valid_source(&"fe80::1".parse().unwrap()));
        assert!(!Mld::is_valid_source(&"2001:db8::1".parse().unwrap()));
        assert!(!Mld::is_valid_source(&Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn test_mld_build_report_checksum() {
        let source: Ipv6Addr = "fe80::1".parse().unwrap();
        let message = Message::<Mld>::Report(vec![Record {
            record_type: RecordType::ChangeToExclude,
            group: group(),
            sources: vec![],
        }]);
        let data = Mld::build(&message, &source, &MLDV2_ALL_ROUTERS).unwrap();
        assert_eq!(data.len(), 28);
        assert_eq!(super::super::icmp6_checksum(&source, &MLDV2_ALL_ROUTERS, &data), 0);
        assert_eq!(Mld::parse(&data).unwrap(), message);
    }

    #[test]
    fn test_mld_build_done_and_v1_report() {
        let source: Ipv6Addr = "fe80::1".parse().unwrap();
        let done = Mld::build(&Message::Leave { group: group() }, &source, &MLD_ALL_ROUTERS).unwrap();
        assert_eq!(done[0], MLDV1_LISTENER_DONE);

        let report = Message::OlderReport { version: ProtocolVersion::V1, group: group() };
        let data = Mld::build(&report, &source, &group()).unwrap();
        assert_eq!(data[0], MLDV1_LISTENER_REPORT);
        assert_eq!(Mld::parse(&data).unwrap(), report);

        let bogus = Message::<Mld>::OlderReport { version: ProtocolVersion::V2, group: group() };
        assert_eq!(Mld::build(&bogus, &source, &group()), Err(MulticastError::InvalidParameter));
    }

    #[test]
    fn test_mld_parse_rejects_bad_record_type() {
        let mut data = vec![143, 0, 0, 0, 0, 0, 0, 1, 9, 0, 0, 0];
        data.extend_from_slice(&group().octets());
        assert_eq!(Mld::parse(&data), Err(MulticastError::Invalid));
    }
}
