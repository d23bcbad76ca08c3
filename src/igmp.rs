
//! IGMP (RFC 1112, 2236, 3376) as an [`AddressFamily`].

use crate::error::MulticastError;
use crate::family::{AddressFamily, Igmp, Message, ProtocolVersion, Query, Record, RecordType};
use crate::util::checksum::internet_checksum;

use std::net::Ipv4Addr;
use std::time::Duration;

pub const IGMP_MEMBERSHIP_QUERY: u8 = 0x11;
pub const IGMPV1_MEMBERSHIP_REPORT: u8 = 0x12;
pub const IGMPV2_MEMBERSHIP_REPORT: u8 = 0x16;
pub const IGMPV2_LEAVE_GROUP: u8 = 0x17;
pub const IGMPV3_MEMBERSHIP_REPORT: u8 = 0x22;

pub const IGMP_MESSAGE_LEN: usize = 8;
pub const IGMPV3_QUERY_MIN_LEN: usize = 12;

pub const IGMP_ALL_SYSTEMS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
pub const IGMP_ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);
pub const IGMPV3_ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

/// IPv4 Router Alert option (RFC 2113)
pub const IGMP_ROUTER_ALERT: [u8; 4] = [0x94, 0x04, 0x00, 0x00];

/// Max Resp Code of an IGMPv3 query, in units of 1/10 second (RFC 3376 4.1.1).
pub fn decode_max_resp_code(code: u8) -> u32 {
    if code < 0x80 {
        return code as u32;
    }
    let mant = (code & 0x0f) as u32;
    let exp = ((code >> 4) & 0x07) as u32;
    (mant | 0x10) << (exp + 3)
}

fn read_addr(data: &[u8], offset: usize) -> Result<Ipv4Addr, MulticastError> {
    let octets: [u8; 4] = data.get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(MulticastError::Invalid)?;
    Ok(Ipv4Addr::from(octets))
}

fn fixed_message(igmp_type: u8, code: u8, group: &Ipv4Addr) -> Vec<u8> {
    let mut data = vec![igmp_type, code, 0, 0];
    data.extend_from_slice(&group.octets());
    data
}

fn parse_query(data: &[u8]) -> Result<Query<Igmp>, MulticastError> {
    let code = data[1];
    let group = read_addr(data, 4)?;

    if data.len() == IGMP_MESSAGE_LEN {
        let version = if code == 0 { ProtocolVersion::V1 } else { ProtocolVersion::V2 };
        return Ok(Query {
            version,
            group,
            max_response_code: code as u16,
            suppress_router_processing: false,
            qrv: 0,
            qqic: 0,
            sources: Vec::new(),
        });
    }
    if data.len() < IGMPV3_QUERY_MIN_LEN {
        log::debug!("IGMP query of {} bytes", data.len());
        return Err(MulticastError::Invalid);
    }

    let numsources = u16::from_be_bytes([data[10], data[11]]) as usize;
    let sources = (0..numsources)
        .map(|i| read_addr(data, IGMPV3_QUERY_MIN_LEN + 4 * i))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Query {
        version: ProtocolVersion::V3,
        group,
        max_response_code: code as u16,
        suppress_router_processing: data[8] & 0x08 != 0,
        qrv: data[8] & 0x07,
        qqic: data[9],
        sources,
    })
}

fn parse_v3_report(data: &[u8]) -> Result<Vec<Record<Igmp>>, MulticastError> {
    let numrecords = u16::from_be_bytes([data[6], data[7]]);
    let mut records = Vec::new();
    let mut offset = IGMP_MESSAGE_LEN;
    for _ in 0..numrecords {
        if offset + 8 > data.len() {
            return Err(MulticastError::Invalid);
        }
        let record_type = RecordType::from_u8(data[offset]).ok_or(MulticastError::Invalid)?;
        let aux_data_len = data[offset + 1] as usize * 4;
        let numsources = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let group = read_addr(data, offset + 4)?;
        let sources = (0..numsources)
            .map(|i| read_addr(data, offset + 8 + 4 * i))
            .collect::<Result<Vec<_>, _>>()?;
        records.push(Record { record_type, group, sources });
        offset += 8 + 4 * numsources + aux_data_len;
    }
    if offset > data.len() {
        return Err(MulticastError::Invalid);
    }
    Ok(records)
}

impl AddressFamily for Igmp {
    type Addr = Ipv4Addr;

    const NAME: &'static str = "IGMP";
    const UNSPECIFIED: Ipv4Addr = Ipv4Addr::UNSPECIFIED;
    const ALL_NODES: Ipv4Addr = IGMP_ALL_SYSTEMS;
    const ALL_ROUTERS: Ipv4Addr = IGMP_ALL_ROUTERS;
    const REPORT_DESTINATION: Ipv4Addr = IGMPV3_ALL_ROUTERS;
    const FULL_VERSION: ProtocolVersion = ProtocolVersion::V3;
    const OLDER_VERSIONS: &'static [ProtocolVersion] = &[ProtocolVersion::V1, ProtocolVersion::V2];

    fn is_multicast(addr: &Ipv4Addr) -> bool {
        addr.is_multicast()
    }

    fn can_participate(addr: &Ipv4Addr) -> bool {
        addr.is_multicast() && *addr != IGMP_ALL_SYSTEMS
    }

    fn is_valid_source(addr: &Ipv4Addr) -> bool {
        !addr.is_multicast() && !addr.is_broadcast()
    }

    fn min_message_len() -> usize {
        IGMP_MESSAGE_LEN
    }

    fn router_alert_option() -> Vec<u8> {
        IGMP_ROUTER_ALERT.to_vec()
    }

    fn max_response_delay(query: &Query<Self>) -> Duration {
        let tenths = match query.version {
            ProtocolVersion::V1 => 100,
            ProtocolVersion::V2 => query.max_response_code as u32,
            ProtocolVersion::V3 => decode_max_resp_code(query.max_response_code as u8),
        };
        Duration::from_millis(tenths as u64 * 100)
    }

    /// IGMPv1 has no leave message.
    fn sends_leave(version: ProtocolVersion) -> bool {
        version != ProtocolVersion::V1
    }

    fn build(message: &Message<Self>, _source: &Ipv4Addr, _destination: &Ipv4Addr) -> Result<Vec<u8>, MulticastError> {
        let mut data = match message {
            Message::Query(query) => match query.version {
                ProtocolVersion::V1 => fixed_message(IGMP_MEMBERSHIP_QUERY, 0, &query.group),
                ProtocolVersion::V2 => fixed_message(IGMP_MEMBERSHIP_QUERY, query.max_response_code as u8, &query.group),
                ProtocolVersion::V3 => {
                    let mut data = fixed_message(IGMP_MEMBERSHIP_QUERY, query.max_response_code as u8, &query.group);
                    let mut flags = query.qrv & 0x07;
                    if query.suppress_router_processing {
                        flags |= 0x08;
                    }
                    data.push(flags);
                    data.push(query.qqic);
                    data.extend_from_slice(&(query.sources.len() as u16).to_be_bytes());
                    for source in query.sources.iter() {
                        data.extend_from_slice(&source.octets());
                    }
                    data
                }
            },

            Message::Report(records) => {
                let mut data = vec![IGMPV3_MEMBERSHIP_REPORT, 0, 0, 0, 0, 0];
                data.extend_from_slice(&(records.len() as u16).to_be_bytes());
                for record in records.iter() {
                    data.push(record.record_type.to_u8());
                    data.push(0);
                    data.extend_from_slice(&(record.sources.len() as u16).to_be_bytes());
                    data.extend_from_slice(&record.group.octets());
                    for source in record.sources.iter() {
                        data.extend_from_slice(&source.octets());
                    }
                }
                data
            }

            Message::OlderReport { version: ProtocolVersion::V1, group } => fixed_message(IGMPV1_MEMBERSHIP_REPORT, 0, group),
            Message::OlderReport { version: ProtocolVersion::V2, group } => fixed_message(IGMPV2_MEMBERSHIP_REPORT, 0, group),
            Message::OlderReport { .. } => return Err(MulticastError::InvalidParameter),
            Message::Leave { group } => fixed_message(IGMPV2_LEAVE_GROUP, 0, group),
        };

        let checksum = internet_checksum(&data);
        data[2..4].copy_from_slice(&checksum.to_be_bytes());
        Ok(data)
    }

    fn parse(data: &[u8]) -> Result<Message<Self>, MulticastError> {
        if data.len() < IGMP_MESSAGE_LEN {
            return Err(MulticastError::Invalid);
        }
        if internet_checksum(data) != 0 {
            log::debug!("IGMP checksum mismatch");
            return Err(MulticastError::Invalid);
        }
        let message = match data[0] {
            IGMP_MEMBERSHIP_QUERY => Message::Query(parse_query(data)?),
            IGMPV1_MEMBERSHIP_REPORT => Message::OlderReport { version: ProtocolVersion::V1, group: read_addr(data, 4)? },
            IGMPV2_MEMBERSHIP_REPORT => Message::OlderReport { version: ProtocolVersion::V2, group: read_addr(data, 4)? },
            IGMPV2_LEAVE_GROUP => Message::Leave { group: read_addr(data, 4)? },
            IGMPV3_MEMBERSHIP_REPORT => Message::Report(parse_v3_report(data)?),
            other => {
                log::debug!("unknown IGMP type 0x{:02x}", other);
                return Err(MulticastError::Invalid);
            }
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 2, 3);

    fn build(message: &Message<Igmp>) -> Vec<u8> {
        Igmp::build(message, &Ipv4Addr::new(192, 0, 2, 1), &IGMPV3_ALL_ROUTERS).unwrap()
    }

    #[test]
    fn test_igmp_query_version_by_length() {
        let mut v1 = fixed_message(IGMP_MEMBERSHIP_QUERY, 0, &Ipv4Addr::UNSPECIFIED);
        let checksum = internet_checksum(&v1);
        v1[2..4].copy_from_slice(&checksum.to_be_bytes());
        match Igmp::parse(&v1).unwrap() {
            Message::Query(query) => {
                assert_eq!(query.version, ProtocolVersion::V1);
                assert_eq!(Igmp::max_response_delay(&query), Duration::from_secs(10));
            }
            other => panic!("unexpected {:?}", other),
        }

        let v2 = build(&Message::Query(Query {
            version: ProtocolVersion::V2,
            group: GROUP,
            max_response_code: 50,
            suppress_router_processing: false,
            qrv: 0,
            qqic: 0,
            sources: vec![],
        }));
        assert_eq!(v2.len(), 8);
        match Igmp::parse(&v2).unwrap() {
            Message::Query(query) => {
                assert_eq!(query.version, ProtocolVersion::V2);
                assert_eq!(Igmp::max_response_delay(&query), Duration::from_secs(5));
            }
            other => panic!("unexpected {:?}", other),
        }

        let source = Ipv4Addr::new(192, 0, 2, 9);
        let v3 = build(&Message::Query(Query {
            version: ProtocolVersion::V3,
            group: GROUP,
            max_response_code: 100,
            suppress_router_processing: false,
            qrv: 2,
            qqic: 125,
            sources: vec![source],
        }));
        assert_eq!(v3.len(), 16);
        match Igmp::parse(&v3).unwrap() {
            Message::Query(query) => {
                assert_eq!(query.version, ProtocolVersion::V3);
                assert_eq!(query.sources, vec![source]);
                assert_eq!(query.qrv, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_igmp_query_bad_length() {
        let mut data = vec![IGMP_MEMBERSHIP_QUERY, 10, 0, 0, 239, 1, 2, 3, 0, 0];
        let checksum = internet_checksum(&data);
        data[2..4].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(Igmp::parse(&data), Err(MulticastError::Invalid));
    }

    #[test]
    fn test_igmp_max_resp_code() {
        assert_eq!(decode_max_resp_code(100), 100);
        assert_eq!(decode_max_resp_code(0x80), 0x10 << 3);
        assert_eq!(decode_max_resp_code(0xff), 0x1f << 10);
    }

    #[test]
    fn test_igmp_v3_report() {
        let message = Message::<Igmp>::Report(vec![Record {
            record_type: RecordType::AllowNewSources,
            group: GROUP,
            sources: vec![Ipv4Addr::new(192, 0, 2, 5)],
        }]);
        let data = build(&message);
        assert_eq!(data.len(), 8 + 8 + 4);
        assert_eq!(data[0], IGMPV3_MEMBERSHIP_REPORT);
        assert_eq!(Igmp::parse(&data).unwrap(), message);
    }

    #[test]
    fn test_igmp_older_messages() {
        let v1 = build(&Message::OlderReport { version: ProtocolVersion::V1, group: GROUP });
        assert_eq!(v1[0], IGMPV1_MEMBERSHIP_REPORT);
        let v2 = build(&Message::OlderReport { version: ProtocolVersion::V2, group: GROUP });
        assert_eq!(v2[0], IGMPV2_MEMBERSHIP_REPORT);
        let leave = build(&Message::Leave { group: GROUP });
        assert_eq!(leave[0], IGMPV2_LEAVE_GROUP);
        assert_eq!(Igmp::parse(&leave).unwrap(), Message::Leave { group: GROUP });

        assert!(!Igmp::sends_leave(ProtocolVersion::V1));
        assert!(Igmp::sends_leave(ProtocolVersion::V2));
    }

    #[test]
    fn test_igmp_rejects_bad_checksum() {
        let mut data = build(&Message::Leave { group: GROUP });
        data[3] ^= 0xff;
        assert_eq!(Igmp::parse(&data), Err(MulticastError::Invalid));
    }

    #[test]
    fn test_igmp_all_systems_never_participates() {
        assert!(!Igmp::can_participate(&IGMP_ALL_SYSTEMS));
        assert!(Igmp::can_participate(&GROUP));
    }
}
