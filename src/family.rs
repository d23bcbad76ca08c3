
use crate::error::MulticastError;

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::time::Duration;

/// Protocol version spoken on a link.
///
/// MLD uses `V1` and `V2`; IGMP uses all three. Ordering follows age, so the
/// effective compatibility mode is the minimum of everything observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    V1,
    V2,
    V3,
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolVersion::V1 => write!(f, "v1"),
            ProtocolVersion::V2 => write!(f, "v2"),
            ProtocolVersion::V3 => write!(f, "v3"),
        }
    }
}

/// Group record type carried in MLDv2 / IGMPv3 reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    ModeIsInclude,
    ModeIsExclude,
    ChangeToInclude,
    ChangeToExclude,
    AllowNewSources,
    BlockOldSources,
}

impl RecordType {
    pub fn to_u8(self) -> u8 {
        match self {
            RecordType::ModeIsInclude => 1,
            RecordType::ModeIsExclude => 2,
            RecordType::ChangeToInclude => 3,
            RecordType::ChangeToExclude => 4,
            RecordType::AllowNewSources => 5,
            RecordType::BlockOldSources => 6,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::ModeIsInclude),
            2 => Some(RecordType::ModeIsExclude),
            3 => Some(RecordType::ChangeToInclude),
            4 => Some(RecordType::ChangeToExclude),
            5 => Some(RecordType::AllowNewSources),
            6 => Some(RecordType::BlockOldSources),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<F: AddressFamily> {
    /// version inferred from the message length
    pub version: ProtocolVersion,
    pub group: F::Addr,
    pub max_response_code: u16,
    pub suppress_router_processing: bool,
    pub qrv: u8,
    pub qqic: u8,
    pub sources: Vec<F::Addr>,
}

impl<F: AddressFamily> Query<F> {
    pub fn is_general(&self) -> bool {
        self.group == F::UNSPECIFIED
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<F: AddressFamily> {
    pub record_type: RecordType,
    pub group: F::Addr,
    pub sources: Vec<F::Addr>,
}

/// Decoded membership message, independent of the address family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<F: AddressFamily> {
    Query(Query<F>),

    /// current-version report (MLDv2 / IGMPv3)
    Report(Vec<Record<F>>),

    /// single-group report from an older protocol version
    OlderReport { version: ProtocolVersion, group: F::Addr },

    /// MLDv1 Done / IGMPv2 Leave
    Leave { group: F::Addr },
}

impl<F: AddressFamily> Message<F> {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Query(_) => "query",
            Message::Report(_) => "report",
            Message::OlderReport { .. } => "older report",
            Message::Leave { .. } => "leave",
        }
    }
}

/// Everything the shared engine needs to know about one membership protocol.
pub trait AddressFamily: Debug + Clone + PartialEq + Eq + Send + Sync + Sized + 'static {
    type Addr: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static;

    const NAME: &'static str;
    const UNSPECIFIED: Self::Addr;

    /// link-scope all-nodes group; joined implicitly, never reported
    const ALL_NODES: Self::Addr;

    /// destination of Done / Leave
    const ALL_ROUTERS: Self::Addr;

    /// destination of current-version reports
    const REPORT_DESTINATION: Self::Addr;

    const FULL_VERSION: ProtocolVersion;

    /// versions for which an older-version-querier guard timer exists
    const OLDER_VERSIONS: &'static [ProtocolVersion];

    fn is_multicast(addr: &Self::Addr) -> bool;

    /// Groups with node-local scope never take part in the protocol.
    fn can_participate(addr: &Self::Addr) -> bool;

    /// Inbound messages must come from an address passing this check.
    fn is_valid_source(addr: &Self::Addr) -> bool;

    /// Minimum length of an acceptable inbound message.
    fn min_message_len() -> usize;

    /// Router Alert option bytes the IP layer must carry in front of the message.
    fn router_alert_option() -> Vec<u8>;

    /// Decode the maximum response delay advertised by a query.
    fn max_response_delay(query: &Query<Self>) -> Duration;

    /// Whether a leave message exists in the given compatibility mode.
    fn sends_leave(version: ProtocolVersion) -> bool {
        let _ = version;
        true
    }

    /// Serialize a message, including its checksum.
    fn build(message: &Message<Self>, source: &Self::Addr, destination: &Self::Addr) -> Result<Vec<u8>, MulticastError>;

    fn parse(data: &[u8]) -> Result<Message<Self>, MulticastError>;
}

/// MLD over ICMPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mld;

/// IGMP over IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Igmp;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_codes() {
        for value in 1..=6u8 {
            let record_type = RecordType::from_u8(value).unwrap();
            assert_eq!(record_type.to_u8(), value);
        }
        assert_eq!(RecordType::from_u8(0), None);
        assert_eq!(RecordType::from_u8(7), None);
    }

    #[test]
    fn test_protocol_version_order() {
        assert!(ProtocolVersion::V1 < ProtocolVersion::V2);
        assert!(ProtocolVersion::V2 < ProtocolVersion::V3);
        assert_eq!(std::cmp::min(ProtocolVersion::V3, ProtocolVersion::V1), ProtocolVersion::V1);
    }
}
