
/// Status returned by the membership engine.
///
/// Resource exhaustion and validation failures are always surfaced to the
/// caller with any partial mutation already rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MulticastError {
    /// malformed request (not a multicast address, inconsistent arguments)
    InvalidParameter,

    /// no usable link-local source address on the interface
    InvalidAddress,

    /// leave or filter change for a membership the socket does not hold
    NotAGroupMember,

    /// the socket's membership table is full
    TooManyGroupMembers,

    /// a source list would exceed its fixed capacity
    TooManySourceAddresses,

    /// the outgoing message could not be built
    NoBuffers,

    /// the socket is not registered with the stack
    NoSocket,

    /// the interface is not registered with the stack
    NoSuchInterface,

    /// the device refused to update its reception filter
    DriverFailure,

    /// host route installation or removal failed
    RouteFailure,

    /// IP output refused the packet
    OutputFailure,

    /// inbound message rejected
    Invalid,
}

impl MulticastError {
    pub fn message(&self) -> &'static str {
        match self {
            MulticastError::InvalidParameter => "invalid parameter",
            MulticastError::InvalidAddress => "no link-local address available",
            MulticastError::NotAGroupMember => "not a group member",
            MulticastError::TooManyGroupMembers => "too many group memberships",
            MulticastError::TooManySourceAddresses => "too many source addresses",
            MulticastError::NoBuffers => "unable to build message",
            MulticastError::NoSocket => "no such socket",
            MulticastError::NoSuchInterface => "no such interface",
            MulticastError::DriverFailure => "device multicast filter update failed",
            MulticastError::RouteFailure => "host route update failed",
            MulticastError::OutputFailure => "packet output failed",
            MulticastError::Invalid => "invalid message",
        }
    }
}

impl std::fmt::Display for MulticastError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for MulticastError {}

impl From<crate::icmp6::Icmp6Error> for MulticastError {
    fn from(e: crate::icmp6::Icmp6Error) -> Self {
        log::debug!("message build failed: {}", e);
        MulticastError::NoBuffers
    }
}
