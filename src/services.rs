
use crate::error::MulticastError;
use crate::family::AddressFamily;
use crate::interface::InterfaceId;
use crate::timer::TimerQueue;

/// A fully built membership message ready for IP output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket<F: AddressFamily> {
    pub interface: InterfaceId,
    pub source: F::Addr,
    pub destination: F::Addr,
    pub hop_limit: u8,
    pub loopback: bool,

    /// Router Alert option (IPv6 hop-by-hop header or IPv4 option)
    pub options: Vec<u8>,

    pub payload: Vec<u8>,
}

pub trait IpOutput<F: AddressFamily> {
    fn send(&mut self, packet: OutgoingPacket<F>) -> Result<(), MulticastError>;

    /// Source address used for membership messages on `interface`.
    fn link_local_addr(&self, interface: InterfaceId) -> Option<F::Addr>;
}

/// Hardware reception filter of the device.
pub trait DeviceDriver<F: AddressFamily> {
    fn add_multi(&mut self, interface: InterfaceId, group: &F::Addr) -> Result<(), MulticastError>;
    fn del_multi(&mut self, interface: InterfaceId, group: &F::Addr) -> Result<(), MulticastError>;
}

/// Host routes installed for joined groups.
pub trait RouteTable<F: AddressFamily> {
    fn add_host_route(&mut self, interface: InterfaceId, group: &F::Addr) -> Result<(), MulticastError>;
    fn delete_host_route(&mut self, interface: InterfaceId, group: &F::Addr) -> Result<(), MulticastError>;
}

/// Everything the stack consumes from its environment.
pub trait Services<F: AddressFamily>: IpOutput<F> + DeviceDriver<F> + RouteTable<F> + TimerQueue {}

impl<F, T> Services<F> for T
where
    F: AddressFamily,
    T: IpOutput<F> + DeviceDriver<F> + RouteTable<F> + TimerQueue,
{}
