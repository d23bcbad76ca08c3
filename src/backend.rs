
use crate::error::MulticastError;
use crate::family::Mld;
use crate::icmp6::AsyncIcmp6Socket;
use crate::icmp6::packet::{Packet, PacketHopByHop, PacketHopLimit, PacketInfo};
use crate::interface::{InterfaceId, InterfaceStateManager};
use crate::rtnl::RtnetlinkConnection;
use crate::rtnl::route::RouteManager;
use crate::services::{DeviceDriver, IpOutput, OutgoingPacket, RouteTable};
use crate::timer::{TimerId, TimerQueue, TokioTimerQueue};

use std::future::Future;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

/// MLD services on a Linux host: a raw ICMPv6 socket for output and for the
/// device reception filter, rtnetlink for host routes, tokio for timers.
///
/// Must be driven from a multi-thread tokio runtime; route updates block the
/// calling worker.
pub struct LinuxServices {
    socket: AsyncIcmp6Socket,
    interfaces: InterfaceStateManager,
    _rtnl: RtnetlinkConnection,
    routes: RouteManager,
    timers: TokioTimerQueue,
    loopback: bool,
}

impl LinuxServices {
    /// Fired timer ids arrive on the returned channel and must be handed to
    /// [`Self::timer_fired`] before the stack sees them.
    pub async fn new(socket: AsyncIcmp6Socket, interfaces: InterfaceStateManager) -> Result<(Self, mpsc::UnboundedReceiver<TimerId>), std::io::Error> {
        let rtnl = RtnetlinkConnection::new().await?;
        let routes = rtnl.route();
        let (timers, receiver) = TokioTimerQueue::new();
        let services = Self {
            socket,
            interfaces,
            _rtnl: rtnl,
            routes,
            timers,
            loopback: false,
        };
        Ok((services, receiver))
    }

    pub fn interfaces(&self) -> &InterfaceStateManager {
        &self.interfaces
    }

    pub fn timer_fired(&mut self, id: &TimerId) {
        self.timers.fired(id);
    }

    fn block_on<T>(future: impl Future<Output = T>) -> T {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
    }
}

impl IpOutput<Mld> for LinuxServices {
    fn send(&mut self, packet: OutgoingPacket<Mld>) -> Result<(), MulticastError> {
        if packet.loopback != self.loopback {
            self.socket.get_ref().set_multicast_loop(packet.loopback).map_err(|e| {
                log::error!("failed to set multicast loopback: {}", e);
                MulticastError::OutputFailure
            })?;
            self.loopback = packet.loopback;
        }

        let mut out = Packet::from_bytes(&packet.payload);
        out.target_addr = packet.destination;
        out.info = Some(PacketInfo { addr: packet.source, if_index: packet.interface });
        out.hop_limit = Some(PacketHopLimit { hop_limit: packet.hop_limit });
        if !packet.options.is_empty() {
            out.hop_by_hop = Some(PacketHopByHop { hop_by_hop: packet.options });
        }

        self.socket.try_send(&out).map_err(|e| {
            log::error!("{}: sendmsg to {} failed: {}", packet.interface, packet.destination, e);
            MulticastError::OutputFailure
        })
    }

    fn link_local_addr(&self, interface: InterfaceId) -> Option<Ipv6Addr> {
        self.interfaces.get_link_local_addr(interface)
    }
}

impl DeviceDriver<Mld> for LinuxServices {
    fn add_multi(&mut self, interface: InterfaceId, group: &Ipv6Addr) -> Result<(), MulticastError> {
        self.socket.get_ref().join_multicast(*group, interface).map_err(|e| {
            log::error!("{}: IPV6_ADD_MEMBERSHIP {} failed: {}", interface, group, e);
            MulticastError::DriverFailure
        })
    }

    fn del_multi(&mut self, interface: InterfaceId, group: &Ipv6Addr) -> Result<(), MulticastError> {
        self.socket.get_ref().leave_multicast(*group, interface).map_err(|e| {
            log::error!("{}: IPV6_DROP_MEMBERSHIP {} failed: {}", interface, group, e);
            MulticastError::DriverFailure
        })
    }
}

impl RouteTable<Mld> for LinuxServices {
    fn add_host_route(&mut self, interface: InterfaceId, group: &Ipv6Addr) -> Result<(), MulticastError> {
        let routes = self.routes.clone();
        let group = *group;
        Self::block_on(async move {
            // a stale route from an earlier run would make the add fail
            let _ = routes.delete_multicast_v6(interface, group).await;
            routes.add_multicast_v6(interface, group).await
        }).map_err(|e| {
            log::error!("{}: failed to add route {}/128: {}", interface, group, e);
            MulticastError::RouteFailure
        })
    }

    fn delete_host_route(&mut self, interface: InterfaceId, group: &Ipv6Addr) -> Result<(), MulticastError> {
        let routes = self.routes.clone();
        let group = *group;
        Self::block_on(async move {
            routes.delete_multicast_v6(interface, group).await
        }).map_err(|e| {
            log::error!("{}: failed to delete route {}/128: {}", interface, group, e);
            MulticastError::RouteFailure
        })
    }
}

impl TimerQueue for LinuxServices {
    fn now(&self) -> Instant {
        self.timers.now()
    }

    fn set_timer(&mut self, id: TimerId, delay: Duration) {
        self.timers.set_timer(id, delay);
    }

    fn unset_timer(&mut self, id: &TimerId) {
        self.timers.unset_timer(id);
    }
}
