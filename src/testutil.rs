
use crate::error::MulticastError;
use crate::family::{AddressFamily, Igmp, Message, Mld};
use crate::interface::InterfaceId;
use crate::services::{DeviceDriver, IpOutput, OutgoingPacket, RouteTable};
use crate::stack::MulticastStack;
use crate::timer::{TimerId, TimerQueue};

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

pub(crate) const IFACE: InterfaceId = InterfaceId::new(1);
pub(crate) const LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0x100);
pub(crate) const LINK_LOCAL_V4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

pub(crate) trait TestFamily: AddressFamily {
    const LINK_LOCAL: Self::Addr;
}

impl TestFamily for Mld {
    const LINK_LOCAL: Ipv6Addr = LINK_LOCAL;
}

impl TestFamily for Igmp {
    const LINK_LOCAL: Ipv4Addr = LINK_LOCAL_V4;
}

/// In-memory services with a manual clock.
#[derive(Debug)]
pub(crate) struct FakeServices<F: AddressFamily> {
    pub now: Instant,
    pub sent: Vec<OutgoingPacket<F>>,
    pub timers: HashMap<TimerId, Instant>,
    pub device_filter: HashSet<(InterfaceId, F::Addr)>,
    pub routes: HashSet<(InterfaceId, F::Addr)>,
    pub link_local: HashMap<InterfaceId, F::Addr>,
    pub fail_add_multi: bool,
    pub fail_route: bool,
    pub fail_send: bool,
}

impl<F: TestFamily> FakeServices<F> {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            sent: Vec::new(),
            timers: HashMap::new(),
            device_filter: HashSet::new(),
            routes: HashSet::new(),
            link_local: HashMap::from([(IFACE, F::LINK_LOCAL)]),
            fail_add_multi: false,
            fail_route: false,
            fail_send: false,
        }
    }
}

impl<F: AddressFamily> FakeServices<F> {
    pub fn take_sent(&mut self) -> Vec<OutgoingPacket<F>> {
        std::mem::take(&mut self.sent)
    }

    pub fn sent_messages(&self) -> Vec<Message<F>> {
        self.sent.iter().map(|packet| F::parse(&packet.payload).unwrap()).collect()
    }

    pub fn take_messages(&mut self) -> Vec<Message<F>> {
        let messages = self.sent_messages();
        self.sent.clear();
        messages
    }

    /// Moves the clock forward by `delay`, firing due timers in deadline order.
    /// Timers armed by a firing timer fire too if they fall inside the window.
    pub fn fire_all(&mut self, stack: &MulticastStack<F>, delay: Duration) {
        let target = self.now + delay;
        loop {
            let next = self.timers.iter()
                .filter(|(_, deadline)| **deadline <= target)
                .min_by_key(|(id, deadline)| (**deadline, id.generation))
                .map(|(id, deadline)| (*id, *deadline));
            let (id, deadline) = match next {
                Some(next) => next,
                None => break,
            };
            self.timers.remove(&id);
            self.now = deadline;
            stack.timer_expired(self, &id);
        }
        self.now = target;
    }
}

impl<F: AddressFamily> IpOutput<F> for FakeServices<F> {
    fn send(&mut self, packet: OutgoingPacket<F>) -> Result<(), MulticastError> {
        if self.fail_send {
            return Err(MulticastError::OutputFailure);
        }
        self.sent.push(packet);
        Ok(())
    }

    fn link_local_addr(&self, interface: InterfaceId) -> Option<F::Addr> {
        self.link_local.get(&interface).copied()
    }
}

impl<F: AddressFamily> DeviceDriver<F> for FakeServices<F> {
    fn add_multi(&mut self, interface: InterfaceId, group: &F::Addr) -> Result<(), MulticastError> {
        if self.fail_add_multi {
            return Err(MulticastError::DriverFailure);
        }
        self.device_filter.insert((interface, *group));
        Ok(())
    }

    fn del_multi(&mut self, interface: InterfaceId, group: &F::Addr) -> Result<(), MulticastError> {
        self.device_filter.remove(&(interface, *group));
        Ok(())
    }
}

impl<F: AddressFamily> RouteTable<F> for FakeServices<F> {
    fn add_host_route(&mut self, interface: InterfaceId, group: &F::Addr) -> Result<(), MulticastError> {
        if self.fail_route {
            return Err(MulticastError::RouteFailure);
        }
        self.routes.insert((interface, *group));
        Ok(())
    }

    fn delete_host_route(&mut self, interface: InterfaceId, group: &F::Addr) -> Result<(), MulticastError> {
        self.routes.remove(&(interface, *group));
        Ok(())
    }
}

impl<F: AddressFamily> TimerQueue for FakeServices<F> {
    fn now(&self) -> Instant {
        self.now
    }

    fn set_timer(&mut self, id: TimerId, delay: Duration) {
        self.timers.insert(id, self.now + delay);
    }

    fn unset_timer(&mut self, id: &TimerId) {
        self.timers.remove(id);
    }
}
