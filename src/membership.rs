
use crate::error::MulticastError;
use crate::family::AddressFamily;
use crate::filter::{FilterMode, SocketMembership};
use crate::gmp::InterfaceState;
use crate::group::{GroupHandle, GroupRecord};
use crate::interface::InterfaceId;
use crate::services::Services;
use crate::srcset::SourceList;
use crate::stack::MulticastStack;

use parking_lot::Mutex;

use std::collections::HashMap;
use std::sync::Arc;

/// Number of group memberships a single socket may hold.
pub const MAX_MEMBERSHIPS: usize = 10;

/// Identifies a socket registered with a [`MulticastStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(pub u32);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// One (interface, group) membership held by a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEntry<A> {
    pub interface: InterfaceId,
    pub group: A,
    pub mode: FilterMode,
    pub sources: SourceList<A>,
}

#[derive(Debug)]
pub(crate) struct SocketTable<A> {
    sockets: HashMap<SocketId, Vec<MembershipEntry<A>>>,
    next_id: u32,
}

impl<A: Copy + Eq> SocketTable<A> {
    pub(crate) fn new() -> Self {
        Self { sockets: HashMap::new(), next_id: 1 }
    }

    fn register(&mut self) -> SocketId {
        while self.sockets.contains_key(&SocketId(self.next_id)) || self.next_id == 0 {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = SocketId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.sockets.insert(id, Vec::new());
        id
    }

    /// Drops every membership on `interface`, for all sockets.
    pub(crate) fn forget_interface(&mut self, interface: InterfaceId) {
        for entries in self.sockets.values_mut() {
            entries.retain(|entry| entry.interface != interface);
        }
    }

    /// Records the requested state for (interface, group) before the group
    /// itself is touched, returning what it replaced.
    fn reserve(&mut self, socket: SocketId, entry: MembershipEntry<A>) -> Result<ListenOp<A>, MulticastError> {
        let entries = self.sockets.get_mut(&socket).ok_or(MulticastError::NoSocket)?;
        let existing = entries.iter().position(|e| e.interface == entry.interface && e.group == entry.group);
        let leaving = entry.mode == FilterMode::Include && entry.sources.is_empty();
        match (existing, leaving) {
            (None, true) => Err(MulticastError::NotAGroupMember),
            (None, false) if entries.len() >= MAX_MEMBERSHIPS => Err(MulticastError::TooManyGroupMembers),
            (None, false) => {
                entries.push(entry);
                Ok(ListenOp::Join)
            }
            (Some(index), true) => Ok(ListenOp::Leave(entries.remove(index))),
            (Some(index), false) => Ok(ListenOp::Change(std::mem::replace(&mut entries[index], entry))),
        }
    }

    /// Undoes [`Self::reserve`] after the group refused the request.
    fn restore(&mut self, socket: SocketId, interface: InterfaceId, group: A, op: ListenOp<A>) {
        let entries = match self.sockets.get_mut(&socket) {
            Some(entries) => entries,
            None => return,
        };
        let existing = entries.iter().position(|e| e.interface == interface && e.group == group);
        match (op, existing) {
            (ListenOp::Join, Some(index)) => {
                entries.remove(index);
            }
            (ListenOp::Change(previous), Some(index)) => entries[index] = previous,
            (ListenOp::Leave(previous), None) => entries.push(previous),
            _ => {}
        }
    }
}

enum ListenOp<A> {
    Join,
    Change(MembershipEntry<A>),
    Leave(MembershipEntry<A>),
}

impl<F: AddressFamily> MulticastStack<F> {
    pub fn register_socket(&self) -> SocketId {
        self.sockets.lock().register()
    }

    /// Drops every membership the socket holds, then forgets the socket.
    pub fn close_socket<S: Services<F>>(&self, ctx: &mut S, socket: SocketId) -> Result<(), MulticastError> {
        let entries = self.sockets.lock().sockets.remove(&socket).ok_or(MulticastError::NoSocket)?;
        for entry in entries {
            let state = match self.interface(entry.interface) {
                Some(state) => state,
                None => continue,
            };
            if let Err(e) = self.leave_group(ctx, &state, entry.interface, socket, &entry.group) {
                log::warn!("{}: {} failed to leave {}: {}", entry.interface, socket, entry.group, e);
            }
        }
        Ok(())
    }

    pub fn memberships(&self, socket: SocketId) -> Option<Vec<MembershipEntry<F::Addr>>> {
        self.sockets.lock().sockets.get(&socket).cloned()
    }

    /// Sets the reception state of `socket` for `group` on `interface`.
    ///
    /// INCLUDE with no sources leaves the group; anything else joins it or
    /// replaces the socket's previous filter. Failures leave every table as
    /// it was.
    ///
    /// The socket table is locked only to reserve and to roll back; the
    /// group update and its driver, route and timer calls run unlocked.
    pub fn process_multicast_listen<S: Services<F>>(&self, ctx: &mut S, socket: SocketId, interface: InterfaceId, group: F::Addr, mode: FilterMode, sources: &[F::Addr]) -> Result<(), MulticastError> {
        if !F::is_multicast(&group) {
            return Err(MulticastError::InvalidParameter);
        }
        let sources = SourceList::from_slice(sources).inspect_err(|_| {
            log::info!("{}: {} requested too many sources for {}", interface, socket, group);
        })?;

        let (state, op) = {
            let mut sockets = self.sockets.lock();
            if !sockets.sockets.contains_key(&socket) {
                return Err(MulticastError::NoSocket);
            }
            let state = self.interface(interface).ok_or(MulticastError::NoSuchInterface)?;
            let entry = MembershipEntry { interface, group, mode, sources: sources.clone() };
            let op = sockets.reserve(socket, entry).inspect_err(|e| {
                if *e == MulticastError::TooManyGroupMembers {
                    log::info!("{}: {} membership table full", interface, socket);
                }
            })?;
            (state, op)
        };

        let result = match &op {
            ListenOp::Join => {
                let membership = SocketMembership { socket, mode, sources };
                self.join_group(ctx, &state, interface, &group, membership).map(|_| ())
            }
            ListenOp::Change(_) => self.change_group(ctx, &state, interface, socket, &group, mode, sources),
            ListenOp::Leave(_) => self.leave_group(ctx, &state, interface, socket, &group),
        };
        if result.is_err() {
            self.sockets.lock().restore(socket, interface, group, op);
        }
        result
    }

    /// Any-source join.
    pub fn join<S: Services<F>>(&self, ctx: &mut S, socket: SocketId, interface: InterfaceId, group: F::Addr) -> Result<(), MulticastError> {
        self.process_multicast_listen(ctx, socket, interface, group, FilterMode::Exclude, &[])
    }

    pub fn leave<S: Services<F>>(&self, ctx: &mut S, socket: SocketId, interface: InterfaceId, group: F::Addr) -> Result<(), MulticastError> {
        self.process_multicast_listen(ctx, socket, interface, group, FilterMode::Include, &[])
    }

    /// Like [`Self::process_multicast_listen`], but refuses to create a new membership.
    pub fn change_filter<S: Services<F>>(&self, ctx: &mut S, socket: SocketId, interface: InterfaceId, group: F::Addr, mode: FilterMode, sources: &[F::Addr]) -> Result<(), MulticastError> {
        let member = self.memberships(socket)
            .ok_or(MulticastError::NoSocket)?
            .iter()
            .any(|entry| entry.interface == interface && entry.group == group);
        if !member {
            return Err(MulticastError::NotAGroupMember);
        }
        self.process_multicast_listen(ctx, socket, interface, group, mode, sources)
    }

    fn join_group<S: Services<F>>(&self, ctx: &mut S, state: &Arc<Mutex<InterfaceState<F>>>, interface: InterfaceId, group: &F::Addr, membership: SocketMembership<F::Addr>) -> Result<GroupHandle, MulticastError> {
        let now = ctx.now();

        let mut guard = state.lock();
        if let Some(handle) = guard.groups.find(group) {
            let record = guard.groups.get_mut(handle).ok_or(MulticastError::Invalid)?;
            let changes = record.filter.join(membership)?;
            guard.groups.acquire(handle);
            let actions = guard.filter_changed(handle, changes, now, &mut *self.rng());
            drop(guard);
            self.run_actions(ctx, interface, actions);
            return Ok(handle);
        }
        drop(guard);

        let mut record = GroupRecord::<F>::new(*group);
        let changes = record.filter.join(membership)?;

        ctx.add_multi(interface, group).inspect_err(|e| {
            log::error!("{}: failed to add {} to device filter: {}", interface, group, e);
        }).map_err(|_| MulticastError::DriverFailure)?;
        if let Err(e) = ctx.add_host_route(interface, group) {
            log::error!("{}: failed to add route for {}: {}", interface, group, e);
            if let Err(e) = ctx.del_multi(interface, group) {
                log::warn!("{}: failed to remove {} from device filter: {}", interface, group, e);
            }
            return Err(MulticastError::RouteFailure);
        }

        let mut guard = state.lock();
        let handle = guard.groups.insert(record);
        guard.groups.acquire(handle);
        log::info!("{}: joined {}", interface, group);
        let actions = guard.start_listening(handle, changes, now, &mut *self.rng());
        drop(guard);
        self.run_actions(ctx, interface, actions);
        Ok(handle)
    }

    #[allow(clippy::too_many_arguments)]
    fn change_group<S: Services<F>>(&self, ctx: &mut S, state: &Arc<Mutex<InterfaceState<F>>>, interface: InterfaceId, socket: SocketId, group: &F::Addr, mode: FilterMode, sources: SourceList<F::Addr>) -> Result<(), MulticastError> {
        let now = ctx.now();
        let mut guard = state.lock();
        let handle = guard.groups.find(group).ok_or(MulticastError::NotAGroupMember)?;
        let record = guard.groups.get_mut(handle).ok_or(MulticastError::NotAGroupMember)?;
        let changes = record.filter.update(socket, mode, sources)?;
        let actions = guard.filter_changed(handle, changes, now, &mut *self.rng());
        drop(guard);
        self.run_actions(ctx, interface, actions);
        Ok(())
    }

    fn leave_group<S: Services<F>>(&self, ctx: &mut S, state: &Arc<Mutex<InterfaceState<F>>>, interface: InterfaceId, socket: SocketId, group: &F::Addr) -> Result<(), MulticastError> {
        let now = ctx.now();
        let mut guard = state.lock();
        let handle = guard.groups.find(group).ok_or(MulticastError::NotAGroupMember)?;
        let record = guard.groups.get_mut(handle).ok_or(MulticastError::NotAGroupMember)?;
        let changes = record.filter.leave(socket)?;

        if guard.groups.release(handle).unwrap_or(0) > 0 {
            let actions = guard.filter_changed(handle, changes, now, &mut *self.rng());
            drop(guard);
            self.run_actions(ctx, interface, actions);
            return Ok(());
        }

        // last reference: TO_IN {} once, then Done/Leave if the mode calls for it
        let mut actions = guard.report_changes(handle, &changes);
        actions.extend(guard.stop_listening(handle));
        guard.groups.remove(handle);
        drop(guard);
        log::info!("{}: left {}", interface, group);
        self.run_actions(ctx, interface, actions);

        if let Err(e) = ctx.delete_host_route(interface, group) {
            log::warn!("{}: failed to delete route for {}: {}", interface, group, e);
        }
        if let Err(e) = ctx.del_multi(interface, group) {
            log::warn!("{}: failed to remove {} from device filter: {}", interface, group, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::family::{Message, Mld, Record, RecordType};
    use crate::group::ListenerState;
    use crate::services::{DeviceDriver, IpOutput, OutgoingPacket, RouteTable};
    use crate::srcset::MAX_SOURCES;
    use crate::testutil::{FakeServices, IFACE};
    use crate::timer::{TimerEvent, TimerId, TimerQueue};

    use std::net::Ipv6Addr;
    use std::time::{Duration, Instant};

    const GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x99);
    const SRC_X: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x10);

    fn stack() -> MulticastStack<Mld> {
        let stack = MulticastStack::with_seed(ProtocolConfig::mld_default(), 11);
        stack.add_interface(IFACE);
        stack
    }

    fn record(record_type: RecordType, sources: &[Ipv6Addr]) -> Message<Mld> {
        Message::Report(vec![Record { record_type, group: GROUP, sources: sources.to_vec() }])
    }

    fn group_count(stack: &MulticastStack<Mld>) -> usize {
        stack.groups(IFACE).unwrap().len()
    }

    fn sources(first: u16) -> Vec<Ipv6Addr> {
        (first..first + MAX_SOURCES as u16).map(|i| Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, i)).collect()
    }

    /// Counts service calls made while the socket table is locked.
    struct LockedCalls<'a> {
        inner: FakeServices<Mld>,
        stack: &'a MulticastStack<Mld>,
        locked: usize,
    }

    impl LockedCalls<'_> {
        fn check(&mut self) {
            if self.stack.sockets.try_lock().is_none() {
                self.locked += 1;
            }
        }
    }

    impl IpOutput<Mld> for LockedCalls<'_> {
        fn send(&mut self, packet: OutgoingPacket<Mld>) -> Result<(), MulticastError> {
            self.check();
            self.inner.send(packet)
        }

        fn link_local_addr(&self, interface: InterfaceId) -> Option<Ipv6Addr> {
            self.inner.link_local_addr(interface)
        }
    }

    impl DeviceDriver<Mld> for LockedCalls<'_> {
        fn add_multi(&mut self, interface: InterfaceId, group: &Ipv6Addr) -> Result<(), MulticastError> {
            self.check();
            self.inner.add_multi(interface, group)
        }

        fn del_multi(&mut self, interface: InterfaceId, group: &Ipv6Addr) -> Result<(), MulticastError> {
            self.check();
            self.inner.del_multi(interface, group)
        }
    }

    impl RouteTable<Mld> for LockedCalls<'_> {
        fn add_host_route(&mut self, interface: InterfaceId, group: &Ipv6Addr) -> Result<(), MulticastError> {
            self.check();
            self.inner.add_host_route(interface, group)
        }

        fn delete_host_route(&mut self, interface: InterfaceId, group: &Ipv6Addr) -> Result<(), MulticastError> {
            self.check();
            self.inner.delete_host_route(interface, group)
        }
    }

    impl TimerQueue for LockedCalls<'_> {
        fn now(&self) -> Instant {
            self.inner.now()
        }

        fn set_timer(&mut self, id: TimerId, delay: Duration) {
            self.check();
            self.inner.set_timer(id, delay);
        }

        fn unset_timer(&mut self, id: &TimerId) {
            self.check();
            self.inner.unset_timer(id);
        }
    }

    #[test]
    fn test_membership_two_sockets_end_to_end() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let s1 = stack.register_socket();
        let s2 = stack.register_socket();

        stack.process_multicast_listen(&mut ctx, s1, IFACE, GROUP, FilterMode::Include, &[SRC_X]).unwrap();
        assert_eq!(ctx.take_messages(), vec![record(RecordType::AllowNewSources, &[SRC_X])]);
        assert!(ctx.device_filter.contains(&(IFACE, GROUP)));
        assert!(ctx.routes.contains(&(IFACE, GROUP)));
        assert!(ctx.timers.keys().any(|id| id.event == TimerEvent::StartupReport));

        stack.join(&mut ctx, s2, IFACE, GROUP).unwrap();
        assert_eq!(ctx.take_messages(), vec![record(RecordType::ChangeToExclude, &[])]);

        // the retransmission carries the latest state
        ctx.fire_all(&stack, Duration::from_secs(11));
        assert_eq!(ctx.take_messages(), vec![record(RecordType::ChangeToExclude, &[])]);

        let snapshot = stack.groups(IFACE).unwrap();
        let entry = snapshot.iter().find(|g| g.address == GROUP).unwrap();
        assert_eq!(entry.refcount, 2);
        assert_eq!(entry.mode, FilterMode::Exclude);
        assert!(entry.sources.is_empty());
        assert_eq!(entry.state, ListenerState::Idle);

        stack.leave(&mut ctx, s2, IFACE, GROUP).unwrap();
        assert_eq!(ctx.take_messages(), vec![record(RecordType::ChangeToInclude, &[SRC_X])]);

        stack.leave(&mut ctx, s1, IFACE, GROUP).unwrap();
        assert_eq!(ctx.take_messages(), vec![record(RecordType::ChangeToInclude, &[])]);
        assert!(ctx.device_filter.is_empty());
        assert!(ctx.routes.is_empty());
        assert!(ctx.timers.is_empty());
        assert_eq!(group_count(&stack), 1);
        assert_eq!(stack.stats().out_messages, 5);
    }

    #[test]
    fn test_membership_join_then_leave_restores_state() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let socket = stack.register_socket();
        let before = stack.groups(IFACE).unwrap();

        stack.join(&mut ctx, socket, IFACE, GROUP).unwrap();
        stack.leave(&mut ctx, socket, IFACE, GROUP).unwrap();

        assert_eq!(stack.groups(IFACE).unwrap(), before);
        assert!(ctx.timers.is_empty());
        assert!(ctx.device_filter.is_empty());
        assert!(stack.memberships(socket).unwrap().is_empty());
    }

    #[test]
    fn test_membership_leave_without_join() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let socket = stack.register_socket();
        assert_eq!(stack.leave(&mut ctx, socket, IFACE, GROUP), Err(MulticastError::NotAGroupMember));
        assert_eq!(
            stack.change_filter(&mut ctx, socket, IFACE, GROUP, FilterMode::Include, &[SRC_X]),
            Err(MulticastError::NotAGroupMember),
        );
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn test_membership_rejects_bad_requests() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let socket = stack.register_socket();
        let unicast: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert_eq!(stack.join(&mut ctx, socket, IFACE, unicast), Err(MulticastError::InvalidParameter));
        assert_eq!(stack.join(&mut ctx, SocketId(999), IFACE, GROUP), Err(MulticastError::NoSocket));
        assert_eq!(stack.join(&mut ctx, socket, InterfaceId::new(77), GROUP), Err(MulticastError::NoSuchInterface));

        let sources: Vec<Ipv6Addr> = (1..=11).map(|i| Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, i)).collect();
        assert_eq!(
            stack.process_multicast_listen(&mut ctx, socket, IFACE, GROUP, FilterMode::Include, &sources),
            Err(MulticastError::TooManySourceAddresses),
        );
        assert_eq!(group_count(&stack), 1);
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn test_membership_table_full() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let socket = stack.register_socket();
        for i in 0..MAX_MEMBERSHIPS as u16 {
            stack.join(&mut ctx, socket, IFACE, Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0x100 + i)).unwrap();
        }
        let extra = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0x200);
        assert_eq!(stack.join(&mut ctx, socket, IFACE, extra), Err(MulticastError::TooManyGroupMembers));
        assert!(!ctx.device_filter.contains(&(IFACE, extra)));

        // freeing one slot makes room again
        stack.leave(&mut ctx, socket, IFACE, Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0x100)).unwrap();
        stack.join(&mut ctx, socket, IFACE, extra).unwrap();
        assert_eq!(stack.memberships(socket).unwrap().len(), MAX_MEMBERSHIPS);
    }

    #[test]
    fn test_membership_driver_failure_rolls_back() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let socket = stack.register_socket();
        ctx.fail_add_multi = true;
        assert_eq!(stack.join(&mut ctx, socket, IFACE, GROUP), Err(MulticastError::DriverFailure));
        assert_eq!(group_count(&stack), 1);
        assert!(stack.memberships(socket).unwrap().is_empty());
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn test_membership_route_failure_rolls_back() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let socket = stack.register_socket();
        ctx.fail_route = true;
        assert_eq!(stack.join(&mut ctx, socket, IFACE, GROUP), Err(MulticastError::RouteFailure));
        assert!(ctx.device_filter.is_empty());
        assert_eq!(group_count(&stack), 1);
        assert!(stack.memberships(socket).unwrap().is_empty());
    }

    #[test]
    fn test_membership_change_filter_reports_difference() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let socket = stack.register_socket();
        let src_y: Ipv6Addr = "2001:db8::20".parse().unwrap();

        stack.process_multicast_listen(&mut ctx, socket, IFACE, GROUP, FilterMode::Include, &[SRC_X]).unwrap();
        ctx.fire_all(&stack, Duration::from_secs(11));
        ctx.take_sent();

        stack.change_filter(&mut ctx, socket, IFACE, GROUP, FilterMode::Include, &[src_y]).unwrap();
        assert_eq!(ctx.take_messages(), vec![
            record(RecordType::AllowNewSources, &[src_y]),
            record(RecordType::BlockOldSources, &[SRC_X]),
        ]);
        let entries = stack.memberships(socket).unwrap();
        assert_eq!(entries[0].sources.as_slice(), &[src_y]);

        // same filter again: nothing to report
        ctx.fire_all(&stack, Duration::from_secs(11));
        ctx.take_sent();
        stack.change_filter(&mut ctx, socket, IFACE, GROUP, FilterMode::Include, &[src_y]).unwrap();
        assert!(ctx.sent.is_empty());
    }

    #[test]
    fn test_membership_all_nodes_refcount() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let socket = stack.register_socket();
        stack.join(&mut ctx, socket, IFACE, Mld::ALL_NODES).unwrap();
        stack.leave(&mut ctx, socket, IFACE, Mld::ALL_NODES).unwrap();

        let snapshot = stack.groups(IFACE).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, Mld::ALL_NODES);
        assert_eq!(snapshot[0].refcount, 1);
        assert!(ctx.sent.is_empty());
        assert!(ctx.device_filter.is_empty());
    }

    #[test]
    fn test_membership_close_socket_leaves_everything() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let socket = stack.register_socket();
        let other: Ipv6Addr = "ff05::1:3".parse().unwrap();
        stack.join(&mut ctx, socket, IFACE, GROUP).unwrap();
        stack.join(&mut ctx, socket, IFACE, other).unwrap();

        stack.close_socket(&mut ctx, socket).unwrap();
        assert_eq!(group_count(&stack), 1);
        assert!(ctx.device_filter.is_empty());
        assert!(stack.memberships(socket).is_none());
        assert_eq!(stack.close_socket(&mut ctx, socket), Err(MulticastError::NoSocket));
    }

    #[test]
    fn test_membership_leave_after_include_overflow_frees_group() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let s1 = stack.register_socket();
        let s2 = stack.register_socket();
        let s3 = stack.register_socket();

        stack.process_multicast_listen(&mut ctx, s1, IFACE, GROUP, FilterMode::Include, &sources(0x100)).unwrap();
        stack.join(&mut ctx, s2, IFACE, GROUP).unwrap();
        stack.process_multicast_listen(&mut ctx, s3, IFACE, GROUP, FilterMode::Include, &sources(0x200)).unwrap();

        // the remaining INCLUDE lists do not fit together; s2 still gets out
        stack.close_socket(&mut ctx, s2).unwrap();
        let snapshot = stack.groups(IFACE).unwrap();
        let entry = snapshot.iter().find(|g| g.address == GROUP).unwrap();
        assert_eq!(entry.refcount, 2);
        assert_eq!(entry.mode, FilterMode::Exclude);

        stack.leave(&mut ctx, s1, IFACE, GROUP).unwrap();
        stack.leave(&mut ctx, s3, IFACE, GROUP).unwrap();
        assert_eq!(group_count(&stack), 1);
        assert!(ctx.device_filter.is_empty());
        assert!(ctx.routes.is_empty());
        assert!(ctx.timers.is_empty());
    }

    #[test]
    fn test_membership_services_run_without_socket_lock() {
        let stack = stack();
        let mut ctx = LockedCalls { inner: FakeServices::new(), stack: &stack, locked: 0 };
        let s1 = stack.register_socket();
        let s2 = stack.register_socket();

        stack.process_multicast_listen(&mut ctx, s1, IFACE, GROUP, FilterMode::Include, &[SRC_X]).unwrap();
        stack.join(&mut ctx, s2, IFACE, GROUP).unwrap();
        stack.change_filter(&mut ctx, s1, IFACE, GROUP, FilterMode::Exclude, &[SRC_X]).unwrap();
        stack.leave(&mut ctx, s1, IFACE, GROUP).unwrap();
        stack.close_socket(&mut ctx, s2).unwrap();

        assert!(!ctx.inner.sent.is_empty());
        assert!(ctx.inner.device_filter.is_empty());
        assert_eq!(ctx.locked, 0);
    }

    #[test]
    fn test_membership_failed_change_restores_entry() {
        let stack = stack();
        let mut ctx = FakeServices::<Mld>::new();
        let s1 = stack.register_socket();
        let s2 = stack.register_socket();
        stack.process_multicast_listen(&mut ctx, s1, IFACE, GROUP, FilterMode::Include, &sources(0x100)).unwrap();
        stack.process_multicast_listen(&mut ctx, s2, IFACE, GROUP, FilterMode::Include, &sources(0x100)[..1]).unwrap();
        let before = stack.memberships(s2).unwrap();

        // s1 and s2 together would need twelve sources
        let wider = sources(0x300);
        assert_eq!(
            stack.change_filter(&mut ctx, s2, IFACE, GROUP, FilterMode::Include, &wider[..2]),
            Err(MulticastError::TooManySourceAddresses),
        );
        assert_eq!(stack.memberships(s2).unwrap(), before);
    }

    #[test]
    fn test_membership_v1_mode_leave_sends_done() {
        let mut config = ProtocolConfig::mld_default();
        config.default_mode = crate::family::ProtocolVersion::V1;
        let stack = MulticastStack::<Mld>::with_seed(config, 5);
        stack.add_interface(IFACE);
        let mut ctx = FakeServices::<Mld>::new();
        let socket = stack.register_socket();

        stack.join(&mut ctx, socket, IFACE, GROUP).unwrap();
        assert_eq!(ctx.take_messages(), vec![Message::OlderReport { version: crate::family::ProtocolVersion::V1, group: GROUP }]);
        assert_eq!(ctx.sent.len(), 0);

        stack.leave(&mut ctx, socket, IFACE, GROUP).unwrap();
        assert_eq!(ctx.sent[0].destination, Mld::ALL_ROUTERS);
        assert_eq!(ctx.take_messages(), vec![Message::Leave { group: GROUP }]);
    }
}
