
use crate::config::ProtocolConfig;
use crate::error::MulticastError;
use crate::family::{AddressFamily, Message, ProtocolVersion};
use crate::filter::FilterMode;
use crate::gmp::{Action, InterfaceState};
use crate::group::{GroupHandle, ListenerState};
use crate::interface::InterfaceId;
use crate::membership::SocketTable;
use crate::services::{OutgoingPacket, Services};
use crate::timer::TimerId;

use parking_lot::{Mutex, MutexGuard, RwLock};

use rand::SeedableRng;
use rand::rngs::StdRng;

use std::collections::HashMap;
use std::sync::Arc;

/// Message counters, kept per stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub out_messages: u64,
    pub out_errors: u64,
    pub in_messages: u64,
    pub in_errors: u64,
    pub in_queries: u64,
    pub in_responses: u64,
    pub in_reductions: u64,
}

/// Diagnostic view of one group record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot<A> {
    pub address: A,
    pub refcount: usize,
    pub state: ListenerState,
    pub mode: FilterMode,
    pub sources: Vec<A>,
}

/// One membership protocol (MLD or IGMP) running on any number of interfaces.
///
/// Locks are short and never held across calls into [`Services`]: every
/// engine method returns its side effects as [`Action`]s which are carried
/// out after the interface lock is released.
pub struct MulticastStack<F: AddressFamily> {
    config: ProtocolConfig,
    interfaces: RwLock<HashMap<InterfaceId, Arc<Mutex<InterfaceState<F>>>>>,
    pub(crate) sockets: Mutex<SocketTable<F::Addr>>,
    stats: Mutex<Statistics>,
    rng: Mutex<StdRng>,
}

impl<F: AddressFamily> std::fmt::Debug for MulticastStack<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MulticastStack")
            .field("family", &F::NAME)
            .field("interfaces", &self.interfaces.read().len())
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl<F: AddressFamily> MulticastStack<F> {
    pub fn new(config: ProtocolConfig) -> Self {
        Self::from_rng(config, StdRng::from_entropy())
    }

    /// Deterministic report delays, for tests and reproducible runs.
    pub fn with_seed(config: ProtocolConfig, seed: u64) -> Self {
        Self::from_rng(config, StdRng::seed_from_u64(seed))
    }

    fn from_rng(config: ProtocolConfig, rng: StdRng) -> Self {
        Self {
            config,
            interfaces: RwLock::new(HashMap::new()),
            sockets: Mutex::new(SocketTable::new()),
            stats: Mutex::new(Statistics::default()),
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn stats(&self) -> Statistics {
        *self.stats.lock()
    }

    pub(crate) fn interface(&self, id: InterfaceId) -> Option<Arc<Mutex<InterfaceState<F>>>> {
        self.interfaces.read().get(&id).cloned()
    }

    pub fn interfaces(&self) -> Vec<InterfaceId> {
        let mut ids: Vec<_> = self.interfaces.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Brings the protocol up on an interface. The all-nodes group is joined
    /// implicitly. Adding an interface twice is a no-op.
    pub fn add_interface(&self, id: InterfaceId) {
        let mut interfaces = self.interfaces.write();
        if interfaces.contains_key(&id) {
            return;
        }
        log::info!("{}: {} enabled", id, F::NAME);
        interfaces.insert(id, Arc::new(Mutex::new(InterfaceState::new(id, self.config))));
    }

    /// Takes the protocol down on an interface: every timer is cancelled,
    /// joined groups are removed from the device and route table, and socket
    /// memberships on the interface are forgotten.
    pub fn remove_interface<S: Services<F>>(&self, ctx: &mut S, id: InterfaceId) -> Result<(), MulticastError> {
        self.sockets.lock().forget_interface(id);
        let state = self.interfaces.write().remove(&id).ok_or(MulticastError::NoSuchInterface)?;

        let (actions, groups) = {
            let mut state = state.lock();
            let groups: Vec<F::Addr> = state.groups().iter()
                .map(|(_, record)| record.addr())
                .filter(|addr| *addr != F::ALL_NODES)
                .collect();
            (state.teardown(), groups)
        };
        self.run_actions(ctx, id, actions);

        for group in groups {
            if let Err(e) = ctx.delete_host_route(id, &group) {
                log::warn!("{}: failed to delete route for {}: {}", id, group, e);
            }
            if let Err(e) = ctx.del_multi(id, &group) {
                log::warn!("{}: failed to remove {} from device filter: {}", id, group, e);
            }
        }
        log::info!("{}: {} disabled", id, F::NAME);
        Ok(())
    }

    pub fn mode(&self, id: InterfaceId) -> Option<ProtocolVersion> {
        self.interface(id).map(|state| state.lock().mode())
    }

    pub fn groups(&self, id: InterfaceId) -> Option<Vec<GroupSnapshot<F::Addr>>> {
        let state = self.interface(id)?;
        let state = state.lock();
        let snapshot = state.groups().iter().map(|(_, record)| GroupSnapshot {
            address: record.addr(),
            refcount: record.refcount(),
            state: record.state(),
            mode: record.filter().mode(),
            sources: record.filter().sources().to_vec(),
        }).collect();
        Some(snapshot)
    }

    /// Receives one membership message from `source` on `interface`.
    ///
    /// Malformed input is counted and dropped; the error returned is for
    /// diagnostics only.
    pub fn input<S: Services<F>>(&self, ctx: &mut S, interface: InterfaceId, source: &F::Addr, data: &[u8]) -> Result<(), MulticastError> {
        self.stats.lock().in_messages += 1;

        if !F::is_valid_source(source) || data.len() < F::min_message_len() {
            log::info!("{}: dropping {} message from {} ({} bytes)", interface, F::NAME, source, data.len());
            self.stats.lock().in_errors += 1;
            return Err(MulticastError::Invalid);
        }

        let message = match F::parse(data) {
            Ok(message) => message,
            Err(e) => {
                log::info!("{}: malformed {} message from {}: {}", interface, F::NAME, source, e);
                self.stats.lock().in_errors += 1;
                return Err(e);
            }
        };

        let state = self.interface(interface).ok_or(MulticastError::NoSuchInterface)?;
        log::debug!("{}: {} {} from {}", interface, F::NAME, message.name(), source);

        let actions = match &message {
            Message::Query(query) => {
                self.stats.lock().in_queries += 1;
                let now = ctx.now();
                let mut state = state.lock();
                state.query_received(query, now, &mut *self.rng())
            }
            Message::OlderReport { group, .. } => {
                self.stats.lock().in_responses += 1;
                state.lock().report_received(group)
            }
            Message::Report(_) => {
                self.stats.lock().in_responses += 1;
                Vec::new()
            }
            Message::Leave { .. } => {
                self.stats.lock().in_reductions += 1;
                Vec::new()
            }
        };
        self.run_actions(ctx, interface, actions);
        Ok(())
    }

    /// Builds and transmits one message from the interface's link-local address.
    pub fn output<S: Services<F>>(&self, ctx: &mut S, interface: InterfaceId, group: Option<GroupHandle>, message: &Message<F>, destination: &F::Addr) -> Result<(), MulticastError> {
        let result = self.transmit(ctx, interface, message, destination);
        let mut stats = self.stats.lock();
        match result {
            Ok(()) => stats.out_messages += 1,
            Err(e) => {
                stats.out_errors += 1;
                log::error!("{}: failed to send {} {} to {}: {}", interface, F::NAME, message.name(), destination, e);
                return Err(e);
            }
        }
        drop(stats);

        let is_report = matches!(message, Message::Report(_) | Message::OlderReport { .. });
        if let (true, Some(handle)) = (is_report, group) {
            if let Some(state) = self.interface(interface) {
                state.lock().mark_sent(handle);
            }
        }
        Ok(())
    }

    fn transmit<S: Services<F>>(&self, ctx: &mut S, interface: InterfaceId, message: &Message<F>, destination: &F::Addr) -> Result<(), MulticastError> {
        let source = ctx.link_local_addr(interface).ok_or(MulticastError::InvalidAddress)?;
        let payload = F::build(message, &source, destination)?;
        ctx.send(OutgoingPacket {
            interface,
            source,
            destination: *destination,
            hop_limit: 1,
            loopback: false,
            options: F::router_alert_option(),
            payload,
        })
    }

    pub fn timer_expired<S: Services<F>>(&self, ctx: &mut S, id: &TimerId) {
        let state = match self.interface(id.interface) {
            Some(state) => state,
            None => {
                log::info!("timer {:?} fired for removed interface {}", id.event, id.interface);
                return;
            }
        };
        let now = ctx.now();
        let actions = state.lock().timer_expired(id, now, &mut *self.rng());
        self.run_actions(ctx, id.interface, actions);
    }

    /// Carries out engine actions. Must be called without any interface lock held.
    pub(crate) fn run_actions<S: Services<F>>(&self, ctx: &mut S, interface: InterfaceId, actions: Vec<Action<F>>) {
        for action in actions {
            match action {
                Action::Send { group, message, destination } => {
                    let _ = self.output(ctx, interface, group, &message, &destination);
                }
                Action::SetTimer(id, delay) => ctx.set_timer(id, delay),
                Action::UnsetTimer(id) => ctx.unset_timer(&id),
            }
        }
    }

    pub(crate) fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock()
    }
}
