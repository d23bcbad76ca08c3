
//! Protocol-agnostic group membership engine.
//!
//! [`InterfaceState`] holds everything one interface knows about its groups.
//! Its methods never perform I/O: they mutate state and return the [`Action`]s
//! the caller must carry out once the interface lock has been released.

use crate::compat::{CompatState, CompatTimer};
use crate::config::ProtocolConfig;
use crate::family::{AddressFamily, Message, ProtocolVersion, Query, Record, RecordType};
use crate::filter::FilterChange;
use crate::group::{ArmedTimer, GroupArena, GroupHandle, GroupRecord, ListenerState};
use crate::interface::InterfaceId;
use crate::srcset::SourceList;
use crate::timer::{TimerEvent, TimerId};

use rand::Rng;

use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action<F: AddressFamily> {
    Send {
        /// group whose "sent last report" flag is set on success
        group: Option<GroupHandle>,
        message: Message<F>,
        destination: F::Addr,
    },
    SetTimer(TimerId, Duration),
    UnsetTimer(TimerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    General,
    AddressSpecific,
    SourceSpecific,
}

/// Uniformly random delay in `[0, max]`, millisecond granularity.
pub fn random_report_delay<R: Rng>(rng: &mut R, max: Duration) -> Duration {
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.gen_range(0..=max_ms))
}

#[derive(Debug, Clone)]
pub struct InterfaceState<F: AddressFamily> {
    pub(crate) id: InterfaceId,
    pub(crate) groups: GroupArena<F>,
    pub(crate) compat: CompatState,
    pub(crate) config: ProtocolConfig,
}

impl<F: AddressFamily> InterfaceState<F> {
    /// New interface state with the all-nodes group already joined.
    pub fn new(id: InterfaceId, config: ProtocolConfig) -> Self {
        let default_mode = std::cmp::min(config.default_mode, F::FULL_VERSION);
        let mut groups = GroupArena::new();
        let mut all_nodes = GroupRecord::new(F::ALL_NODES);
        all_nodes.refcount = 1;
        all_nodes.state = ListenerState::Idle;
        groups.insert(all_nodes);
        Self {
            id,
            groups,
            compat: CompatState::new(default_mode, F::OLDER_VERSIONS),
            config,
        }
    }

    pub fn id(&self) -> InterfaceId {
        self.id
    }

    pub fn mode(&self) -> ProtocolVersion {
        self.compat.mode()
    }

    pub fn compat(&self) -> &CompatState {
        &self.compat
    }

    pub fn groups(&self) -> &GroupArena<F> {
        &self.groups
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    fn older_mode(&self) -> bool {
        self.compat.mode() < F::FULL_VERSION
    }

    fn group_timer(&self, handle: GroupHandle, timer: &ArmedTimer) -> TimerId {
        TimerId {
            interface: self.id,
            event: timer.event,
            group: Some(handle),
            generation: timer.generation,
        }
    }

    fn compat_timer(&self, version: ProtocolVersion, generation: u64) -> TimerId {
        TimerId {
            interface: self.id,
            event: TimerEvent::OlderVersionQuerier(version),
            group: None,
            generation,
        }
    }

    /// Replaces the group's response timer with a fresh random one.
    fn arm_response<R: Rng>(&mut self, handle: GroupHandle, event: TimerEvent, max: Duration, now: Instant, rng: &mut R, actions: &mut Vec<Action<F>>) {
        let interface = self.id;
        let record = match self.groups.get_mut(handle) {
            Some(record) => record,
            None => return,
        };
        if let Some(old) = record.response_timer.take() {
            actions.push(Action::UnsetTimer(TimerId { interface, event: old.event, group: Some(handle), generation: old.generation }));
        }
        let delay = random_report_delay(rng, max);
        let generation = record.next_timer_generation();
        record.response_timer = Some(ArmedTimer { event, generation, deadline: now + delay });
        actions.push(Action::SetTimer(TimerId { interface, event, group: Some(handle), generation }, delay));
        log::debug!("{}: {} response to {:?} in {:?}", interface, record.addr, event, delay);
    }

    fn arm_startup<R: Rng>(&mut self, handle: GroupHandle, now: Instant, rng: &mut R, actions: &mut Vec<Action<F>>) {
        let interface = self.id;
        let interval = self.config.unsolicited_report_interval;
        let record = match self.groups.get_mut(handle) {
            Some(record) => record,
            None => return,
        };
        if let Some(old) = record.startup_timer.take() {
            actions.push(Action::UnsetTimer(TimerId { interface, event: old.event, group: Some(handle), generation: old.generation }));
        }
        let delay = random_report_delay(rng, interval);
        let generation = record.next_timer_generation();
        let event = TimerEvent::StartupReport;
        record.startup_timer = Some(ArmedTimer { event, generation, deadline: now + delay });
        actions.push(Action::SetTimer(TimerId { interface, event, group: Some(handle), generation }, delay));
    }

    fn report_action(&self, handle: GroupHandle, group: F::Addr, change: &FilterChange<F::Addr>) -> Action<F> {
        Action::Send {
            group: Some(handle),
            message: Message::Report(vec![Record {
                record_type: change.record_type,
                group,
                sources: change.sources.to_vec(),
            }]),
            destination: F::REPORT_DESTINATION,
        }
    }

    fn older_report_action(&self, handle: GroupHandle, group: F::Addr) -> Action<F> {
        Action::Send {
            group: Some(handle),
            message: Message::OlderReport { version: self.compat.mode(), group },
            destination: group,
        }
    }

    /// Handles an inbound query: updates the compatibility mode, then merges
    /// the query into every affected group.
    pub fn query_received<R: Rng>(&mut self, query: &Query<F>, now: Instant, rng: &mut R) -> Vec<Action<F>> {
        let mut actions = Vec::new();

        let timeout = self.config.older_version_querier_timeout();
        if let Some(CompatTimer::Arm { version, previous, generation, timeout }) = self.compat.query_received(query.version, timeout) {
            if let Some(previous) = previous {
                actions.push(Action::UnsetTimer(self.compat_timer(version, previous)));
            }
            actions.push(Action::SetTimer(self.compat_timer(version, generation), timeout));
        }

        let max_response = F::max_response_delay(query);

        if query.is_general() {
            for handle in self.groups.handles() {
                let addr = match self.groups.get(handle) {
                    Some(record) => record.addr,
                    None => continue,
                };
                if addr == F::ALL_NODES || !F::can_participate(&addr) {
                    continue;
                }
                self.update_entry(handle, QueryKind::General, max_response, &[], now, rng, &mut actions);
            }
            return actions;
        }

        if query.group == F::ALL_NODES {
            return actions;
        }

        let handle = match self.groups.find(&query.group) {
            Some(handle) => handle,
            None => {
                log::debug!("{}: query for {} which is not joined", self.id, query.group);
                return actions;
            }
        };

        let kind = if query.sources.is_empty() || self.older_mode() {
            QueryKind::AddressSpecific
        } else {
            QueryKind::SourceSpecific
        };
        self.update_entry(handle, kind, max_response, &query.sources, now, rng, &mut actions);
        actions
    }

    /// Merges one query into one group's pending response.
    pub fn update_entry<R: Rng>(&mut self, handle: GroupHandle, kind: QueryKind, max_response: Duration, queried: &[F::Addr], now: Instant, rng: &mut R, actions: &mut Vec<Action<F>>) {
        let record = match self.groups.get_mut(handle) {
            Some(record) => record,
            None => return,
        };

        // None when the accepted sources do not fit; answered with current state
        let wanted = if kind == QueryKind::SourceSpecific {
            let mut wanted = SourceList::new();
            let mut overflow = false;
            for source in queried.iter().filter(|s| record.filter.accepts(s)) {
                if wanted.insert(*source).is_err() {
                    overflow = true;
                    break;
                }
            }
            if overflow { None } else { Some(wanted) }
        } else {
            None
        };

        let state = record.state;
        match state {
            ListenerState::NonListener => {}

            ListenerState::Idle => {
                let event = match kind {
                    QueryKind::General => {
                        record.pending_sources.clear();
                        TimerEvent::GeneralQuery
                    }
                    QueryKind::AddressSpecific => {
                        record.pending_sources.clear();
                        TimerEvent::AddressSpecific
                    }
                    QueryKind::SourceSpecific => {
                        match wanted {
                            Some(wanted) if wanted.is_empty() => {
                                log::debug!("{}: no queried source of {} is accepted", self.id, record.addr);
                                return;
                            }
                            Some(wanted) => record.pending_sources = wanted,
                            None => record.pending_sources.clear(),
                        }
                        TimerEvent::AddressSpecific
                    }
                };
                record.state = ListenerState::Delaying;
                self.arm_response(handle, event, max_response, now, rng, actions);
            }

            ListenerState::Delaying => {
                let current = record.response_timer;
                let shorter = match current {
                    Some(timer) => max_response < timer.deadline.saturating_duration_since(now),
                    None => true,
                };

                match kind {
                    QueryKind::General => {
                        if shorter {
                            record.pending_sources.clear();
                            self.arm_response(handle, TimerEvent::GeneralQuery, max_response, now, rng, actions);
                        }
                    }

                    QueryKind::AddressSpecific => {
                        record.pending_sources.clear();
                        if shorter {
                            let event = match current {
                                Some(timer) if timer.event == TimerEvent::GeneralQuery => TimerEvent::GeneralQuery,
                                _ => TimerEvent::AddressSpecific,
                            };
                            self.arm_response(handle, event, max_response, now, rng, actions);
                        }
                    }

                    QueryKind::SourceSpecific => {
                        let answering_current_state = current.is_some() && record.pending_sources.is_empty();
                        if !answering_current_state {
                            match wanted {
                                Some(wanted) => {
                                    if wanted.is_empty() && current.is_none() {
                                        return;
                                    }
                                    match record.pending_sources.union(&wanted) {
                                        Ok(merged) => record.pending_sources = merged,
                                        Err(_) => record.pending_sources.clear(),
                                    }
                                }
                                None => record.pending_sources.clear(),
                            }
                        }
                        if shorter {
                            let event = current.map(|t| t.event).unwrap_or(TimerEvent::AddressSpecific);
                            self.arm_response(handle, event, max_response, now, rng, actions);
                        }
                    }
                }
            }
        }
    }

    /// Another host reported the group: our pending report is redundant.
    /// Only older-version hosts suppress; full-version reports carry
    /// per-host source state and are always sent.
    pub fn report_received(&mut self, group: &F::Addr) -> Vec<Action<F>> {
        let mut actions = Vec::new();
        let interface = self.id;
        if !self.older_mode() {
            log::debug!("{}: ignoring report for {} in {:?} mode", interface, group, self.compat.mode());
            return actions;
        }
        let handle = match self.groups.find(group) {
            Some(handle) => handle,
            None => return actions,
        };
        let record = match self.groups.get_mut(handle) {
            Some(record) => record,
            None => return actions,
        };
        if record.state != ListenerState::Delaying {
            return actions;
        }
        for timer in [record.response_timer.take(), record.startup_timer.take()].into_iter().flatten() {
            actions.push(Action::UnsetTimer(TimerId { interface, event: timer.event, group: Some(handle), generation: timer.generation }));
        }
        record.state = ListenerState::Idle;
        record.sent_last_report = false;
        record.pending_sources.clear();
        record.message_to_send.clear();
        log::debug!("{}: report for {} seen, suppressing ours", interface, group);
        actions
    }

    pub fn timer_expired<R: Rng>(&mut self, id: &TimerId, now: Instant, rng: &mut R) -> Vec<Action<F>> {
        let mut actions = Vec::new();

        if let TimerEvent::OlderVersionQuerier(version) = id.event {
            if !self.compat.timer_expired(version, id.generation) {
                log::debug!("{}: stale compatibility timer {:?}", self.id, id);
            }
            return actions;
        }

        let handle = match id.group.filter(|handle| self.groups.get(*handle).is_some()) {
            Some(handle) => handle,
            None => {
                log::info!("{}: timer {:?} fired for a group that no longer exists", self.id, id.event);
                return actions;
            }
        };

        match id.event {
            TimerEvent::GeneralQuery | TimerEvent::AddressSpecific => {
                self.response_timer_expired(handle, id, &mut actions);
            }
            TimerEvent::StartupReport => {
                self.startup_timer_expired(handle, id, now, rng, &mut actions);
            }
            TimerEvent::OlderVersionQuerier(_) => {}
        }
        actions
    }

    fn response_timer_expired(&mut self, handle: GroupHandle, id: &TimerId, actions: &mut Vec<Action<F>>) {
        let older_mode = self.older_mode();
        let interface = self.id;
        let record = match self.groups.get_mut(handle) {
            Some(record) => record,
            None => return,
        };
        match record.response_timer {
            Some(timer) if timer.generation == id.generation => {}
            _ => {
                log::debug!("{}: stale response timer for {}", interface, record.addr);
                return;
            }
        }
        record.response_timer = None;

        let group = record.addr;
        let change = if older_mode {
            None
        } else if id.event == TimerEvent::GeneralQuery || record.pending_sources.is_empty() {
            Some(record.filter.current_state())
        } else {
            let wanted = record.filter.wanted_sources(&record.pending_sources);
            if wanted.is_empty() {
                log::debug!("{}: nothing to report for {}", interface, group);
                None
            } else {
                Some(FilterChange { record_type: RecordType::ModeIsInclude, sources: wanted })
            }
        };
        record.pending_sources.clear();
        if record.startup_timer.is_none() {
            record.state = ListenerState::Idle;
        }

        if older_mode {
            actions.push(self.older_report_action(handle, group));
        } else if let Some(change) = change {
            actions.push(self.report_action(handle, group, &change));
        }
    }

    fn startup_timer_expired<R: Rng>(&mut self, handle: GroupHandle, id: &TimerId, now: Instant, rng: &mut R, actions: &mut Vec<Action<F>>) {
        let older_mode = self.older_mode();
        let robustness = self.config.robustness;
        let interface = self.id;
        let record = match self.groups.get_mut(handle) {
            Some(record) => record,
            None => return,
        };
        match record.startup_timer {
            Some(timer) if timer.generation == id.generation => {}
            _ => {
                log::debug!("{}: stale startup timer for {}", interface, record.addr);
                return;
            }
        }
        record.startup_timer = None;
        record.startup_count = record.startup_count.saturating_add(1);

        let group = record.addr;
        let changes = if record.message_to_send.is_empty() {
            vec![record.filter.current_state()]
        } else {
            record.message_to_send.clone()
        };
        let again = record.startup_count < robustness;
        if !again {
            record.message_to_send.clear();
            if record.response_timer.is_none() {
                record.state = ListenerState::Idle;
            }
        }

        if older_mode {
            actions.push(self.older_report_action(handle, group));
        } else {
            for change in changes.iter() {
                actions.push(self.report_action(handle, group, change));
            }
        }
        if again {
            self.arm_startup(handle, now, rng, actions);
        }
    }

    /// Sends the state-change report(s) immediately and schedules the
    /// retransmissions. Older compatibility modes send a plain report instead.
    pub fn start_listening<R: Rng>(&mut self, handle: GroupHandle, changes: Vec<FilterChange<F::Addr>>, now: Instant, rng: &mut R) -> Vec<Action<F>> {
        let mut actions = Vec::new();
        let older_mode = self.older_mode();
        let robustness = self.config.robustness;
        let interface = self.id;
        let record = match self.groups.get_mut(handle) {
            Some(record) => record,
            None => return actions,
        };
        let group = record.addr;

        if group == F::ALL_NODES {
            record.state = ListenerState::Idle;
            return actions;
        }
        if !F::can_participate(&group) {
            log::info!("{}: {} cannot participate in {}", interface, group, F::NAME);
            return actions;
        }
        if !older_mode && changes.is_empty() {
            return actions;
        }

        record.state = ListenerState::Delaying;
        record.startup_count = 1;
        record.message_to_send = changes.clone();
        let again = record.startup_count < robustness;
        if !again {
            record.message_to_send.clear();
            if record.response_timer.is_none() {
                record.state = ListenerState::Idle;
            }
        }

        if older_mode {
            actions.push(self.older_report_action(handle, group));
        } else {
            for change in changes.iter() {
                actions.push(self.report_action(handle, group, change));
            }
        }
        if again {
            self.arm_startup(handle, now, rng, &mut actions);
        }
        actions
    }

    /// Sends state-change records once, without retransmission.
    pub fn report_changes(&self, handle: GroupHandle, changes: &[FilterChange<F::Addr>]) -> Vec<Action<F>> {
        if self.older_mode() {
            return Vec::new();
        }
        let group = match self.groups.get(handle) {
            Some(record) => record.addr,
            None => return Vec::new(),
        };
        if group == F::ALL_NODES || !F::can_participate(&group) {
            return Vec::new();
        }
        changes.iter().map(|change| self.report_action(handle, group, change)).collect()
    }

    /// A socket changed its filter on a group that stays joined. Older modes
    /// have nothing to say about sources, and the group is already reported.
    pub fn filter_changed<R: Rng>(&mut self, handle: GroupHandle, changes: Vec<FilterChange<F::Addr>>, now: Instant, rng: &mut R) -> Vec<Action<F>> {
        if changes.is_empty() || self.older_mode() {
            return Vec::new();
        }
        self.start_listening(handle, changes, now, rng)
    }

    /// Cancels the group's timers and, in older compatibility modes, sends Done/Leave.
    pub fn stop_listening(&mut self, handle: GroupHandle) -> Vec<Action<F>> {
        let mut actions = Vec::new();
        let mode = self.compat.mode();
        let older_mode = self.older_mode();
        let optimize = self.config.optimize_done_reports;
        let interface = self.id;
        let record = match self.groups.get_mut(handle) {
            Some(record) => record,
            None => return actions,
        };

        for timer in [record.response_timer.take(), record.startup_timer.take()].into_iter().flatten() {
            actions.push(Action::UnsetTimer(TimerId { interface, event: timer.event, group: Some(handle), generation: timer.generation }));
        }
        let was_listening = record.state != ListenerState::NonListener;
        record.state = ListenerState::NonListener;
        record.pending_sources.clear();
        record.message_to_send.clear();

        let group = record.addr;
        let send_leave = older_mode
            && was_listening
            && F::sends_leave(mode)
            && group != F::ALL_NODES
            && F::can_participate(&group)
            && (record.sent_last_report || !optimize);
        if send_leave {
            actions.push(Action::Send {
                group: None,
                message: Message::Leave { group },
                destination: F::ALL_ROUTERS,
            });
        }
        actions
    }

    pub(crate) fn mark_sent(&mut self, handle: GroupHandle) {
        if let Some(record) = self.groups.get_mut(handle) {
            record.sent_last_report = true;
        }
    }

    /// Cancels every timer owned by this interface.
    pub fn teardown(&mut self) -> Vec<Action<F>> {
        let mut actions = Vec::new();
        for (handle, record) in self.groups.iter() {
            for timer in [record.response_timer.as_ref(), record.startup_timer.as_ref()].into_iter().flatten() {
                actions.push(Action::UnsetTimer(self.group_timer(handle, timer)));
            }
        }
        for (version, generation) in self.compat.running() {
            actions.push(Action::UnsetTimer(self.compat_timer(version, generation)));
        }
        actions
    }
}
