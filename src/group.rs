
use crate::family::AddressFamily;
use crate::filter::{DeviceFilter, FilterChange};
use crate::srcset::SourceList;
use crate::timer::TimerEvent;

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    NonListener,
    Delaying,
    Idle,
}

/// Stable reference to a group record in a [`GroupArena`].
///
/// A handle outlives the record it names only as a stale value: lookups with
/// it fail once the slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupHandle {
    slot: usize,
    generation: u64,
}

impl GroupHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Timer armed on behalf of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub event: TimerEvent,
    pub generation: u64,
    pub deadline: Instant,
}

/// Per-interface, per-address protocol state.
#[derive(Debug, Clone)]
pub struct GroupRecord<F: AddressFamily> {
    pub(crate) addr: F::Addr,
    pub(crate) refcount: usize,
    pub(crate) state: ListenerState,

    /// sources recorded from pending source-specific queries
    pub(crate) pending_sources: SourceList<F::Addr>,

    /// query response timer (general or address-specific)
    pub(crate) response_timer: Option<ArmedTimer>,

    /// state-change retransmission timer
    pub(crate) startup_timer: Option<ArmedTimer>,
    pub(crate) startup_count: u8,

    /// records repeated on each retransmission
    pub(crate) message_to_send: Vec<FilterChange<F::Addr>>,

    pub(crate) sent_last_report: bool,
    pub(crate) timer_generation: u64,
    pub(crate) filter: DeviceFilter<F::Addr>,
}

impl<F: AddressFamily> GroupRecord<F> {
    pub fn new(addr: F::Addr) -> Self {
        Self {
            addr,
            refcount: 0,
            state: ListenerState::NonListener,
            pending_sources: SourceList::new(),
            response_timer: None,
            startup_timer: None,
            startup_count: 0,
            message_to_send: Vec::new(),
            sent_last_report: false,
            timer_generation: 0,
            filter: DeviceFilter::new(),
        }
    }

    pub fn addr(&self) -> F::Addr {
        self.addr
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn filter(&self) -> &DeviceFilter<F::Addr> {
        &self.filter
    }

    pub fn pending_sources(&self) -> &SourceList<F::Addr> {
        &self.pending_sources
    }

    pub fn sent_last_report(&self) -> bool {
        self.sent_last_report
    }

    pub fn response_timer(&self) -> Option<&ArmedTimer> {
        self.response_timer.as_ref()
    }

    pub fn startup_timer(&self) -> Option<&ArmedTimer> {
        self.startup_timer.as_ref()
    }

    pub(crate) fn next_timer_generation(&mut self) -> u64 {
        self.timer_generation += 1;
        self.timer_generation
    }
}

#[derive(Debug, Clone)]
enum Slot<T> {
    Occupied { generation: u64, value: T },
    Vacant { generation: u64 },
}

/// Slot arena owning every group record of one interface.
///
/// Reference counts live in the records and are only changed through the
/// arena, which frees the slot when a count drops to zero.
#[derive(Debug, Clone)]
pub struct GroupArena<F: AddressFamily> {
    slots: Vec<Slot<GroupRecord<F>>>,
    free: Vec<usize>,
    len: usize,
}

impl<F: AddressFamily> Default for GroupArena<F> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<F: AddressFamily> GroupArena<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, record: GroupRecord<F>) -> GroupHandle {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let generation = match self.slots[slot] {
                Slot::Vacant { generation } => generation + 1,
                Slot::Occupied { generation, .. } => generation + 1,
            };
            self.slots[slot] = Slot::Occupied { generation, value: record };
            GroupHandle { slot, generation }
        } else {
            let slot = self.slots.len();
            self.slots.push(Slot::Occupied { generation: 0, value: record });
            GroupHandle { slot, generation: 0 }
        }
    }

    pub fn get(&self, handle: GroupHandle) -> Option<&GroupRecord<F>> {
        match self.slots.get(handle.slot) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: GroupHandle) -> Option<&mut GroupRecord<F>> {
        match self.slots.get_mut(handle.slot) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, handle: GroupHandle) -> Option<GroupRecord<F>> {
        match self.slots.get(handle.slot) {
            Some(Slot::Occupied { generation, .. }) if *generation == handle.generation => {}
            _ => return None,
        }
        let slot = std::mem::replace(&mut self.slots[handle.slot], Slot::Vacant { generation: handle.generation });
        self.free.push(handle.slot);
        self.len -= 1;
        match slot {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn find(&self, addr: &F::Addr) -> Option<GroupHandle> {
        self.iter().find(|(_, record)| record.addr == *addr).map(|(handle, _)| handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (GroupHandle, &GroupRecord<F>)> {
        self.slots.iter().enumerate().filter_map(|(slot, s)| match s {
            Slot::Occupied { generation, value } => Some((GroupHandle { slot, generation: *generation }, value)),
            Slot::Vacant { .. } => None,
        })
    }

    pub fn handles(&self) -> Vec<GroupHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Takes one more reference on the record.
    pub fn acquire(&mut self, handle: GroupHandle) -> Option<usize> {
        let record = self.get_mut(handle)?;
        record.refcount += 1;
        Some(record.refcount)
    }

    /// Drops one reference and returns the remaining count.
    pub fn release(&mut self, handle: GroupHandle) -> Option<usize> {
        let record = self.get_mut(handle)?;
        record.refcount = record.refcount.saturating_sub(1);
        Some(record.refcount)
    }
}
