
use crate::family::ProtocolVersion;
use crate::group::GroupHandle;
use crate::interface::InterfaceId;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    /// response to a general query
    GeneralQuery,

    /// response to an address (and source) specific query
    AddressSpecific,

    /// state-change report retransmission
    StartupReport,

    /// older-version-querier-present guard
    OlderVersionQuerier(ProtocolVersion),
}

/// Identifies one armed timer.
///
/// `generation` is compared against the owner's current value when the timer
/// fires, so a timer re-armed in the meantime is recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub interface: InterfaceId,
    pub event: TimerEvent,
    pub group: Option<GroupHandle>,
    pub generation: u64,
}

/// The timer service consumed by the engine.
pub trait TimerQueue {
    fn now(&self) -> Instant;

    /// Arms `id` to fire after `delay`. An existing timer with the same id is replaced.
    fn set_timer(&mut self, id: TimerId, delay: Duration);

    /// Cancels `id`. Unsetting a fired or unknown timer is not an error.
    fn unset_timer(&mut self, id: &TimerId);
}

/// Timer queue backed by tokio tasks. Fired ids are delivered on the channel
/// returned from [`TokioTimerQueue::new`].
#[derive(Debug)]
pub struct TokioTimerQueue {
    tasks: HashMap<TimerId, AbortHandle>,
    sender: mpsc::UnboundedSender<TimerId>,
}

impl TokioTimerQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerId>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { tasks: HashMap::new(), sender }, receiver)
    }

    /// Forget a timer that has been delivered.
    pub fn fired(&mut self, id: &TimerId) {
        self.tasks.remove(id);
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}

impl TimerQueue for TokioTimerQueue {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn set_timer(&mut self, id: TimerId, delay: Duration) {
        let sender = self.sender.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(id);
        });
        if let Some(old) = self.tasks.insert(id, join.abort_handle()) {
            old.abort();
        }
    }

    fn unset_timer(&mut self, id: &TimerId) {
        if let Some(task) = self.tasks.remove(id) {
            task.abort();
        }
    }
}

impl Drop for TokioTimerQueue {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(generation: u64) -> TimerId {
        TimerId {
            interface: InterfaceId::new(1),
            event: TimerEvent::OlderVersionQuerier(ProtocolVersion::V1),
            group: None,
            generation,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_fires() {
        let (mut queue, mut receiver) = TokioTimerQueue::new();
        queue.set_timer(id(1), Duration::from_millis(50));
        let fired = receiver.recv().await.unwrap();
        assert_eq!(fired, id(1));
        queue.fired(&fired);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_unset_cancels() {
        let (mut queue, mut receiver) = TokioTimerQueue::new();
        queue.set_timer(id(1), Duration::from_millis(50));
        queue.set_timer(id(2), Duration::from_millis(100));
        queue.unset_timer(&id(1));
        queue.unset_timer(&id(7));
        assert_eq!(receiver.recv().await.unwrap(), id(2));
    }
}
