
use crate::family::ProtocolVersion;

use std::time::Duration;

/// Guard timer for one older protocol version seen on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OlderQuerier {
    version: ProtocolVersion,
    generation: u64,
    running: bool,
}

/// What the caller has to do with timers after a compatibility update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatTimer {
    /// cancel `previous` (if any) and arm a guard for `version`
    Arm {
        version: ProtocolVersion,
        previous: Option<u64>,
        generation: u64,
        timeout: Duration,
    },
}

/// Per-interface compatibility mode negotiation.
///
/// The effective mode is the oldest version whose guard timer is running,
/// bounded by the configured default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatState {
    default_mode: ProtocolVersion,
    older: Vec<OlderQuerier>,
    generation: u64,
}

impl CompatState {
    pub fn new(default_mode: ProtocolVersion, older_versions: &[ProtocolVersion]) -> Self {
        let older = older_versions.iter().map(|version| OlderQuerier {
            version: *version,
            generation: 0,
            running: false,
        }).collect();
        Self { default_mode, older, generation: 0 }
    }

    pub fn mode(&self) -> ProtocolVersion {
        self.older.iter()
            .filter(|q| q.running)
            .map(|q| q.version)
            .fold(self.default_mode, std::cmp::min)
    }

    /// Notes a query of `version`. Queries from older versions (re)start their
    /// guard timer; a running timer is restarted, not extended.
    pub fn query_received(&mut self, version: ProtocolVersion, timeout: Duration) -> Option<CompatTimer> {
        self.generation += 1;
        let generation = self.generation;
        let querier = self.older.iter_mut().find(|q| q.version == version)?;
        let previous = if querier.running { Some(querier.generation) } else { None };
        if previous.is_none() {
            log::info!("older version querier ({}) detected", version);
        }
        querier.running = true;
        querier.generation = generation;
        Some(CompatTimer::Arm { version, previous, generation, timeout })
    }

    /// Handles expiry of a guard timer. Returns false for stale timers.
    pub fn timer_expired(&mut self, version: ProtocolVersion, generation: u64) -> bool {
        let before = self.mode();
        let querier = match self.older.iter_mut().find(|q| q.version == version) {
            Some(querier) => querier,
            None => return false,
        };
        if !querier.running || querier.generation != generation {
            return false;
        }
        querier.running = false;
        let after = self.mode();
        if before != after {
            log::info!("compatibility mode {} -> {}", before, after);
        }
        true
    }

    /// Generations of all running guards, for cancellation on teardown.
    pub fn running(&self) -> Vec<(ProtocolVersion, u64)> {
        self.older.iter().filter(|q| q.running).map(|q| (q.version, q.generation)).collect()
    }
}
