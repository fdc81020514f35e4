//! Selection strategies
//!
//! A strategy decides which eligible credential serves the next request. It
//! sees the whole ordered credential list plus the current time and returns an
//! index; the dispatcher takes care of locking and of marking the pick in use.

use std::fmt;

use serde::Deserialize;
use tokio::time::Instant;

use crate::store::{Credential, CredentialStore};

/// Pluggable selection policy.
///
/// `pick` runs inside the dispatcher's critical section, so implementations
/// may keep plain mutable cursor state and must not block.
pub trait Strategy: Send {
    /// Name used in logs and config (`round_robin`, ...).
    fn name(&self) -> &'static str;

    /// Index of an eligible credential, or `None` if none is eligible.
    fn pick(&mut self, credentials: &[Credential], now: Instant) -> Option<usize>;
}

/// Strategy names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    LeastInFlight,
    Weighted,
}

impl StrategyKind {
    /// Instantiate the strategy for a given store.
    pub fn build(self, store: &CredentialStore) -> Box<dyn Strategy> {
        match self {
            StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
            StrategyKind::LeastInFlight => Box::new(LeastInFlight::new()),
            StrategyKind::Weighted => Box::new(Weighted::new(store.list())),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LeastInFlight => write!(f, "least_in_flight"),
            Self::Weighted => write!(f, "weighted"),
        }
    }
}

/// Rotating cursor over the list.
///
/// Scans forward from the slot after the last pick, at most once around the
/// list, and returns the first eligible credential.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn pick(&mut self, credentials: &[Credential], now: Instant) -> Option<usize> {
        let n = credentials.len();
        if n == 0 {
            return None;
        }
        let start = self.next % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if credentials[idx].is_eligible(now) {
                self.next = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }
}

/// Eligible credential with the fewest requests in flight.
///
/// Ties go to the first candidate after the previous pick, so equally loaded
/// keys still rotate.
#[derive(Debug, Default)]
pub struct LeastInFlight {
    next: usize,
}

impl LeastInFlight {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for LeastInFlight {
    fn name(&self) -> &'static str {
        "least_in_flight"
    }

    fn pick(&mut self, credentials: &[Credential], now: Instant) -> Option<usize> {
        let n = credentials.len();
        if n == 0 {
            return None;
        }
        let start = self.next % n;
        let mut best: Option<(usize, usize)> = None;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let credential = &credentials[idx];
            if !credential.is_eligible(now) {
                continue;
            }
            let load = credential.in_flight();
            if best.is_none_or(|(_, best_load)| load < best_load) {
                best = Some((idx, load));
            }
        }
        let (idx, _) = best?;
        self.next = (idx + 1) % n;
        Some(idx)
    }
}

/// Weighted rotation: credential `i` occupies `weight_i` slots of a fixed
/// cycle, and the cursor walks the cycle skipping ineligible entries.
#[derive(Debug)]
pub struct Weighted {
    cycle: Vec<usize>,
    position: usize,
}

impl Weighted {
    pub fn new(credentials: &[Credential]) -> Self {
        let mut cycle = Vec::new();
        for (idx, credential) in credentials.iter().enumerate() {
            for _ in 0..credential.weight() {
                cycle.push(idx);
            }
        }
        Self { cycle, position: 0 }
    }
}

impl Strategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn pick(&mut self, credentials: &[Credential], now: Instant) -> Option<usize> {
        let m = self.cycle.len();
        if m == 0 {
            return None;
        }
        for offset in 0..m {
            let slot = (self.position + offset) % m;
            let idx = self.cycle[slot];
            if credentials.get(idx).is_some_and(|c| c.is_eligible(now)) {
                self.position = (slot + 1) % m;
                return Some(idx);
            }
        }
        None
    }
}
