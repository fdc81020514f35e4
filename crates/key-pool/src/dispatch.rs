//! Credential dispatch and scoped acquisition
//!
//! `Dispatcher::select` runs the configured strategy and marks the chosen
//! credential in use as one step, then hands back a `Lease`. The lease is the
//! only way to hold a credential: dropping it releases the in-flight count,
//! which covers success, failure, early return and cancelled futures alike.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::Secret;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::store::{Credential, CredentialStore};
use crate::strategy::{Strategy, StrategyKind};

/// Why no credential could be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    /// The pool was configured without any credentials.
    EmptyPool,
    /// Every credential is cooling down.
    AllCoolingDown,
}

impl Unavailable {
    /// Metric/log label.
    pub fn label(&self) -> &'static str {
        match self {
            Unavailable::EmptyPool => "empty_pool",
            Unavailable::AllCoolingDown => "all_cooling_down",
        }
    }
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unavailable::EmptyPool => write!(f, "no credentials configured"),
            Unavailable::AllCoolingDown => write!(f, "all credentials are cooling down"),
        }
    }
}

/// Result of a selection attempt. Unavailability is an ordinary outcome.
#[must_use]
#[derive(Debug)]
pub enum Selection {
    Acquired(Lease),
    Unavailable(Unavailable),
}

impl Selection {
    /// The lease, if one was acquired.
    pub fn lease(self) -> Option<Lease> {
        match self {
            Selection::Acquired(lease) => Some(lease),
            Selection::Unavailable(_) => None,
        }
    }
}

/// A credential held for the duration of one request.
///
/// Releases its in-flight slot exactly once, on drop.
pub struct Lease {
    store: Arc<CredentialStore>,
    index: usize,
}

impl Lease {
    pub fn credential(&self) -> &Credential {
        self.store.at(self.index)
    }

    pub fn label(&self) -> &str {
        self.credential().label()
    }

    pub fn secret(&self) -> &Secret<String> {
        self.credential().secret()
    }

    /// Put the leased credential into cooldown (upstream rate-limited it).
    pub fn cool_down(&self, duration: Duration) {
        self.store.cool_down_at(self.index, duration);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let credential = self.store.at(self.index);
        if !credential.release() {
            warn!(credential = credential.label(), "lease released with zero in-flight");
        }
        debug!(
            credential = credential.label(),
            in_flight = credential.in_flight(),
            "credential released"
        );
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("credential", &self.label())
            .finish()
    }
}

/// Selects credentials from a shared store.
///
/// The strategy mutex guards only the strategy's cursor: it is held for the
/// pick plus the in-flight increment and never across I/O. Releases and
/// cooldowns go straight to the per-credential state without taking it.
pub struct Dispatcher {
    store: Arc<CredentialStore>,
    strategy: Mutex<Box<dyn Strategy>>,
}

impl Dispatcher {
    /// Dispatcher using one of the built-in strategies.
    pub fn new(store: Arc<CredentialStore>, kind: StrategyKind) -> Self {
        let strategy = kind.build(&store);
        Self::with_strategy(store, strategy)
    }

    /// Dispatcher using a caller-supplied strategy.
    pub fn with_strategy(store: Arc<CredentialStore>, strategy: Box<dyn Strategy>) -> Self {
        info!(
            strategy = strategy.name(),
            credentials = store.len(),
            "dispatcher initialized"
        );
        Self {
            store,
            strategy: Mutex::new(strategy),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .name()
    }

    /// Select an eligible credential now.
    pub fn select(&self) -> Selection {
        self.select_at(Instant::now())
    }

    /// Select an eligible credential as of `now`.
    pub fn select_at(&self, now: Instant) -> Selection {
        if self.store.is_empty() {
            return self.unavailable(Unavailable::EmptyPool);
        }

        let picked = {
            let mut strategy = self
                .strategy
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let picked = strategy.pick(self.store.list(), now);
            if let Some(index) = picked {
                self.store.at(index).acquire();
            }
            picked
        };

        let Some(index) = picked else {
            return self.unavailable(Unavailable::AllCoolingDown);
        };

        let credential = self.store.at(index);
        if credential.clear_expired(now) {
            info!(
                credential = credential.label(),
                "cooldown expired, credential available again"
            );
        }
        debug!(
            credential = credential.label(),
            in_flight = credential.in_flight(),
            "credential selected"
        );
        metrics::counter!("keypool_selections_total", "credential" => credential.label().to_string())
            .increment(1);

        Selection::Acquired(Lease {
            store: Arc::clone(&self.store),
            index,
        })
    }

    fn unavailable(&self, reason: Unavailable) -> Selection {
        warn!(
            reason = reason.label(),
            credentials = self.store.len(),
            "no eligible credential"
        );
        metrics::counter!("keypool_unavailable_total", "reason" => reason.label()).increment(1);
        Selection::Unavailable(reason)
    }
}
