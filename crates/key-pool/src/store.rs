//! Credential set and per-credential health state
//!
//! The store owns every credential and its mutable health: the number of
//! requests currently dispatched to it and an optional cooldown deadline. It
//! knows nothing about selection policy or HTTP.
//!
//! Each credential carries its own synchronization (an atomic in-flight
//! counter and a mutex around the cooldown deadline), so concurrent requests on
//! different keys never contend and no operation touches more than one
//! credential.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::Secret;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// One upstream API key and its health state.
pub struct Credential {
    label: String,
    secret: Secret<String>,
    weight: u32,
    in_flight: AtomicUsize,
    cooldown_until: Mutex<Option<Instant>>,
}

impl Credential {
    fn new(index: usize, secret: Secret<String>, weight: u32) -> Self {
        Self {
            label: format!("key-{index}"),
            secret,
            weight: weight.max(1),
            in_flight: AtomicUsize::new(0),
            cooldown_until: Mutex::new(None),
        }
    }

    /// Non-secret name used in logs, metrics and health output.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The API key itself.
    pub fn secret(&self) -> &Secret<String> {
        &self.secret
    }

    /// Relative share for the weighted strategy (always >= 1).
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Number of requests currently dispatched to this credential.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Eligible iff no cooldown is set or the deadline is not after `now`.
    pub fn is_eligible(&self, now: Instant) -> bool {
        match *self.deadline() {
            None => true,
            Some(until) => now >= until,
        }
    }

    /// Time left on an active cooldown, `None` when eligible at `now`.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        match *self.deadline() {
            Some(until) if until > now => Some(until - now),
            _ => None,
        }
    }

    pub(crate) fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement floored at zero. Returns false when the count was already 0.
    pub(crate) fn release(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Overwrites any existing deadline (last writer wins).
    pub(crate) fn cool_down(&self, duration: Duration) {
        let until = Instant::now() + duration;
        *self.deadline() = Some(until);
    }

    /// Drop a deadline that has already passed so the credential reports as
    /// plainly available again. Returns true if a deadline was cleared.
    pub(crate) fn clear_expired(&self, now: Instant) -> bool {
        let mut deadline = self.deadline();
        match *deadline {
            Some(until) if now >= until => {
                *deadline = None;
                true
            }
            _ => false,
        }
    }

    fn deadline(&self) -> MutexGuard<'_, Option<Instant>> {
        // The guarded value is a plain Option<Instant>, valid even after a panic.
        self.cooldown_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("weight", &self.weight)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Fixed, ordered set of credentials.
///
/// Built once at startup and shared behind an `Arc`; the list order is the
/// round-robin order.
#[derive(Debug)]
pub struct CredentialStore {
    credentials: Vec<Credential>,
}

impl CredentialStore {
    /// Build a store where every credential has weight 1.
    pub fn new(keys: Vec<Secret<String>>) -> Self {
        Self::with_weights(keys, &[])
    }

    /// Build a store with per-key weights, aligned by position. Missing
    /// weights default to 1.
    ///
    /// Duplicate keys are collapsed onto their first occurrence so ids stay
    /// unique; labels are assigned after de-duplication.
    pub fn with_weights(keys: Vec<Secret<String>>, weights: &[u32]) -> Self {
        let mut credentials: Vec<Credential> = Vec::with_capacity(keys.len());
        for (position, key) in keys.into_iter().enumerate() {
            if key.expose().is_empty() {
                warn!(position, "skipping empty API key");
                continue;
            }
            if credentials.iter().any(|c| c.secret == key) {
                warn!(position, hint = %key.hint(), "skipping duplicate API key");
                continue;
            }
            let weight = weights.get(position).copied().unwrap_or(1);
            credentials.push(Credential::new(credentials.len(), key, weight));
        }
        info!(credentials = credentials.len(), "credential store initialized");
        Self { credentials }
    }

    /// All credentials in stable order.
    pub fn list(&self) -> &[Credential] {
        &self.credentials
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Look a credential up by its id (the API key).
    pub fn get(&self, id: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.secret.expose() == id)
    }

    pub(crate) fn at(&self, index: usize) -> &Credential {
        &self.credentials[index]
    }

    /// Increment the in-flight count for `id`.
    pub fn mark_in_use(&self, id: &str) -> Result<()> {
        self.get(id).ok_or(Error::UnknownCredential)?.acquire();
        Ok(())
    }

    /// Decrement the in-flight count for `id`, never below zero.
    pub fn release(&self, id: &str) -> Result<()> {
        let credential = self.get(id).ok_or(Error::UnknownCredential)?;
        if !credential.release() {
            warn!(credential = credential.label(), "release without matching acquire");
        }
        Ok(())
    }

    /// Make `id` ineligible until `now + duration`.
    pub fn cool_down(&self, id: &str, duration: Duration) -> Result<()> {
        let index = self
            .credentials
            .iter()
            .position(|c| c.secret.expose() == id)
            .ok_or(Error::UnknownCredential)?;
        self.cool_down_at(index, duration);
        Ok(())
    }

    /// Cool down the credential at `index`, as handed out by a strategy.
    pub(crate) fn cool_down_at(&self, index: usize, duration: Duration) {
        let credential = self.at(index);
        credential.cool_down(duration);
        info!(
            credential = credential.label(),
            cooldown_ms = duration.as_millis() as u64,
            "credential entering cooldown"
        );
        metrics::counter!("keypool_cooldowns_total", "credential" => credential.label().to_string())
            .increment(1);
    }

    /// Whether `id` may be selected at `now`. Unknown ids are never eligible.
    pub fn is_eligible(&self, id: &str, now: Instant) -> bool {
        self.get(id).is_some_and(|c| c.is_eligible(now))
    }

    /// Current in-flight count for `id`.
    pub fn in_flight(&self, id: &str) -> Option<usize> {
        self.get(id).map(Credential::in_flight)
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all eligible → healthy, some eligible → degraded,
    /// none eligible (or empty pool) → unhealthy. Keys are never included,
    /// only labels and a short hint.
    pub fn health(&self, now: Instant) -> serde_json::Value {
        let mut credentials = Vec::with_capacity(self.credentials.len());
        let mut available = 0usize;
        let mut cooling = 0usize;

        for credential in &self.credentials {
            match credential.cooldown_remaining(now) {
                None => {
                    available += 1;
                    credentials.push(serde_json::json!({
                        "label": credential.label(),
                        "hint": credential.secret().hint(),
                        "status": "available",
                        "in_flight": credential.in_flight(),
                    }));
                }
                Some(remaining) => {
                    cooling += 1;
                    credentials.push(serde_json::json!({
                        "label": credential.label(),
                        "hint": credential.secret().hint(),
                        "status": "cooling_down",
                        "in_flight": credential.in_flight(),
                        "cooldown_remaining_ms": remaining.as_millis() as u64,
                    }));
                }
            }
        }

        let total = self.credentials.len();
        let status = if total > 0 && available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "credentials_total": total,
            "credentials_available": available,
            "credentials_cooling_down": cooling,
            "credentials": credentials,
        })
    }
}
