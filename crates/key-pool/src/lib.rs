//! Credential pool for the Gemini key-pool proxy
//!
//! Holds a fixed set of upstream API keys with per-key health state and hands
//! them out through a pluggable selection strategy (round-robin by default).
//! The pool has no knowledge of HTTP: callers report rate limits back by
//! cooling a credential down, and every selection is released exactly once
//! when its `Lease` is dropped.
//!
//! Credential lifecycle:
//! 1. Keys are loaded once at startup → eligible, in-flight 0
//! 2. `Dispatcher::select` picks an eligible key → in-flight +1, `Lease` returned
//! 3. Upstream answers 429 → caller cools the key down for the configured window
//! 4. `Lease` dropped (success, failure or cancelled request) → in-flight -1
//! 5. Cooldown deadline passes → key is eligible again on the next selection

pub mod dispatch;
pub mod error;
pub mod store;
pub mod strategy;

pub use dispatch::{Dispatcher, Lease, Selection, Unavailable};
pub use error::{Error, Result};
pub use store::{Credential, CredentialStore};
pub use strategy::{LeastInFlight, RoundRobin, Strategy, StrategyKind, Weighted};
