//! Upstream forwarding for the Gemini key-pool proxy
//!
//! `Forwarder` performs exactly one call against the upstream API with a
//! caller-chosen API key and reports the result as a `ForwardOutcome`. It never
//! retries and never touches credential health: the caller decides whether a
//! `Failure` should cool the key down or be re-dispatched to another one.
//!
//! `relay` drains a streamed outcome into a `ChunkSink` one chunk at a time,
//! stopping as soon as the upstream ends, fails, or the client goes away.

pub mod classify;
pub mod error;
pub mod forward;
pub mod headers;
pub mod outcome;
pub mod relay;
pub mod request;

pub use error::{Error, Result};
pub use forward::{Forwarder, ForwarderConfig};
pub use headers::HeaderInjection;
pub use outcome::{
    ChunkItem, ChunkStream, FailureKind, ForwardOutcome, UnaryResponse, UpstreamFailure,
};
pub use relay::{ChannelSink, ChunkReceiver, ChunkSink, RelayEnd, SinkClosed, relay};
pub use request::{NativeAction, UpstreamRequest};
