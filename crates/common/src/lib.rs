//! Types shared across the Gemini key-pool proxy crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
