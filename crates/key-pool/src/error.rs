//! Error types for pool operations

/// Errors from pool operations.
///
/// Running out of eligible credentials is not an error; see
/// [`Selection::Unavailable`](crate::Selection::Unavailable).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The id does not belong to this pool. Ids are API keys and never appear
    /// in the message.
    #[error("unknown credential")]
    UnknownCredential,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
