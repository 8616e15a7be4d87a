//! Error taxonomy shared by the scanner, capture store and relay.
//!
//! Nothing here is fatal to the process: the worst outcome of any variant is
//! an aborted single session.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AvError {
    /// A single-flight resource (scan sweep, relay pair) is already taken.
    #[error("{0} already running")]
    AlreadyRunning(&'static str),

    /// Operator input was malformed or incomplete. No state was changed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Connect timeout, refused connection, lookup failure and friends.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// The external registry handed us something we could not parse.
    #[error("registry error: {0}")]
    Registry(String),
}

impl AvError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        AvError::InvalidInput(msg.into())
    }
}

pub type AvResult<T> = std::result::Result<T, AvError>;
