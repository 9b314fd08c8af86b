use thiserror::Error;

/// Errors raised by core domain types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid scan status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid event payload: {0}")]
    InvalidEvent(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}
