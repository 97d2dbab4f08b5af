use crate::session::SessionState;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),
    #[error("not acceptable: expected event-stream, got {accept:?}")]
    NotAcceptable { accept: Option<String> },
    #[error("transport write failure: {0}")]
    TransportWriteFailure(&'static str),
    #[error("invalid channel: {0:?}")]
    InvalidChannel(String),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

impl RelayError {
    /// Write failures are handled exactly like the connection closing.
    pub fn is_close_signal(&self) -> bool {
        matches!(self, RelayError::TransportWriteFailure(_))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::NotAcceptable { .. } => 404,
            RelayError::InvalidChannel(_) => 400,
            RelayError::MissingDependency(_)
            | RelayError::InvalidConfig(_)
            | RelayError::InvalidTransition { .. }
            | RelayError::TransportWriteFailure(_) => 500,
        }
    }
}
