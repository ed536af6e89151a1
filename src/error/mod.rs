use crate::keymaster::KeymasterError;
use std::{error::Error, fmt};

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Why a FIFO insertion was refused.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PutFailReason {
    /// The queue is at capacity (try variant only).
    Full,
    /// The queue was released and must be flushed before reuse.
    Released,
}

impl fmt::Display for PutFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutFailReason::Full => write!(f, "queue is full"),
            PutFailReason::Released => write!(f, "queue was released"),
        }
    }
}

/// Failed FIFO insertion. Hands the rejected value back to the caller.
#[derive(Debug)]
pub struct PutError<T> {
    pub value: T,
    pub reason: PutFailReason,
}

impl<T> PutError<T> {
    pub fn full(value: T) -> Self {
        Self {
            value,
            reason: PutFailReason::Full,
        }
    }

    pub fn released(value: T) -> Self {
        Self {
            value,
            reason: PutFailReason::Released,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn is_full(&self) -> bool {
        self.reason == PutFailReason::Full
    }

    pub fn is_released(&self) -> bool {
        self.reason == PutFailReason::Released
    }
}

impl<T> fmt::Display for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl<T: fmt::Debug> Error for PutError<T> {}

/// Errors surfaced by the [`Controller`](crate::control::Controller)
/// and its lifecycle operations.
#[derive(Debug)]
pub enum ControllerError {
    /// The configuration document is missing a required key or has the
    /// wrong shape. Fatal at startup.
    ConfigurationMalformed(String),
    /// A declared component type has no registered factory. Fatal at
    /// startup; nothing is constructed.
    UnknownComponentType(String),
    /// `set_system_mode` was given a mode absent from `connections`.
    UnknownMode(String),
    /// The operation is not legal in the current FSM state.
    InvalidState { event: String, state: String },
    /// Not every active component reached the expected state in time.
    QuorumTimeout {
        expected: String,
        pending: Vec<String>,
    },
    /// A component reported an error status instead of reaching the
    /// expected state.
    Component { name: String, status: String },
    /// Thread or synchronization primitive failure. Fatal.
    Resource(String),
    /// Underlying keymaster failure.
    Keymaster(KeymasterError),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigurationMalformed(msg) => write!(f, "configuration malformed: {msg}"),
            Self::UnknownComponentType(kind) => {
                write!(f, "no factory registered for component type '{kind}'")
            }
            Self::UnknownMode(mode) => write!(f, "unknown mode '{mode}'"),
            Self::InvalidState { event, state } => {
                write!(f, "'{event}' is not legal in state '{state}'")
            }
            Self::QuorumTimeout { expected, pending } => {
                write!(
                    f,
                    "timed out waiting for state '{expected}', pending: {}",
                    pending.join(", ")
                )
            }
            Self::Component { name, status } => {
                write!(f, "component '{name}' reported: {status}")
            }
            Self::Resource(msg) => write!(f, "resource failure: {msg}"),
            Self::Keymaster(err) => write!(f, "keymaster error: {err}"),
        }
    }
}

impl Error for ControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Keymaster(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KeymasterError> for ControllerError {
    fn from(err: KeymasterError) -> Self {
        ControllerError::Keymaster(err)
    }
}
