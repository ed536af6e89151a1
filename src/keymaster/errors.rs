use std::error::Error;
use std::fmt;

pub type KeymasterResult<T> = Result<T, KeymasterError>;

#[derive(Debug, Clone)]
pub enum KeymasterError {
    /// No node exists at the requested path.
    NoSuchKey(String),
    /// No keymaster is registered under the given url.
    Connect(String),
    /// The owning server has shut down.
    Closed,
}

impl fmt::Display for KeymasterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchKey(path) => write!(f, "no such key '{path}'"),
            Self::Connect(url) => write!(f, "cannot reach keymaster at '{url}'"),
            Self::Closed => write!(f, "keymaster is closed"),
        }
    }
}

impl Error for KeymasterError {}
