pub mod client;
pub mod errors;
pub mod server;

pub use client::Keymaster;
pub use errors::{KeymasterError, KeymasterResult};
pub use server::KeymasterServer;

use std::fmt;
use uuid::Uuid;
use uuid::fmt::Simple;

/// Unique identifier for a registered subscription.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SubscriptionId {
    raw: Simple,
}

impl SubscriptionId {
    pub fn new() -> Self {
        Self {
            raw: Uuid::new_v4().simple(),
        }
    }

    /// Raw UUID (compact format).
    #[inline]
    pub fn raw(&self) -> Simple {
        self.raw
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}
