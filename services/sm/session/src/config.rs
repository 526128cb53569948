//! Stream management configuration.

use std::time::Duration;

/// Configuration for a stream management session
#[derive(Clone, Debug)]
pub struct SmConfig {
    /// Request resumption support when enabling
    pub resume: bool,
    /// Send `<r/>` after every Nth outbound stanza (1 = after each one)
    pub request_every: u32,
    /// Upper bound on the advisory pending set
    pub max_pending: usize,
    /// How long to wait for `<enabled/>` or `<resumed/>`
    pub response_timeout: Duration,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            resume: true,
            request_every: 1,
            max_pending: 4096,
            response_timeout: Duration::from_secs(30),
        }
    }
}

impl SmConfig {
    /// Effective request interval, never zero
    pub fn request_interval(&self) -> u32 {
        self.request_every.max(1)
    }
}
