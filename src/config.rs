//! Configuration for the call core.

use std::time::Duration;

/// Tunables for a call controller.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How often presence is re-announced while waiting for the peer.
    pub announce_interval: Duration,
    /// How long presence announcements continue before giving up silently.
    /// The call stays in `waiting-for-peer` afterwards; only the user ends it.
    pub announce_window: Duration,
    /// Bounded attempts for relay subscribe and signaling sends.
    pub signaling_attempts: u32,
    /// Delay between signaling retries.
    pub signaling_retry_delay: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(2),
            announce_window: Duration::from_secs(10),
            signaling_attempts: 3,
            signaling_retry_delay: Duration::from_millis(500),
        }
    }
}
