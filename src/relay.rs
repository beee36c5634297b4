//! Relay channel interface.
//!
//! The relay is an existing best-effort broadcast primitive: named topics,
//! at-most-once delivery, no ordering across senders, no persistence and no
//! membership guarantees. The call core uses it purely as a rendezvous and
//! signaling path.
//!
//! Sends are gated on subscription acknowledgment by construction: the only
//! way to obtain a publisher is from the [`RelaySubscription`] that
//! `subscribe` returns, and `subscribe` resolves only once the relay has
//! acknowledged the subscription.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::protocol::{RelayEvent, RelayFrame};

/// Depth of the bounded inbound event queue per subscription.
pub const RELAY_QUEUE_DEPTH: usize = 64;

/// A named broadcast topic provider.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Subscribe to `topic`, resolving once the subscription is acknowledged.
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, RelayError>;
}

/// Outbound half of an acknowledged subscription.
#[async_trait]
pub trait RelayPublisher: Send + Sync {
    async fn send(&self, event: &RelayEvent) -> Result<(), RelayError>;

    /// Tear down the subscription. Safe to call more than once.
    async fn unsubscribe(&self);
}

/// An acknowledged subscription: a bounded inbound queue plus a publisher.
pub struct RelaySubscription {
    inbound: mpsc::Receiver<RelayFrame>,
    publisher: Box<dyn RelayPublisher>,
}

impl RelaySubscription {
    pub fn new(inbound: mpsc::Receiver<RelayFrame>, publisher: Box<dyn RelayPublisher>) -> Self {
        Self { inbound, publisher }
    }

    /// Split into the inbound queue and the publisher so the control loop
    /// can consume frames while handlers send.
    pub fn split(self) -> (mpsc::Receiver<RelayFrame>, Box<dyn RelayPublisher>) {
        (self.inbound, self.publisher)
    }
}
