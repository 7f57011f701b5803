//! `bus` crate: routed pub/sub between the engine's workers.
//!
//! A single exchange carries every [`Message`]; subscribers pick the
//! routing keys they care about.  Delivery is at-least-once, so every
//! consumer must re-read persisted state before acting.

pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod retry;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use error::BusError;
pub use memory::MemoryBus;
pub use message::{Message, RoutingKey};
pub use postgres::PgBus;

/// Capacity of each subscriber's buffer.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 256;

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, message: &Message) -> Result<(), BusError>;

    /// Subscribe to the given routing keys. Messages published before the
    /// call are not replayed.
    async fn subscribe(&self, keys: &[RoutingKey]) -> Result<Subscription, BusError>;
}

/// Receiving end of a bus subscription.
pub struct Subscription {
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Message>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the bus side has shut down.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}
