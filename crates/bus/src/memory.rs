//! In-process bus over a tokio broadcast channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::{Bus, BusError, Message, RoutingKey, Subscription, SUBSCRIPTION_BUFFER};

/// Single-process [`Bus`]. Every published message is also kept in a
/// history list that tests can inspect.
pub struct MemoryBus {
    tx: broadcast::Sender<Message>,
    history: Mutex<Vec<Message>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx, history: Mutex::new(Vec::new()) }
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<Message> {
        self.history.lock().clone()
    }

    /// Published messages with the given routing key.
    pub fn published_with(&self, key: RoutingKey) -> Vec<Message> {
        self.history.lock().iter().filter(|m| m.routing_key() == key).cloned().collect()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        self.history.lock().push(message.clone());
        // No receivers is not an error: nobody is listening for that key.
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self, keys: &[RoutingKey]) -> Result<Subscription, BusError> {
        let mut source = self.tx.subscribe();
        let keys = keys.to_vec();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) if keys.contains(&message.routing_key()) => {
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}
