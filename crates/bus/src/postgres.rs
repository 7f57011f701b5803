//! Bus over Postgres `LISTEN` / `NOTIFY`.
//!
//! One notification channel plays the role of the exchange; the routing key
//! travels inside the JSON payload and each subscriber filters on it.  This
//! lets every replica that shares the database share the bus too.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::retry::with_constant_wait;
use crate::{Bus, BusError, Message, RoutingKey, Subscription, SUBSCRIPTION_BUFFER};

/// Notification channel used as the exchange.
pub const EXCHANGE: &str = "superplane_exchange";

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_WAIT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct PgBus {
    pool: PgPool,
}

impl PgBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn listen(pool: &PgPool) -> Result<PgListener, BusError> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(EXCHANGE).await?;
        Ok(listener)
    }
}

#[async_trait]
impl Bus for PgBus {
    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        let payload = serde_json::to_string(message)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(EXCHANGE)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        debug!(routing_key = %message.routing_key(), "published");
        Ok(())
    }

    async fn subscribe(&self, keys: &[RoutingKey]) -> Result<Subscription, BusError> {
        // The first connection is made eagerly so a misconfigured bus fails
        // at startup instead of inside a background task.
        let mut listener =
            with_constant_wait(CONNECT_ATTEMPTS, CONNECT_WAIT, || Self::listen(&self.pool)).await?;
        info!(?keys, "subscribed to bus");

        let pool = self.pool.clone();
        let keys = keys.to_vec();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let message: Message = match serde_json::from_str(notification.payload()) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!(error = %err, "dropping malformed bus message");
                                continue;
                            }
                        };
                        if !keys.contains(&message.routing_key()) {
                            continue;
                        }
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "bus connection lost, reconnecting");
                        listener = loop {
                            if tx.is_closed() {
                                return;
                            }
                            match with_constant_wait(CONNECT_ATTEMPTS, CONNECT_WAIT, || {
                                Self::listen(&pool)
                            })
                            .await
                            {
                                Ok(listener) => break listener,
                                Err(err) => warn!(error = %err, "bus still unreachable"),
                            }
                        };
                    }
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}
