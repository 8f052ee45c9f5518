//! Publishes the change feed to a Kafka topic.

use rdkafka::{
    error::KafkaError,
    producer::{FutureProducer, FutureRecord},
    ClientConfig,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Duration;

use crate::configuration::KafkaSettings;
use crate::events::LedgerEvent;

pub struct FeedForwarder {
    producer: FutureProducer,
    topic: String,
    events: broadcast::Receiver<LedgerEvent>,
}

impl FeedForwarder {
    pub fn new(
        settings: &KafkaSettings,
        events: broadcast::Receiver<LedgerEvent>,
    ) -> Result<FeedForwarder, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(FeedForwarder {
            producer,
            topic: settings.topic.clone(),
            events,
        })
    }

    /// Forwards events until the feed is closed.
    pub async fn run(mut self) {
        loop {
            match self.events.recv().await {
                Ok(event) => self.forward(&event).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Kafka forwarder fell behind the change feed");
                }
                Err(RecvError::Closed) => {
                    tracing::info!("Change feed closed, stopping Kafka forwarder");
                    break;
                }
            }
        }
    }

    async fn forward(&self, event: &LedgerEvent) {
        let (key, payload) = match record_parts(event) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize ledger event");
                return;
            }
        };

        let status = self
            .producer
            .send(
                FutureRecord::to(&self.topic).payload(&payload).key(&key),
                Duration::from_secs(0),
            )
            .await;

        match status {
            Ok((partition, offset)) => {
                tracing::debug!(%key, partition, offset, "Ledger event published");
            }
            Err((e, _)) => {
                tracing::error!(%key, error = %e, "Failed to publish ledger event");
            }
        }
    }
}

fn record_parts(event: &LedgerEvent) -> Result<(String, String), serde_json::Error> {
    Ok((event.key().to_string(), serde_json::to_string(event)?))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn wallet_events_are_keyed_by_user() {
        let user_id = Uuid::new_v4();
        let (key, payload) = record_parts(&LedgerEvent::WalletChanged {
            user_id,
            balance: 40,
            transaction_id: Uuid::nil(),
        })
        .unwrap();

        assert_eq!(key, user_id.to_string());
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["event"], "walletChanged");
        assert_eq!(json["userId"], user_id.to_string());
    }
}
