use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{Bet, Round};

const FEED_CAPACITY: usize = 1024;

/// Change notification published after every committed ledger write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LedgerEvent {
    RoundUpdated {
        round: Round,
    },
    BetChanged {
        bet: Bet,
    },
    #[serde(rename_all = "camelCase")]
    WalletChanged {
        user_id: Uuid,
        balance: i64,
        transaction_id: Uuid,
    },
}

impl LedgerEvent {
    /// Id of the entity the event is about, used as a partitioning key.
    pub fn key(&self) -> Uuid {
        match self {
            LedgerEvent::RoundUpdated { round } => round.id,
            LedgerEvent::BetChanged { bet } => bet.round_id,
            LedgerEvent::WalletChanged { user_id, .. } => *user_id,
        }
    }
}

#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<LedgerEvent>,
}

impl ChangeFeed {
    pub fn new() -> ChangeFeed {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        ChangeFeed { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: LedgerEvent) {
        // Only fails when nobody is listening.
        if self.sender.send(event).is_err() {
            tracing::trace!("Change feed has no subscribers");
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        ChangeFeed::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let feed = ChangeFeed::new();
        let mut receiver = feed.subscribe();
        let user_id = Uuid::new_v4();

        feed.publish(LedgerEvent::WalletChanged {
            user_id,
            balance: 7,
            transaction_id: Uuid::nil(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.key(), user_id);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "walletChanged");
        assert_eq!(json["balance"], 7);
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        ChangeFeed::new().publish(LedgerEvent::WalletChanged {
            user_id: Uuid::nil(),
            balance: 0,
            transaction_id: Uuid::nil(),
        });
    }
}
