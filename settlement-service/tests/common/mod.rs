#![allow(dead_code)]

use std::{net::TcpListener, sync::Arc};

use once_cell::sync::Lazy;
use serde_json::Value;
use settlement_service::{
    auth::IdentityProvider,
    engine::{FeeRate, Ledger, LedgerPolicy},
    events::ChangeFeed,
    model::{Posting, Profile, Role, TransactionType},
    store::{LedgerStore, MemoryStore},
    telemetry::{get_subscriber, init_subscriber},
};
use uuid::Uuid;

static TRACING: Lazy<()> = Lazy::new(|| {
    let default_filter_level = "info".to_string();
    let subscriber_name = "test".to_string();

    if std::env::var("TEST_LOG").is_ok() {
        let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::stdout);
        init_subscriber(subscriber);
    } else {
        let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::sink);
        init_subscriber(subscriber);
    };
});

pub const HOUSE: Uuid = Uuid::from_u128(0xf001);

/// Accepts a user's id as their bearer token.
struct IdTokens;

impl IdentityProvider for IdTokens {
    fn resolve(&self, token: &str) -> Option<Uuid> {
        token.parse().ok()
    }
}

pub struct TestApp {
    pub address: String,
    pub store: Arc<MemoryStore>,
    pub admin: Uuid,
    pub client: reqwest::Client,
}

pub async fn spawn_app() -> TestApp {
    Lazy::force(&TRACING);

    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(Ledger::new(
        store.clone(),
        ChangeFeed::new(),
        LedgerPolicy {
            fee: FeeRate::from_bps(500).unwrap(),
            house_account: HOUSE,
            allow_negative_adjustments: true,
        },
    ));
    ledger.bootstrap().await.expect("Failed to bootstrap ledger.");

    let server = settlement_service::run(listener, ledger, Arc::new(IdTokens))
        .await
        .expect("Server initialization failed.");
    tokio::spawn(server);

    let app = TestApp {
        address,
        store,
        admin: Uuid::new_v4(),
        client: reqwest::Client::new(),
    };
    app.profile(app.admin, Role::Admin).await;
    app
}

impl TestApp {
    async fn profile(&self, user_id: Uuid, role: Role) {
        self.store
            .insert_profile(&Profile { user_id, role })
            .await
            .expect("Failed to create profile.");
    }

    /// Creates a regular user holding `balance`.
    pub async fn funded_user(&self, balance: i64) -> Uuid {
        let user = Uuid::new_v4();
        self.profile(user, Role::User).await;
        if balance != 0 {
            self.store
                .post(&Posting::new(user, balance, TransactionType::Deposit, "seed"))
                .await
                .expect("Failed to fund user.");
        }
        user
    }

    pub async fn balance(&self, user: Uuid) -> i64 {
        self.store
            .wallet(user)
            .await
            .unwrap()
            .expect("Missing wallet.")
            .balance
    }

    pub async fn post_json(&self, caller: Uuid, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(&format!("{}{}", &self.address, path))
            .bearer_auth(caller)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request.")
    }

    pub async fn get(&self, caller: Uuid, path: &str) -> reqwest::Response {
        self.client
            .get(&format!("{}{}", &self.address, path))
            .bearer_auth(caller)
            .send()
            .await
            .expect("Failed to execute request.")
    }

    pub async fn delete(&self, caller: Uuid, path: &str) -> reqwest::Response {
        self.client
            .delete(&format!("{}{}", &self.address, path))
            .bearer_auth(caller)
            .send()
            .await
            .expect("Failed to execute request.")
    }

    /// Creates an open round with the given options and returns its id.
    pub async fn open_round(&self, options: &[&str]) -> Uuid {
        let response = self
            .post_json(
                self.admin,
                "/rounds",
                serde_json::json!({ "title": "Who wins?", "options": options }),
            )
            .await;
        assert_eq!(201, response.status().as_u16());
        let round: Value = response.json().await.unwrap();
        round["id"].as_str().unwrap().parse().unwrap()
    }

    pub async fn place_bet(&self, user: Uuid, round_id: Uuid, option: &str, amount: i64) -> Value {
        let response = self
            .post_json(
                user,
                &format!("/rounds/{}/bets", round_id),
                serde_json::json!({ "option": option, "amount": amount }),
            )
            .await;
        assert_eq!(201, response.status().as_u16());
        response.json().await.unwrap()
    }

    pub async fn lock(&self, round_id: Uuid) {
        let response = self
            .post_json(
                self.admin,
                &format!("/rounds/{}/lock", round_id),
                serde_json::json!({}),
            )
            .await;
        assert_eq!(200, response.status().as_u16());
    }
}
