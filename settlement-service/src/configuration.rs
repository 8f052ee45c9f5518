use config::{Config, Environment, File};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::{FeeRate, LedgerPolicy};

#[derive(Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub settlement: SettlementSettings,
    pub auth: AuthSettings,
    pub kafka: Option<KafkaSettings>,
}

#[derive(Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
}

impl ApplicationSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Couchbase,
}

#[derive(Deserialize, Clone)]
pub struct DatabaseSettings {
    pub backend: StoreBackend,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub host: String,
    pub bucket_name: String,
    pub scope_name: String,
}

impl DatabaseSettings {
    pub fn connection_string(&self) -> String {
        format!("couchbase://{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize, Clone)]
pub struct SettlementSettings {
    /// Platform fee in basis points, 500 = 5%.
    pub fee_bps: u32,
    pub house_account: Uuid,
    pub allow_negative_adjustments: bool,
}

impl SettlementSettings {
    pub fn policy(&self) -> Result<LedgerPolicy, config::ConfigError> {
        let fee = FeeRate::from_bps(self.fee_bps).map_err(config::ConfigError::Message)?;

        Ok(LedgerPolicy {
            fee,
            house_account: self.house_account,
            allow_negative_adjustments: self.allow_negative_adjustments,
        })
    }
}

#[derive(Deserialize, Clone)]
pub struct AuthSettings {
    pub tokens: Vec<TokenSettings>,
}

/// Bearer token issued to a user by the identity service.
#[derive(Deserialize, Clone)]
pub struct TokenSettings {
    pub token: String,
    pub user_id: Uuid,
}

#[derive(Deserialize, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub topic: String,
}

/// Reads `configuration.yaml` from the working directory, then applies
/// `APP`-prefixed environment overrides, e.g. `APP__SETTLEMENT__FEE_BPS=250`.
pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let settings = Config::builder()
        .add_source(File::with_name("configuration"))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    settings.try_deserialize()
}
