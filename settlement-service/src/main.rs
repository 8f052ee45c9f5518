use std::{net::TcpListener, sync::Arc};

use settlement_service::{
    auth::StaticTokens,
    configuration::get_configuration,
    engine::Ledger,
    events::ChangeFeed,
    run,
    store::build_store,
    telemetry::{get_subscriber, init_subscriber},
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let subscriber = get_subscriber(
        "settlement-service".to_string(),
        "info".to_string(),
        std::io::stdout,
    );
    init_subscriber(subscriber);

    let configuration = get_configuration().expect("Failed to read configuration.");
    let policy = configuration
        .settlement
        .policy()
        .expect("Invalid settlement configuration.");

    let store = build_store(&configuration.database)
        .await
        .expect("Failed to open the ledger store.");
    let feed = ChangeFeed::new();

    #[cfg(feature = "kafka")]
    if let Some(kafka) = &configuration.kafka {
        let forwarder = settlement_service::kafka::FeedForwarder::new(kafka, feed.subscribe())
            .expect("Failed to create Kafka producer.");
        tokio::spawn(forwarder.run());
    }

    let ledger = Arc::new(Ledger::new(store, feed, policy));
    ledger
        .bootstrap()
        .await
        .expect("Failed to prepare the house account.");

    let identity = Arc::new(StaticTokens::from_settings(&configuration.auth));

    let listener = TcpListener::bind(configuration.application.address())?;
    tracing::info!(address = %configuration.application.address(), "Starting settlement service");
    let server = run(listener, ledger, identity).await?;
    server.await
}
