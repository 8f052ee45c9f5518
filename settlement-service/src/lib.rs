use std::{net::TcpListener, sync::Arc};

use actix_web::{dev::Server, web, App, HttpServer};
use tracing_actix_web::TracingLogger;

use crate::{auth::IdentityProvider, engine::Ledger};

pub mod auth;
pub mod configuration;
pub mod engine;
pub mod error;
pub mod events;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod model;
pub mod routes;
pub mod store;
pub mod telemetry;

pub async fn run(
    listener: TcpListener,
    ledger: Arc<Ledger>,
    identity: Arc<dyn IdentityProvider>,
) -> Result<Server, std::io::Error> {
    let ledger = web::Data::from(ledger);
    let identity: web::Data<dyn IdentityProvider> = web::Data::from(identity);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(ledger.clone())
            .app_data(identity.clone())
            .service(routes::health_check)
            .service(routes::settle)
            .service(routes::refund)
            .service(routes::adjust_balance)
            .service(routes::create_profile)
            .service(routes::create_round)
            .service(routes::get_round)
            .service(routes::lock_round)
            .service(routes::unlock_round)
            .service(routes::reset_round)
            .service(routes::place_bet)
            .service(routes::cancel_bet)
            .service(routes::get_wallet)
            .service(routes::transactions)
            .service(routes::transactions_by_type)
    })
    .listen(listener)?
    .run();

    Ok(server)
}
