//! Bookstore Commerce - order fulfillment and wallet service

use anyhow::Result;
use bookstore_commerce::{api, events::EventPublisher, store::PgStore, Config, Engine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let store = PgStore::connect(&config.database_url, config.max_connections).await?;
    store.migrate().await?;

    let nats = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unavailable, domain events will not be published");
                None
            }
        },
        None => None,
    };

    let events = EventPublisher::new(nats);
    tracing::info!(
        stacking = ?config.policies.offer_stacking,
        coupon_on_cancel = ?config.policies.coupon_on_cancel,
        events = events.is_enabled(),
        "policies loaded"
    );
    let engine = Engine::new(store, config.policies.clone(), events);
    let app = api::router(engine);

    tracing::info!("Bookstore commerce listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}
