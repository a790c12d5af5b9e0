//! parkun-bot - coordination core of a traffic-violation reporting bot
//!
//! Users assemble complaints in a Telegram chat; headless workers submit
//! them to the authorities' portal, relaying the portal's captcha back to
//! the user. This process owns the conversations, the worker pool and the
//! captcha deadlines.

mod appeal;
mod config;
mod ids;
mod notice;
mod pool;
mod protocol;
mod runtime;
mod services;
mod state_machine;
mod store;
mod telegram;
mod timer;
mod validation;

use config::BotConfig;
use futures::StreamExt;
use pool::WorkerPool;
use protocol::{EventDispatcher, NatsBroker, ProtocolClient};
use runtime::{RuntimeManager, Services};
use services::{HttpMailVerifier, LocalPhotoStorage, NominatimGeocoder};
use std::sync::Arc;
use store::SqliteStore;
use telegram::TelegramClient;
use timer::CancellationTimer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parkun_bot=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = BotConfig::from_env()?;
    tracing::info!(
        nats = %config.nats_url,
        subject = %config.event_subject,
        captcha_timeout_secs = config.session.captcha_timeout.as_secs(),
        database = %config.database_path.display(),
        "Configuration loaded"
    );

    let broker = NatsBroker::connect(&config.nats_url).await?;
    let telegram = Arc::new(TelegramClient::new(
        &config.telegram_api_url,
        &config.telegram_token,
    )?);
    let store = Arc::new(SqliteStore::open(&config.database_path)?);

    let pool = Arc::new(WorkerPool::new());
    let timer = CancellationTimer::new();
    let services = Arc::new(Services {
        settings: config.session.clone(),
        store: store.clone(),
        bans: store,
        chat: telegram.clone(),
        geocoder: Arc::new(NominatimGeocoder::new(&config.geocoder_url)?),
        mail: Arc::new(HttpMailVerifier::new(config.mail_verifier_url.as_deref())?),
        photos: Arc::new(LocalPhotoStorage::new(
            telegram.clone(),
            config.photo_dir.clone(),
            config.photo_base_url.as_deref(),
        )),
        pool: pool.clone(),
        timer: timer.clone(),
        protocol: ProtocolClient::new(Arc::new(broker.clone())),
    });
    let manager = Arc::new(RuntimeManager::new(services));
    let shutdown = CancellationToken::new();

    // Expired captcha deadlines become events of the owning session
    let (fired_tx, mut fired_rx) = mpsc::channel(64);
    tokio::spawn(timer.run(fired_tx, shutdown.clone()));
    let timeout_router = manager.clone();
    tokio::spawn(async move {
        while let Some(fired) = fired_rx.recv().await {
            let user_id = fired.key.user_id;
            if let Err(e) = timeout_router.send_event(user_id, fired.payload).await {
                tracing::error!(user_id, error = %e, "Failed to route captcha timeout");
            }
        }
    });

    let subscriber = broker.subscribe_events(&config.event_subject).await?;
    let dispatcher = EventDispatcher::new(pool, manager.clone());
    let events = tokio::spawn(dispatcher.run(subscriber.map(|m| m.payload), shutdown.clone()));

    let polling = tokio::spawn(telegram.run_polling(manager.clone(), shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        sessions = manager.active_sessions().await,
        "Shutting down"
    );
    shutdown.cancel();
    let _ = events.await;
    let _ = polling.await;

    Ok(())
}
