use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

mod audio;
mod bot;
mod cache;
mod config;
mod sources;
mod ui;

use crate::audio::player::{log_notices, AudioPlayer};
use crate::bot::commands::{CommandRegistry, Dispatcher};
use crate::bot::gateway::SerenityConnector;
use crate::bot::maintenance_tasks;
use crate::bot::session::SessionManager;
use crate::cache::MetadataCache;
use crate::config::Config;
use crate::sources::YtDlpLoader;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voice_streamer=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting Voice Streamer v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    debug!("{}", config.summary());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let cache = MetadataCache::new(config.cache_size, Some(config.metadata_ttl));
    let loader = Arc::new(YtDlpLoader::new(&config, cache.clone()));

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&loader).await;
    }

    if let Err(e) = loader.verify_dependencies().await {
        warn!("⚠️ {:?}", e);
    }

    let (player, notices) =
        AudioPlayer::new(loader.clone(), config.default_volume, config.max_queue_size);
    tokio::spawn(log_notices(notices));

    let dispatcher = Arc::new(Dispatcher::new(
        CommandRegistry::standard(),
        player.clone(),
        config.delete_after,
        config.message_limit,
    ));

    let session = SessionManager::new(
        SerenityConnector::new(config.credentials.clone(), dispatcher),
        config.reconnect_cooldown,
    );
    let exit = session.exit_signal();

    tokio::spawn(maintenance_tasks(
        player,
        cache,
        loader,
        config.maintenance_interval,
        config.idle_timeout,
        exit.clone(),
    ));

    if let Err(e) = session.start().await {
        error!("❌ Could not log in: {}", e);
        session.terminate().await;
        return Err(e.into());
    }

    let signal_session = session.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("⚠️ Shutdown signal received, closing...");
                signal_session.terminate().await;
            }
            Err(e) => error!("Could not listen for Ctrl+C: {}", e),
        }
    });

    info!("🚀 Bot started");
    exit.cancelled().await;

    info!("👋 Bye");
    Ok(())
}

async fn health_check(loader: &YtDlpLoader) -> Result<()> {
    loader.verify_dependencies().await?;
    println!("OK");
    Ok(())
}
