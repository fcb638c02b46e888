use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use songbird::SerenityInit;
use std::sync::Arc;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod cache;
mod config;
mod error;
mod shutdown;
mod sources;
mod storage;
mod ui;

use crate::audio::{GuildStateStore, HttpAnnouncer, PlaybackEngine};
use crate::bot::GuildTunesBot;
use crate::config::Config;
use crate::shutdown::{Lockdown, ShutdownCoordinator};
use crate::sources::YtDlpResolver;
use crate::storage::{DocumentStore, PlaylistManager, RoleManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guildtunes=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting GuildTunes v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    // Per-guild storage
    let lockdown = Arc::new(Lockdown::default());
    let store = Arc::new(DocumentStore::new(config.store_settings(), lockdown.clone()));
    let playlists = Arc::new(PlaylistManager::new(
        store.clone(),
        config.max_name_length,
        config.max_playlist_size,
    ));
    let roles = Arc::new(RoleManager::new(store.clone()));

    let resolver = Arc::new(YtDlpResolver::new(config.ytdlp_path.clone(), config.probe_timeout()));
    if let Err(e) = resolver.verify_dependencies().await {
        warn!("⚠️ {:?}", e);
    }

    // The engine announces through its own HTTP client so it exists before the gateway client
    let announcer = Arc::new(HttpAnnouncer::new(Arc::new(Http::new(&config.discord_token))));
    let engine = PlaybackEngine::new(
        Arc::new(GuildStateStore::new()),
        resolver.clone(),
        announcer,
        store.clone(),
        lockdown.clone(),
        config.playback_settings(),
    );
    let coordinator = ShutdownCoordinator::new(lockdown, store.clone(), engine.clone());
    let drain_timeout = config.drain_timeout();

    // Minimal intents
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let handler = GuildTunesBot::new(config.clone(), engine, playlists, roles, store, resolver);

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird()
        .await?;

    // Graceful shutdown
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error registering Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Shutdown signal received, closing...");
        coordinator.run(drain_timeout).await;
        shard_manager.shutdown_all().await;
        std::process::exit(0);
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Error running the client: {:?}", why);
    }

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let yt_dlp = tokio::process::Command::new(&config.ytdlp_path)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = tokio::process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Missing dependencies");
    }
}
