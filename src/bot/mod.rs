//! # Bot Module
//!
//! Discord glue for GuildTunes.
//!
//! ## Architecture
//!
//! The bot is built around the [`GuildTunesBot`] struct which implements
//! Serenity's [`EventHandler`] trait. It owns:
//!
//! - Playback through the [`PlaybackEngine`]
//! - Saved playlists and role requirements through [`PlaylistManager`] and [`RoleManager`]
//! - The per-guild document store shared by both
//!
//! Slash commands and prefixed messages go through the same
//! [`handlers::dispatch`], so both surfaces behave identically.

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Message, Ready, VoiceState},
    async_trait,
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage},
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    audio::{PlaybackEngine, SongbirdSession},
    config::Config,
    error::MusicError,
    sources::ytdlp::YtDlpResolver,
    storage::{DocumentStore, PlaylistManager, RoleManager},
};
use handlers::{Invoker, Request};

/// Interval of the background maintenance pass.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);

/// Main Discord event handler.
///
/// All fields are cheap handles: the engine clones its `Arc`s and every
/// manager is shared with the shutdown coordinator.
pub struct GuildTunesBot {
    pub(crate) config: Arc<Config>,
    pub(crate) engine: PlaybackEngine,
    pub(crate) playlists: Arc<PlaylistManager>,
    pub(crate) roles: Arc<RoleManager>,
    store: Arc<DocumentStore>,
    resolver: Arc<YtDlpResolver>,
    // `ready` fires again after every gateway reconnect
    maintenance_started: AtomicBool,
}

impl GuildTunesBot {
    pub fn new(
        config: Arc<Config>,
        engine: PlaybackEngine,
        playlists: Arc<PlaylistManager>,
        roles: Arc<RoleManager>,
        store: Arc<DocumentStore>,
        resolver: Arc<YtDlpResolver>,
    ) -> Self {
        Self {
            config,
            engine,
            playlists,
            roles,
            store,
            resolver,
            maintenance_started: AtomicBool::new(false),
        }
    }

    /// Registers slash commands, per guild when `GUILD_ID` is set.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registering slash commands...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ The bot is not in the configured guild {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id)
                    .await
                    .map_err(|e| {
                        error!("❌ Error registering guild commands: {:?}", e);
                        anyhow::anyhow!("Could not register guild commands; check the 'applications.commands' scope")
                    })?;
                info!("✅ Guild commands registered for: {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registering global commands: {:?}", e);
                    anyhow::anyhow!("Could not register global commands; check the 'applications.commands' scope")
                })?;
                info!("✅ Global commands registered");
            }
        }

        Ok(())
    }

    /// Joins `channel_id` (bounded by the connect timeout) and starts a
    /// playback session announcing to `text_channel`.
    pub async fn join_voice_channel(
        &self,
        ctx: &Context,
        guild_id: GuildId,
        channel_id: ChannelId,
        text_channel: ChannelId,
    ) -> Result<()> {
        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird is not initialized"))?;

        let call = match tokio::time::timeout(
            self.config.connect_timeout(),
            manager.join(guild_id, channel_id),
        )
        .await
        {
            Ok(Ok(call)) => call,
            Ok(Err(e)) => {
                error!("Error getting the voice handler: {:?}", e);
                let _ = manager.remove(guild_id).await;
                return Err(MusicError::validation("Could not join your voice channel").into());
            }
            Err(_) => {
                warn!("⏱️ Voice connection timed out in guild {}", guild_id);
                let _ = manager.remove(guild_id).await;
                return Err(MusicError::validation("Timed out joining the voice channel").into());
            }
        };

        let session = SongbirdSession::new(
            guild_id,
            call,
            manager.clone(),
            ctx.cache.clone(),
            ctx.cache.current_user().id,
            self.config.ffmpeg_path.clone(),
        );
        if let Err(e) = self.engine.attach(guild_id, Arc::new(session), text_channel) {
            let _ = manager.remove(guild_id).await;
            return Err(e.into());
        }

        info!("🔊 Connected to the voice channel in guild {}", guild_id);
        Ok(())
    }

    /// The bot's own voice state changed.
    async fn handle_own_voice_state(&self, ctx: &Context, guild_id: GuildId, old: Option<&VoiceState>, new: &VoiceState) {
        let Some(handle) = self.engine.guilds().get(guild_id) else {
            return;
        };

        match new.channel_id {
            None => {
                if handle.with_state(|s| s.handling_disconnect_action) {
                    return;
                }
                info!("🔌 Bot disconnected in guild {}", guild_id);
                handle.with_state(|s| {
                    s.handling_disconnect_action = true;
                    s.stop_flag = s.current_track.is_some();
                });
                handle.voice().stop().await;
                if let Some(manager) = songbird::get(ctx).await {
                    let _ = manager.remove(guild_id).await;
                }
                self.engine.cleanup_guild(guild_id);
            }
            Some(channel) => {
                let moved = old.and_then(|o| o.channel_id).is_some_and(|c| c != channel);
                if !moved {
                    return;
                }
                info!("🚚 Moved to <#{}> in guild {}", channel, guild_id);
                handle.with_state(|s| s.handling_move_action = true);
                let left = self.engine.leave_if_alone(&handle).await;
                if !left {
                    handle.with_state(|s| s.handling_move_action = false);
                }
            }
        }
    }
}

#[async_trait]
impl EventHandler for GuildTunesBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} servers", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error registering commands: {:?}", e);
        }

        if self.maintenance_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = self.store.clone();
        let resolver = self.resolver.clone();
        tokio::spawn(async move {
            maintenance_tasks(store, resolver).await;
        });
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };

        let Some(guild_id) = command.guild_id else {
            let response = CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content("❌ Commands only work inside a server")
                    .ephemeral(true),
            );
            if let Err(e) = command.create_response(&ctx.http, response).await {
                error!("Error responding to command: {:?}", e);
            }
            return;
        };

        // Lookups and joins can outlast the 3 second response window
        if let Err(e) = command.defer(&ctx.http).await {
            error!("Error deferring /{}: {:?}", command.data.name, e);
            return;
        }

        let invoker = Invoker::from_interaction(&command, guild_id);
        let request = Request::from_slash(&command);
        let reply = handlers::dispatch(&ctx, self, &invoker, &request).await;
        if let Err(e) = reply.edit_interaction(&ctx, &command).await {
            error!("Error handling command: {:?}", e);
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };
        let Some(request) = Request::from_prefix(&msg.content, &self.config.command_prefix) else {
            return;
        };

        let invoker = Invoker::from_message(&ctx, &msg, guild_id);
        let reply = handlers::dispatch(&ctx, self, &invoker, &request).await;
        if let Err(e) = reply.send_to_channel(&ctx, msg.channel_id).await {
            error!("Error replying to {}: {:?}", request.name, e);
        }
    }

    /// Tracks external disconnects, moves and the channel emptying out.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };

        let bot_id = ctx.cache.current_user().id;
        if new.user_id == bot_id {
            self.handle_own_voice_state(&ctx, guild_id, old.as_ref(), &new).await;
            return;
        }

        let Some(handle) = self.engine.guilds().get(guild_id) else {
            return;
        };
        let left_channel = old
            .as_ref()
            .and_then(|o| o.channel_id)
            .is_some_and(|c| new.channel_id != Some(c));
        let busy = handle.with_state(|s| s.handling_disconnect_action || s.handling_move_action);

        if left_channel && !busy {
            debug!(
                "👤 {} left a voice channel in guild {} ({:?})",
                new.user_id,
                guild_id,
                handle.phase()
            );
            self.engine.leave_if_alone(&handle).await;
        }
    }
}

/// Periodic housekeeping: expired document cache entries and a yt-dlp/ffmpeg
/// availability check.
async fn maintenance_tasks(store: Arc<DocumentStore>, resolver: Arc<YtDlpResolver>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);

    loop {
        interval.tick().await;

        let purged = store.purge_expired();
        if purged > 0 {
            debug!("🧹 {} cached documents expired", purged);
        }

        if let Err(e) = resolver.verify_dependencies().await {
            warn!("Error checking dependencies: {:?}", e);
        }

        info!("🧹 Maintenance tasks completed");
    }
}
