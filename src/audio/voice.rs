//! Seams between the playback engine and Discord.
//!
//! [`VoiceSession`] is the voice connection of one guild, [`Announcer`]
//! posts text into a channel. The songbird/serenity implementations live
//! here too; tests substitute in-memory fakes.

use async_trait::async_trait;
use serenity::all::{Cache, ChannelId, GuildId, Http, UserId};
use songbird::{
    input::{ChildContainer, Input},
    tracks::{PlayMode, TrackHandle},
    Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{MusicError, MusicResult};

const PLAYABLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Messages processed by a guild's control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The audio source terminated, naturally or with an error.
    Ended { error: Option<String> },
    /// The guild was destroyed; the loop exits.
    Shutdown,
}

/// Handle given to the audio source so it can report termination.
///
/// It only posts a message; the guild's control loop does the work.
#[derive(Debug, Clone)]
pub struct PlaybackEndNotifier {
    guild_id: GuildId,
    tx: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackEndNotifier {
    pub fn new(guild_id: GuildId, tx: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self { guild_id, tx }
    }

    /// Termination callback of the audio source.
    pub fn handle_playback_end(&self, error: Option<String>) {
        if let Some(e) = &error {
            error!("❌ Playback error in guild {}: {}", self.guild_id, e);
        }
        if self.tx.send(PlaybackEvent::Ended { error }).is_err() {
            debug!("Control loop of guild {} already closed", self.guild_id);
        }
    }
}

/// Active voice connection of one guild.
#[async_trait]
pub trait VoiceSession: Send + Sync {
    /// Spawns the transcoder for `stream_url` at `position` and plays it,
    /// replacing whatever was playing.
    async fn play(&self, stream_url: &str, position: Duration, on_end: PlaybackEndNotifier) -> MusicResult<()>;

    async fn pause(&self) -> MusicResult<()>;

    async fn resume(&self) -> MusicResult<()>;

    /// Stops the current source; its end notification still fires.
    async fn stop(&self);

    /// Leaves the channel, giving up after `timeout`. True on a clean leave.
    async fn disconnect(&self, timeout: Duration) -> bool;

    async fn is_connected(&self) -> bool;

    /// Non-bot members in the bot's voice channel.
    async fn listener_count(&self) -> usize;
}

/// Posts user-visible messages.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, channel: ChannelId, text: &str);
}

/// Announcer over the serenity HTTP client.
pub struct HttpAnnouncer {
    http: Arc<Http>,
}

impl HttpAnnouncer {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Announcer for HttpAnnouncer {
    async fn announce(&self, channel: ChannelId, text: &str) {
        if let Err(e) = channel.say(&self.http, text).await {
            warn!("Could not send message to {}: {:?}", channel, e);
        }
    }
}

/// Voice session backed by a songbird call and an ffmpeg child process.
pub struct SongbirdSession {
    guild_id: GuildId,
    call: Arc<Mutex<Call>>,
    manager: Arc<Songbird>,
    cache: Arc<Cache>,
    bot_user: UserId,
    ffmpeg_path: PathBuf,
    current: parking_lot::Mutex<Option<TrackHandle>>,
}

impl SongbirdSession {
    pub fn new(
        guild_id: GuildId,
        call: Arc<Mutex<Call>>,
        manager: Arc<Songbird>,
        cache: Arc<Cache>,
        bot_user: UserId,
        ffmpeg_path: PathBuf,
    ) -> Self {
        Self {
            guild_id,
            call,
            manager,
            cache,
            bot_user,
            ffmpeg_path,
            current: parking_lot::Mutex::new(None),
        }
    }

    fn spawn_transcoder(&self, stream_url: &str, position: Duration) -> MusicResult<Input> {
        let child = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"])
            .args(["-ss", &format!("{:.3}", position.as_secs_f64())])
            .args(["-i", stream_url])
            .args(["-vn", "-f", "wav", "-ac", "2", "-ar", "48000", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MusicError::stream(format!("ffmpeg could not start: {e}")))?;

        Ok(ChildContainer::from(child).into())
    }

    fn current_handle(&self) -> MusicResult<TrackHandle> {
        self.current.lock().clone().ok_or(MusicError::NotConnected)
    }
}

#[async_trait]
impl VoiceSession for SongbirdSession {
    async fn play(&self, stream_url: &str, position: Duration, on_end: PlaybackEndNotifier) -> MusicResult<()> {
        let input = self.spawn_transcoder(stream_url, position)?;

        let handle = {
            let mut call = self.call.lock().await;
            call.play_only_input(input)
        };

        match tokio::time::timeout(PLAYABLE_TIMEOUT, handle.make_playable_async()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.stop();
                return Err(MusicError::stream(format!("source not playable: {e:?}")));
            }
            Err(_) => {
                let _ = handle.stop();
                return Err(MusicError::stream("source took too long to start"));
            }
        }

        // Registered only once playable so a failed start is reported once
        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(Event::Track(event), TrackEndRelay { notifier: on_end.clone() })
                .map_err(|e| MusicError::stream(format!("could not watch track: {e:?}")))?;
        }

        *self.current.lock() = Some(handle);
        debug!("▶️ Source attached in guild {} at {:?}", self.guild_id, position);
        Ok(())
    }

    async fn pause(&self) -> MusicResult<()> {
        self.current_handle()?
            .pause()
            .map_err(|e| MusicError::stream(format!("pause failed: {e:?}")))
    }

    async fn resume(&self) -> MusicResult<()> {
        self.current_handle()?
            .play()
            .map_err(|e| MusicError::stream(format!("resume failed: {e:?}")))
    }

    async fn stop(&self) {
        if let Some(handle) = self.current.lock().take() {
            let _ = handle.stop();
        }
    }

    async fn disconnect(&self, timeout: Duration) -> bool {
        self.stop().await;
        match tokio::time::timeout(timeout, self.manager.remove(self.guild_id)).await {
            Ok(Ok(())) => {
                info!("👋 Left voice in guild {}", self.guild_id);
                true
            }
            Ok(Err(e)) => {
                warn!("Leaving voice in guild {} failed: {:?}", self.guild_id, e);
                false
            }
            Err(_) => {
                warn!("⏱️ Voice disconnect timed out in guild {}", self.guild_id);
                false
            }
        }
    }

    async fn is_connected(&self) -> bool {
        self.call.lock().await.current_connection().is_some()
    }

    async fn listener_count(&self) -> usize {
        let channel = match self.call.lock().await.current_channel() {
            Some(channel) => ChannelId::from(channel.0),
            None => return 0,
        };

        let Some(guild) = self.cache.guild(self.guild_id) else {
            return 0;
        };

        guild
            .voice_states
            .values()
            .filter(|vs| vs.channel_id == Some(channel) && vs.user_id != self.bot_user)
            .filter(|vs| !vs.member.as_ref().is_some_and(|m| m.user.bot))
            .count()
    }
}

/// Forwards songbird end/error events to the guild's control loop.
struct TrackEndRelay {
    notifier: PlaybackEndNotifier,
}

#[async_trait]
impl VoiceEventHandler for TrackEndRelay {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let error = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(format!("{e:?}")),
                _ => None,
            }),
            _ => None,
        };

        self.notifier.handle_playback_end(error);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notifier_posts_to_control_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = PlaybackEndNotifier::new(GuildId::new(1), tx);

        notifier.handle_playback_end(None);
        notifier.handle_playback_end(Some("broken pipe".into()));

        assert_eq!(rx.recv().await, Some(PlaybackEvent::Ended { error: None }));
        assert_eq!(
            rx.recv().await,
            Some(PlaybackEvent::Ended { error: Some("broken pipe".into()) })
        );
    }

    #[test]
    fn test_notifier_survives_closed_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        PlaybackEndNotifier::new(GuildId::new(1), tx).handle_playback_end(None);
    }
}
