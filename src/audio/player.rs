//! Per-guild playback state machine.
//!
//! [`PlaybackEngine`] drives every guild that holds a voice session:
//!
//! - `play_next` picks the next track (loop pin, filters, random, head) and
//!   hands it to `play_track`, which probes or re-resolves the stream and
//!   attaches a transcoder at the requested position.
//! - Each guild runs a control loop fed by [`PlaybackEvent`]s. The voice
//!   driver only posts `Ended`; the loop calls `play_next` serially, so two
//!   terminations can never advance the queue concurrently.
//! - Before advancing, `check_player_crash` compares the elapsed position
//!   with the track duration and resumes a track that died early.
//! - Seek-family operations respawn the source at a new position with the
//!   stop flag set, so the termination of the old source is swallowed.
//!
//! The playback mutex of a guild is held for the duration of every play,
//! seek and recovery; contention surfaces as `MusicError::LockContention`.

use serenity::model::id::{ChannelId, GuildId};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, MutexGuard};
use tracing::{debug, error, info, warn};

use super::{
    queue::{self, TrackFilters},
    state::{GuildHandle, GuildStateStore},
    voice::{Announcer, PlaybackEvent, VoiceSession},
};
use crate::{
    config::PlaybackSettings,
    error::{MusicError, MusicResult},
    shutdown::Lockdown,
    sources::{ensure_playable, refresh_stream, SourceWebsite, Track, TrackResolver},
    storage::DocumentStore,
};

/// Why a track is (re)started somewhere other than through natural advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayReason {
    Seek,
    Restart,
    Rewind,
    Forward,
    Recovery,
}

/// What `now_playing` reports.
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub track: Track,
    pub position_secs: u64,
    pub paused: bool,
    pub looping: bool,
}

/// Read-only copy of a guild's queue state.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub current: Option<Track>,
    pub queue: Vec<Track>,
    pub history: Vec<Track>,
    pub is_looping: bool,
    pub is_looping_queue: bool,
    pub is_random: bool,
    pub filters: TrackFilters,
}

/// Outcome of `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub added: usize,
    pub position: usize,
    pub started: bool,
}

pub struct PlaybackEngine {
    guilds: Arc<GuildStateStore>,
    resolver: Arc<dyn TrackResolver>,
    announcer: Arc<dyn Announcer>,
    store: Arc<DocumentStore>,
    lockdown: Arc<Lockdown>,
    settings: PlaybackSettings,
}

impl PlaybackEngine {
    pub fn new(
        guilds: Arc<GuildStateStore>,
        resolver: Arc<dyn TrackResolver>,
        announcer: Arc<dyn Announcer>,
        store: Arc<DocumentStore>,
        lockdown: Arc<Lockdown>,
        settings: PlaybackSettings,
    ) -> Self {
        Self {
            guilds,
            resolver,
            announcer,
            store,
            lockdown,
            settings,
        }
    }

    pub fn guilds(&self) -> &Arc<GuildStateStore> {
        &self.guilds
    }

    pub fn resolver(&self) -> &Arc<dyn TrackResolver> {
        &self.resolver
    }

    pub fn settings(&self) -> &PlaybackSettings {
        &self.settings
    }

    fn handle(&self, guild_id: GuildId) -> MusicResult<Arc<GuildHandle>> {
        self.guilds.get(guild_id).ok_or(MusicError::NotConnected)
    }

    fn ensure_voice_open(&self) -> MusicResult<()> {
        if self.lockdown.voice_frozen() {
            return Err(MusicError::Frozen("Voice"));
        }
        Ok(())
    }

    async fn announce(&self, handle: &GuildHandle, text: &str) {
        self.announcer.announce(handle.text_channel(), text).await;
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Registers a freshly joined voice session and starts its control loop.
    pub fn attach(
        &self,
        guild_id: GuildId,
        voice: Arc<dyn VoiceSession>,
        text_channel: ChannelId,
    ) -> MusicResult<Arc<GuildHandle>> {
        self.ensure_voice_open()?;
        let (handle, events) = self.guilds.allocate(guild_id, voice, text_channel);
        tokio::spawn(self.clone().run_control_loop(handle.clone(), events));
        Ok(handle)
    }

    async fn run_control_loop(self, handle: Arc<GuildHandle>, mut events: mpsc::UnboundedReceiver<PlaybackEvent>) {
        let guild_id = handle.guild_id();
        debug!("🔁 Control loop started for guild {}", guild_id);

        while let Some(event) = events.recv().await {
            match event {
                PlaybackEvent::Shutdown => break,
                PlaybackEvent::Ended { .. } => {
                    if !self.guilds.is_current(&handle) {
                        break;
                    }
                    self.play_next(guild_id).await;
                }
            }
        }

        debug!("Control loop stopped for guild {}", guild_id);
    }

    /// Leaves the voice channel (bounded) and destroys the guild's state.
    pub async fn disconnect(&self, guild_id: GuildId, user_initiated: bool) -> MusicResult<()> {
        let handle = self.handle(guild_id)?;
        let voice = handle.with_state(|s| {
            s.handling_disconnect_action = true;
            s.user_disconnect = user_initiated;
            s.pending_cleanup = true;
            s.stop_flag = s.current_track.is_some();
            s.voice.clone()
        });

        if !voice.disconnect(self.settings.disconnect_timeout).await {
            warn!("⚠️ Forced cleanup of guild {} after unclean disconnect", guild_id);
        }
        if handle.with_state(|s| s.user_disconnect) {
            info!("👋 Left voice in guild {} on request", guild_id);
        } else {
            info!("👋 Left voice in guild {}", guild_id);
        }
        self.cleanup_guild(guild_id);
        Ok(())
    }

    /// Drops everything held for a guild that no longer has a voice session.
    pub fn cleanup_guild(&self, guild_id: GuildId) {
        self.guilds.destroy(guild_id);
        self.store.forget_guild(guild_id);
    }

    // ------------------------------------------------------------------
    // Core state machine
    // ------------------------------------------------------------------

    /// Attaches `track` at `position` seconds. Consumes the playback guard
    /// so it is released before the failure path posts its termination.
    pub(crate) async fn play_track(
        &self,
        handle: &GuildHandle,
        guard: MutexGuard<'_, ()>,
        track: Track,
        position: f64,
        reason: Option<PlayReason>,
    ) -> bool {
        let guild_id = handle.guild_id();
        let voice = handle.voice();

        if !voice.is_connected().await {
            warn!("🔇 Guild {} lost its voice connection before playing", guild_id);
            // Back to the head so the next play or enqueue retries it
            handle.with_state(|s| {
                s.current_track = None;
                s.clear_timers();
                if s.track_to_loop.as_ref() != Some(&track) {
                    s.queue.insert(0, track);
                }
            });
            drop(guard);
            return false;
        }

        let playable = match ensure_playable(self.resolver.as_ref(), &track).await {
            Ok(playable) => playable,
            Err(e) => return self.fail_playback(handle, guard, &track, e).await,
        };
        let Some(stream_url) = playable.stream_url().map(str::to_owned) else {
            let e = MusicError::stream(format!("no stream for '{}'", track.title()));
            return self.fail_playback(handle, guard, &track, e).await;
        };

        let position = position.clamp(0.0, playable.duration() as f64);
        let started = voice
            .play(&stream_url, Duration::from_secs_f64(position), handle.end_notifier())
            .await;

        if let Err(e) = started {
            return self.fail_playback(handle, guard, &playable, e).await;
        }

        let history_limit = self.settings.max_history_tracks;
        handle.with_state(|s| {
            let fresh = position == 0.0 && !s.is_looping && reason.is_none();
            if s.is_looping && reason.is_none() && s.track_to_loop.is_none() {
                s.track_to_loop = Some(playable.clone());
            }
            if reason != Some(PlayReason::Recovery) {
                s.crash_recoveries = 0;
            }
            s.current_track = Some(playable.clone());
            s.mark_started(position);
            s.user_interrupted_playback = false;
            if fresh {
                s.push_history(playable.clone(), history_limit);
            }
        });

        info!(
            "🎵 Playing '{}' in guild {} from {:.0}s{}",
            playable.title(),
            guild_id,
            position,
            reason.map(|r| format!(" ({r:?})")).unwrap_or_default()
        );
        true
    }

    async fn fail_playback(&self, handle: &GuildHandle, guard: MutexGuard<'_, ()>, track: &Track, err: MusicError) -> bool {
        error!("❌ Could not play '{}' in guild {}: {}", track.title(), handle.guild_id(), err);

        let voice = handle.with_state(|s| {
            if s.is_looping {
                s.is_looping = false;
                s.track_to_loop = None;
                warn!("🔁 Looping disabled in guild {} after a failed start", handle.guild_id());
            }
            s.current_track = None;
            s.clear_timers();
            s.voice.clone()
        });
        voice.stop().await;
        drop(guard);

        handle.end_notifier().handle_playback_end(Some(err.to_string()));
        false
    }

    /// Advances the guild to its next track.
    pub async fn play_next(&self, guild_id: GuildId) {
        let Some(handle) = self.guilds.get(guild_id) else {
            return;
        };

        if handle.with_state(|s| std::mem::take(&mut s.stop_flag)) {
            debug!("⏹️ Stop flag consumed in guild {}", guild_id);
            return;
        }
        if handle.with_state(|s| s.pending_cleanup) {
            debug!("🧹 Guild {} is being cleaned up, not advancing", guild_id);
            return;
        }
        if handle.voice_client_locked() {
            debug!("🔒 Playback busy in guild {}, skipping advance", guild_id);
            return;
        }
        if self.lockdown.voice_frozen() {
            return;
        }
        if self.leave_if_alone(&handle).await {
            return;
        }
        if self.check_player_crash(&handle).await {
            return;
        }

        let Ok(guard) = handle.try_lock_playback() else {
            return;
        };

        let next = handle.with_state(|s| {
            let loop_pinned = s.is_looping && s.track_to_loop.is_some();
            if s.queue.is_empty() && s.queue_to_loop.is_empty() && !loop_pinned {
                s.current_track = None;
                s.clear_timers();
                return None;
            }

            if s.queue.is_empty() && !s.queue_to_loop.is_empty() {
                s.queue = s.queue_to_loop.clone();
                debug!("🔂 Queue refilled from loop snapshot in guild {}", guild_id);
            }

            let track = if loop_pinned {
                s.track_to_loop.clone()
            } else if !s.filters.is_empty() {
                queue::find_next_filtered_track(&mut s.queue, &s.filters)
            } else if s.is_random {
                queue::take_random_track(&mut s.queue)
            } else if s.queue.is_empty() {
                None
            } else {
                Some(s.queue.remove(0))
            };
            track.map(|t| (t, loop_pinned))
        });

        let Some((track, looping)) = next else {
            drop(guard);
            info!("📭 Queue finished in guild {}", guild_id);
            self.announce(&handle, "📭 Queue is empty").await;
            return;
        };

        let title = track.title().to_string();
        if self.play_track(&handle, guard, track, 0.0, None).await && !looping {
            self.announce(&handle, &format!("🎵 Now playing: {title}")).await;
        }
    }

    /// Disconnects when nobody but bots is left. True when it did.
    pub async fn leave_if_alone(&self, handle: &GuildHandle) -> bool {
        if handle.voice().listener_count().await > 0 {
            return false;
        }

        info!("👥 Voice channel empty in guild {}, leaving", handle.guild_id());
        self.announce(handle, "👋 Everyone left, disconnecting").await;
        if let Err(e) = self.disconnect(handle.guild_id(), false).await {
            debug!("Disconnect of empty channel failed: {}", e);
        }
        true
    }

    /// Detects a track that ended well short of its duration and resumes it.
    /// True when recovery took over this advance.
    pub(crate) async fn check_player_crash(&self, handle: &GuildHandle) -> bool {
        let guild_id = handle.guild_id();
        let grace = self.settings.crash_grace.as_secs_f64();

        let crashed = handle.with_state(|s| {
            let track = s.current_track.clone()?;
            if s.user_interrupted_playback || track.duration() == 0 {
                return None;
            }
            let position = s.position_secs();
            (position < track.duration() as f64 - grace).then_some((track, position, s.crash_recoveries))
        });
        let Some((track, position, attempts)) = crashed else {
            return false;
        };

        warn!(
            "💥 '{}' stopped at {:.0}s of {}s in guild {}",
            track.title(),
            position,
            track.duration(),
            guild_id
        );

        if attempts >= self.settings.max_crash_recoveries {
            handle.with_state(|s| {
                s.current_track = None;
                s.clear_timers();
            });
            self.announce(
                handle,
                &format!("❌ '{}' keeps failing, moving on", track.title()),
            )
            .await;
            return false;
        }

        let Ok(guard) = handle.try_lock_playback() else {
            return true;
        };
        handle.with_state(|s| s.crash_recoveries += 1);

        let resume_at = (position - self.settings.recovery_backoff.as_secs_f64()).max(0.0);
        let fresh = match refresh_stream(self.resolver.as_ref(), &track).await {
            Ok(fresh) => fresh,
            Err(e) => {
                drop(guard);
                error!("❌ Crash recovery of '{}' failed: {}", track.title(), e);
                handle.with_state(|s| {
                    s.current_track = None;
                    s.clear_timers();
                });
                self.announce(handle, &format!("❌ Could not recover '{}'", track.title()))
                    .await;
                return false;
            }
        };

        if self
            .play_track(handle, guard, fresh, resume_at, Some(PlayReason::Recovery))
            .await
        {
            info!("🩹 Recovered '{}' at {:.0}s in guild {}", track.title(), resume_at, guild_id);
            self.announce(
                handle,
                &format!(
                    "🔄 Playback interrupted, resumed '{}' at {}",
                    track.title(),
                    queue::format_seconds(resume_at as u64)
                ),
            )
            .await;
        } else {
            self.announce(handle, &format!("❌ Could not recover '{}'", track.title()))
                .await;
        }
        true
    }

    // ------------------------------------------------------------------
    // Seek family
    // ------------------------------------------------------------------

    pub async fn pause(&self, guild_id: GuildId) -> MusicResult<()> {
        self.ensure_voice_open()?;
        let handle = self.handle(guild_id)?;
        let _guard = handle.try_lock_playback()?;

        let voice = handle.with_state(|s| match (&s.current_track, s.is_paused()) {
            (None, _) => Err(MusicError::validation("Nothing is playing")),
            (Some(_), true) => Err(MusicError::validation("Playback is already paused")),
            (Some(_), false) => Ok(s.voice.clone()),
        })?;

        voice.pause().await?;
        handle.with_state(|s| s.mark_paused());
        info!("⏸️ Paused in guild {}", guild_id);
        Ok(())
    }

    pub async fn resume(&self, guild_id: GuildId) -> MusicResult<()> {
        self.ensure_voice_open()?;
        let handle = self.handle(guild_id)?;
        let _guard = handle.try_lock_playback()?;

        let voice = handle.with_state(|s| {
            if s.is_paused() {
                Ok(s.voice.clone())
            } else {
                Err(MusicError::validation("Playback is not paused"))
            }
        })?;

        voice.resume().await?;
        handle.with_state(|s| s.mark_resumed());
        info!("▶️ Resumed in guild {}", guild_id);
        Ok(())
    }

    pub async fn restart(&self, guild_id: GuildId) -> MusicResult<u64> {
        self.reposition(guild_id, PlayReason::Restart, |_| 0.0).await
    }

    pub async fn seek(&self, guild_id: GuildId, target_secs: u64) -> MusicResult<u64> {
        self.reposition(guild_id, PlayReason::Seek, |_| target_secs as f64).await
    }

    pub async fn rewind(&self, guild_id: GuildId, secs: u64) -> MusicResult<u64> {
        self.reposition(guild_id, PlayReason::Rewind, |pos| pos - secs as f64).await
    }

    pub async fn forward(&self, guild_id: GuildId, secs: u64) -> MusicResult<u64> {
        self.reposition(guild_id, PlayReason::Forward, |pos| pos + secs as f64).await
    }

    /// Respawns the current track at `target(position)`.
    async fn reposition(
        &self,
        guild_id: GuildId,
        reason: PlayReason,
        target: impl FnOnce(f64) -> f64,
    ) -> MusicResult<u64> {
        self.ensure_voice_open()?;
        let handle = self.handle(guild_id)?;
        let guard = handle.try_lock_playback()?;

        let (track, position) = handle.with_state(|s| {
            let track = s
                .current_track
                .clone()
                .ok_or_else(|| MusicError::validation("Nothing is playing"))?;
            let position = target(s.position_secs()).clamp(0.0, track.duration() as f64);
            s.stop_flag = true;
            Ok::<_, MusicError>((track, position))
        })?;

        if self.play_track(&handle, guard, track, position, Some(reason)).await {
            Ok(position as u64)
        } else {
            Err(MusicError::stream("the track could not be restarted"))
        }
    }

    // ------------------------------------------------------------------
    // Queue-level commands
    // ------------------------------------------------------------------

    /// Appends resolved tracks and starts playback when the guild is idle.
    pub async fn enqueue(&self, guild_id: GuildId, tracks: Vec<Track>) -> MusicResult<Enqueued> {
        self.ensure_voice_open()?;
        let handle = self.handle(guild_id)?;
        let max = self.settings.max_queue_size;

        let (position, idle) = {
            let _guard = handle.try_lock_modification()?;
            handle.with_state(|s| {
                if s.queue.len() + tracks.len() > max {
                    return Err(MusicError::validation(format!(
                        "The queue can hold at most {max} tracks"
                    )));
                }
                let position = s.queue.len() + 1;
                if s.is_looping_queue {
                    s.queue_to_loop.extend(tracks.iter().cloned());
                }
                s.queue.extend(tracks.iter().cloned());
                Ok((position, s.current_track.is_none()))
            })?
        };

        let started = idle && !handle.voice_client_locked();
        if started {
            self.play_next(guild_id).await;
        }

        debug!("➕ {} track(s) queued in guild {}", tracks.len(), guild_id);
        Ok(Enqueued {
            added: tracks.len(),
            position,
            started,
        })
    }

    /// Stops the current track so the control loop advances past `amount`
    /// tracks. Returns the skipped set.
    pub async fn skip(&self, guild_id: GuildId, amount: usize) -> MusicResult<Vec<Track>> {
        self.ensure_voice_open()?;
        let handle = self.handle(guild_id)?;
        if handle.voice_client_locked() {
            return Err(MusicError::locked("Playback"));
        }
        let _guard = handle.try_lock_modification()?;
        let max_skip = self.settings.max_skip;

        let (skipped, voice) = handle.with_state(|s| {
            let current = s
                .current_track
                .clone()
                .ok_or_else(|| MusicError::validation("Nothing is playing"))?;
            let skipped = queue::skip_tracks(&mut s.queue, Some(&current), s.is_looping, amount.max(1), max_skip);
            s.user_interrupted_playback = true;
            Ok::<_, MusicError>((skipped, s.voice.clone()))
        })?;

        voice.stop().await;
        info!("⏭️ Skipped {} track(s) in guild {}", skipped.len(), guild_id);
        Ok(skipped)
    }

    /// Stops playback and resets the guild to an empty state.
    pub async fn stop(&self, guild_id: GuildId) -> MusicResult<()> {
        self.ensure_voice_open()?;
        let handle = self.handle(guild_id)?;
        let _guard = handle.try_lock_playback()?;
        let _modifying = handle.try_lock_modification()?;

        let (voice, text_channel, was_playing) =
            handle.with_state(|s| (s.voice.clone(), s.text_channel, s.current_track.is_some()));

        voice.stop().await;
        self.guilds.reset(guild_id, voice, text_channel);
        if was_playing {
            // The stopped source still reports its end
            handle.with_state(|s| s.stop_flag = true);
        }

        info!("⏹️ Stopped and cleared guild {}", guild_id);
        Ok(())
    }

    pub fn toggle_loop(&self, guild_id: GuildId) -> MusicResult<bool> {
        let handle = self.handle(guild_id)?;
        let _guard = handle.try_lock_modification()?;
        Ok(handle.with_state(|s| {
            s.is_looping = !s.is_looping;
            s.track_to_loop = if s.is_looping { s.current_track.clone() } else { None };
            s.is_looping
        }))
    }

    pub fn toggle_loop_queue(&self, guild_id: GuildId) -> MusicResult<bool> {
        let handle = self.handle(guild_id)?;
        let _guard = handle.try_lock_modification()?;
        Ok(handle.with_state(|s| {
            s.is_looping_queue = !s.is_looping_queue;
            s.queue_to_loop = if s.is_looping_queue {
                s.current_track.iter().chain(s.queue.iter()).cloned().collect()
            } else {
                Vec::new()
            };
            s.is_looping_queue
        }))
    }

    pub fn toggle_random(&self, guild_id: GuildId) -> MusicResult<bool> {
        let handle = self.handle(guild_id)?;
        Ok(handle.with_state(|s| {
            s.is_random = !s.is_random;
            s.is_random
        }))
    }

    /// Applies `edit` to the active filters and returns the result.
    pub fn update_filters(&self, guild_id: GuildId, edit: impl FnOnce(&mut TrackFilters)) -> MusicResult<TrackFilters> {
        let handle = self.handle(guild_id)?;
        let _guard = handle.try_lock_modification()?;
        Ok(handle.with_state(|s| {
            edit(&mut s.filters);
            s.filters.clone()
        }))
    }

    /// Runs a structural edit on the live queue under the modification lock.
    pub fn edit_queue<R>(&self, guild_id: GuildId, edit: impl FnOnce(&mut Vec<Track>) -> MusicResult<R>) -> MusicResult<R> {
        let handle = self.handle(guild_id)?;
        let _guard = handle.try_lock_modification()?;
        handle.with_state(|s| edit(&mut s.queue))
    }

    /// Replaces a queued track with the result of `query`.
    pub async fn replace_in_queue(
        &self,
        guild_id: GuildId,
        target: &str,
        by_index: bool,
        query: &str,
        source_hint: Option<SourceWebsite>,
    ) -> MusicResult<(Track, Track)> {
        let handle = self.handle(guild_id)?;
        let _modifying = handle.try_lock_modification()?;
        let _extracting = handle.try_lock_extraction()?;

        let (current, _) = handle.with_state(|s| queue::find_track(target, &s.queue, by_index))?;
        let replacement =
            queue::resolve_replacement(self.resolver.as_ref(), &current, query, source_hint).await?;

        // The head may have been played while resolving
        let old = handle.with_state(|s| {
            let index = s
                .queue
                .iter()
                .position(|t| t == &current)
                .ok_or_else(|| MusicError::validation(format!("'{}' is no longer queued", current.title())))?;
            queue::replace_track(&(index + 1).to_string(), &mut s.queue, true, replacement.clone())
        })?;

        info!("🔀 Replaced '{}' with '{}' in guild {}", old.title(), replacement.title(), guild_id);
        Ok((old, replacement))
    }

    /// Resolves `query` under the extraction lock of the guild.
    pub async fn resolve_for(
        &self,
        guild_id: GuildId,
        query: &str,
        source_hint: Option<SourceWebsite>,
    ) -> MusicResult<Track> {
        let handle = self.handle(guild_id)?;
        let _extracting = handle.try_lock_extraction()?;
        self.resolver.resolve(query, source_hint).await
    }

    pub fn now_playing(&self, guild_id: GuildId) -> MusicResult<Option<NowPlaying>> {
        let handle = self.handle(guild_id)?;
        Ok(handle.with_state(|s| {
            s.current_track.clone().map(|track| NowPlaying {
                position_secs: match track.duration() {
                    0 => s.position_secs() as u64,
                    duration => (s.position_secs() as u64).min(duration),
                },
                paused: s.is_paused(),
                looping: s.is_looping,
                track,
            })
        }))
    }

    pub fn snapshot(&self, guild_id: GuildId) -> MusicResult<QueueSnapshot> {
        let handle = self.handle(guild_id)?;
        Ok(handle.with_state(|s| QueueSnapshot {
            current: s.current_track.clone(),
            queue: s.queue.clone(),
            history: s.history.iter().cloned().collect(),
            is_looping: s.is_looping,
            is_looping_queue: s.is_looping_queue,
            is_random: s.is_random,
            filters: s.filters.clone(),
        }))
    }
}

impl Clone for PlaybackEngine {
    fn clone(&self) -> Self {
        Self {
            guilds: self.guilds.clone(),
            resolver: self.resolver.clone(),
            announcer: self.announcer.clone(),
            store: self.store.clone(),
            lockdown: self.lockdown.clone(),
            settings: self.settings.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::testing::{FakeVoice, RecordingAnnouncer},
        config::StoreSettings,
        sources::{test_track, MockTrackResolver},
    };
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    const GUILD: GuildId = GuildId::new(7);

    struct Rig {
        engine: PlaybackEngine,
        handle: Arc<GuildHandle>,
        voice: Arc<FakeVoice>,
        announcer: Arc<RecordingAnnouncer>,
        events: mpsc::UnboundedReceiver<PlaybackEvent>,
    }

    fn alive_resolver() -> MockTrackResolver {
        let mut resolver = MockTrackResolver::new();
        resolver.expect_probe_alive().returning(|_| true);
        resolver
    }

    fn rig(resolver: MockTrackResolver) -> Rig {
        let lockdown = Arc::new(Lockdown::default());
        let store = Arc::new(DocumentStore::new(
            StoreSettings {
                root: std::env::temp_dir().join("guildtunes-engine-tests"),
                cache_ttl: Duration::from_secs(60),
                enable_backups: false,
            },
            lockdown.clone(),
        ));
        let announcer = Arc::new(RecordingAnnouncer::default());
        let engine = PlaybackEngine::new(
            Arc::new(GuildStateStore::new()),
            Arc::new(resolver),
            announcer.clone(),
            store,
            lockdown,
            PlaybackSettings {
                max_history_tracks: 3,
                ..PlaybackSettings::default()
            },
        );

        let voice = Arc::new(FakeVoice::default());
        let (handle, events) = engine.guilds().allocate(GUILD, voice.clone(), ChannelId::new(70));
        Rig {
            engine,
            handle,
            voice,
            announcer,
            events,
        }
    }

    fn titles(tracks: &[Track]) -> Vec<&str> {
        tracks.iter().map(|t| t.title()).collect()
    }

    #[tokio::test]
    async fn test_play_next_takes_head_of_queue() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| s.queue = vec![test_track("T1", 200), test_track("T2", 200)]);

        rig.engine.play_next(GUILD).await;

        rig.handle.with_state(|s| {
            assert_eq!(s.current_track.as_ref().map(|t| t.title()), Some("T1"));
            assert_eq!(titles(&s.queue), vec!["T2"]);
            assert_eq!(titles(&s.history.iter().cloned().collect::<Vec<_>>()), vec!["T1"]);
        });
        assert_eq!(rig.voice.play_count(), 1);
        assert!(rig.announcer.said("Now playing: T1"));
        assert!(!rig.handle.voice_client_locked());
    }

    #[tokio::test]
    async fn test_play_next_replays_pinned_loop_track() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| {
            s.is_looping = true;
            s.track_to_loop = Some(test_track("T1", 200));
            s.queue = vec![test_track("T2", 200), test_track("T3", 200)];
        });

        rig.engine.play_next(GUILD).await;

        rig.handle.with_state(|s| {
            assert_eq!(s.current_track.as_ref().map(|t| t.title()), Some("T1"));
            assert_eq!(titles(&s.queue), vec!["T2", "T3"]);
            assert!(s.history.is_empty());
        });
        assert!(!rig.announcer.said("Now playing"));
    }

    #[tokio::test]
    async fn test_play_next_refills_from_loop_snapshot() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| {
            s.is_looping_queue = true;
            s.queue_to_loop = vec![test_track("T1", 200), test_track("T2", 200)];
        });

        rig.engine.play_next(GUILD).await;

        rig.handle.with_state(|s| {
            assert_eq!(s.current_track.as_ref().map(|t| t.title()), Some("T1"));
            assert_eq!(titles(&s.queue), vec!["T2"]);
            assert_eq!(titles(&s.queue_to_loop), vec!["T1", "T2"]);
        });
    }

    #[tokio::test]
    async fn test_play_next_on_empty_queue_announces() {
        let rig = rig(alive_resolver());
        rig.engine.play_next(GUILD).await;

        assert!(rig.announcer.said("Queue is empty"));
        assert_eq!(rig.voice.play_count(), 0);
    }

    #[tokio::test]
    async fn test_play_next_prefers_filter_match() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| {
            s.filters.min_duration = Some(250);
            s.queue = vec![test_track("short", 100), test_track("long", 300)];
        });

        rig.engine.play_next(GUILD).await;

        rig.handle.with_state(|s| {
            assert_eq!(s.current_track.as_ref().map(|t| t.title()), Some("long"));
            assert_eq!(titles(&s.queue), vec!["short"]);
        });
    }

    #[tokio::test]
    async fn test_stop_flag_is_consumed_once() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| {
            s.stop_flag = true;
            s.queue = vec![test_track("T1", 200)];
        });

        rig.engine.play_next(GUILD).await;
        assert_eq!(rig.voice.play_count(), 0);
        assert!(rig.handle.with_state(|s| !s.stop_flag && s.queue.len() == 1));

        rig.engine.play_next(GUILD).await;
        assert_eq!(rig.voice.play_count(), 1);
    }

    #[tokio::test]
    async fn test_locked_guild_rejects_second_operation() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| {
            s.queue = vec![test_track("T1", 200)];
            s.current_track = Some(test_track("T0", 200));
            s.mark_started(10.0);
        });

        let guard = rig.handle.try_lock_playback().unwrap();
        rig.engine.play_next(GUILD).await;
        let seek = rig.engine.seek(GUILD, 30).await;
        let skip = rig.engine.skip(GUILD, 1).await;
        drop(guard);

        assert!(seek.unwrap_err().is_contention());
        assert!(skip.unwrap_err().is_contention());
        assert_eq!(rig.voice.play_count(), 0);
        assert_eq!(rig.handle.with_state(|s| s.queue.len()), 1);
    }

    #[tokio::test]
    async fn test_history_stays_bounded_over_natural_plays() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| {
            s.queue = (0..6).map(|i| test_track(&format!("t{i}"), 200)).collect();
        });

        for _ in 0..6 {
            rig.handle.with_state(|s| s.user_interrupted_playback = true);
            rig.engine.play_next(GUILD).await;
            assert!(rig.handle.with_state(|s| s.history.len() <= 3));
        }

        let history = rig.handle.with_state(|s| s.history.iter().cloned().collect::<Vec<_>>());
        assert_eq!(titles(&history), vec!["t3", "t4", "t5"]);
    }

    #[tokio::test]
    async fn test_crash_is_recovered_once_near_elapsed_position() {
        let mut resolver = alive_resolver();
        resolver
            .expect_reresolve()
            .times(1)
            .returning(|_| Ok(test_track("renamed upstream", 300)));
        let rig = rig(resolver);

        rig.handle.with_state(|s| {
            s.current_track = Some(test_track("T1", 300));
            s.mark_started(0.0);
            s.backdate(Duration::from_secs(60));
            s.queue = vec![test_track("T2", 200)];
        });

        rig.engine.play_next(GUILD).await;

        let (url, position) = rig.voice.last_play().unwrap();
        assert_eq!(url, "https://stream.example/renamed_upstream");
        assert!((56.0..=58.0).contains(&position.as_secs_f64()));
        rig.handle.with_state(|s| {
            assert_eq!(s.current_track.as_ref().map(|t| t.title()), Some("T1"));
            assert_eq!(s.crash_recoveries, 1);
            assert_eq!(titles(&s.queue), vec!["T2"]);
            assert!(s.history.is_empty());
        });
        assert!(rig.announcer.said("resumed 'T1'"));
    }

    #[tokio::test]
    async fn test_end_within_grace_is_not_a_crash() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| {
            s.current_track = Some(test_track("T1", 300));
            s.mark_started(290.5);
        });

        assert!(!rig.engine.check_player_crash(&rig.handle).await);
        assert_eq!(rig.voice.play_count(), 0);
    }

    #[tokio::test]
    async fn test_user_skip_is_not_a_crash() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| {
            s.current_track = Some(test_track("T1", 300));
            s.mark_started(0.0);
            s.queue = vec![test_track("T2", 200), test_track("T3", 200)];
        });

        let skipped = rig.engine.skip(GUILD, 2).await.unwrap();
        assert_eq!(titles(&skipped), vec!["T1", "T2"]);
        assert_eq!(rig.voice.stops.load(Ordering::SeqCst), 1);

        rig.engine.play_next(GUILD).await;
        assert_eq!(
            rig.handle.with_state(|s| s.current_track.clone()).map(|t| t.title().to_string()),
            Some("T3".to_string())
        );
    }

    #[tokio::test]
    async fn test_exhausted_recoveries_fall_through_to_next_track() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| {
            s.current_track = Some(test_track("T1", 300));
            s.mark_started(0.0);
            s.crash_recoveries = PlaybackSettings::default().max_crash_recoveries;
            s.queue = vec![test_track("T2", 200)];
        });

        rig.engine.play_next(GUILD).await;

        assert_eq!(
            rig.handle.with_state(|s| s.current_track.clone()).map(|t| t.title().to_string()),
            Some("T2".to_string())
        );
        assert!(rig.announcer.said("keeps failing"));
    }

    #[tokio::test]
    async fn test_failed_start_disables_looping_and_reports_end() {
        let mut rig = rig(alive_resolver());
        rig.voice.fail_play.store(true, Ordering::SeqCst);
        rig.handle.with_state(|s| {
            s.is_looping = true;
            s.track_to_loop = Some(test_track("T1", 200));
        });

        rig.engine.play_next(GUILD).await;

        rig.handle.with_state(|s| {
            assert!(!s.is_looping);
            assert!(s.track_to_loop.is_none());
            assert!(s.current_track.is_none());
        });
        assert!(!rig.handle.voice_client_locked());
        assert!(matches!(
            rig.events.recv().await,
            Some(PlaybackEvent::Ended { error: Some(_) })
        ));
    }

    #[tokio::test]
    async fn test_dead_stream_is_reresolved_keeping_identity() {
        let mut resolver = MockTrackResolver::new();
        resolver.expect_probe_alive().returning(|_| false);
        resolver
            .expect_reresolve()
            .times(1)
            .returning(|_| Ok(test_track("Other Title", 200)));
        let rig = rig(resolver);
        rig.handle.with_state(|s| s.queue = vec![test_track("Mine", 200)]);

        rig.engine.play_next(GUILD).await;

        let current = rig.handle.with_state(|s| s.current_track.clone()).unwrap();
        assert_eq!(current.title(), "Mine");
        assert_eq!(current.stream_url(), Some("https://stream.example/Other_Title"));
    }

    #[tokio::test]
    async fn test_seek_respawns_without_history_and_suppresses_old_end() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| s.queue = vec![test_track("T1", 200)]);
        rig.engine.play_next(GUILD).await;

        assert_eq!(rig.engine.seek(GUILD, 500).await.unwrap(), 200);
        assert_eq!(rig.engine.rewind(GUILD, 50).await.unwrap(), 150);

        let (_, position) = rig.voice.last_play().unwrap();
        assert_eq!(position.as_secs(), 150);
        rig.handle.with_state(|s| {
            assert!(s.stop_flag);
            assert_eq!(s.history.len(), 1);
        });
    }

    #[tokio::test]
    async fn test_pause_and_resume_keep_position() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| s.queue = vec![test_track("T1", 200)]);
        rig.engine.play_next(GUILD).await;

        rig.engine.pause(GUILD).await.unwrap();
        assert!(rig.voice.paused.load(Ordering::SeqCst));
        assert!(rig.engine.pause(GUILD).await.is_err());
        assert!(rig.engine.now_playing(GUILD).unwrap().unwrap().paused);

        rig.engine.resume(GUILD).await.unwrap();
        assert!(!rig.voice.paused.load(Ordering::SeqCst));
        assert_eq!(rig.voice.play_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_resets_state_and_swallows_end() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| s.queue = vec![test_track("T1", 200), test_track("T2", 200)]);
        rig.engine.play_next(GUILD).await;

        rig.engine.stop(GUILD).await.unwrap();

        rig.handle.with_state(|s| {
            assert!(s.queue.is_empty());
            assert!(s.current_track.is_none());
            assert!(s.stop_flag);
        });
        rig.engine.play_next(GUILD).await;
        assert!(!rig.announcer.said("Queue is empty"));
    }

    #[tokio::test]
    async fn test_empty_channel_disconnects_and_destroys() {
        let rig = rig(alive_resolver());
        rig.voice.listeners.store(0, Ordering::SeqCst);
        rig.handle.with_state(|s| s.queue = vec![test_track("T1", 200)]);

        rig.engine.play_next(GUILD).await;

        assert_eq!(rig.voice.disconnects.load(Ordering::SeqCst), 1);
        assert!(rig.engine.guilds().get(GUILD).is_none());
        assert_eq!(rig.voice.play_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_starts_idle_guild_and_respects_capacity() {
        let rig = rig(alive_resolver());

        let first = rig.engine.enqueue(GUILD, vec![test_track("T1", 200)]).await.unwrap();
        assert!(first.started);
        let second = rig.engine.enqueue(GUILD, vec![test_track("T2", 200)]).await.unwrap();
        assert!(!second.started);
        assert_eq!(second.position, 1);

        let too_many = vec![test_track("x", 10); PlaybackSettings::default().max_queue_size];
        assert!(matches!(
            rig.engine.enqueue(GUILD, too_many).await,
            Err(MusicError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_start_while_disconnected_keeps_track_and_unblocks_enqueue() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| {
            s.current_track = Some(test_track("T0", 200));
            s.mark_started(199.0);
            s.queue = vec![test_track("T1", 200)];
        });
        rig.voice.connected.store(false, Ordering::SeqCst);

        rig.engine.play_next(GUILD).await;

        rig.handle.with_state(|s| {
            assert!(s.current_track.is_none());
            assert_eq!(titles(&s.queue), vec!["T1"]);
        });
        assert_eq!(rig.voice.play_count(), 0);
        assert!(!rig.handle.voice_client_locked());

        rig.voice.connected.store(true, Ordering::SeqCst);
        let queued = rig.engine.enqueue(GUILD, vec![test_track("T2", 200)]).await.unwrap();
        assert!(queued.started);
        rig.handle.with_state(|s| {
            assert_eq!(s.current_track.as_ref().map(|t| t.title()), Some("T1"));
            assert_eq!(titles(&s.queue), vec!["T2"]);
        });
    }

    #[tokio::test]
    async fn test_loop_queue_snapshots_current_and_queue() {
        let rig = rig(alive_resolver());
        rig.handle.with_state(|s| s.queue = vec![test_track("T1", 200), test_track("T2", 200)]);
        rig.engine.play_next(GUILD).await;

        assert!(rig.engine.toggle_loop_queue(GUILD).unwrap());
        assert_eq!(
            titles(&rig.handle.with_state(|s| s.queue_to_loop.clone())),
            vec!["T1", "T2"]
        );
        assert!(!rig.engine.toggle_loop_queue(GUILD).unwrap());
        assert!(rig.handle.with_state(|s| s.queue_to_loop.is_empty()));
    }

    #[tokio::test]
    async fn test_frozen_voice_rejects_commands() {
        let rig = rig(alive_resolver());
        rig.engine.lockdown.freeze_voice();

        assert_eq!(
            rig.engine.enqueue(GUILD, vec![test_track("T1", 200)]).await,
            Err(MusicError::Frozen("Voice"))
        );
    }
}
