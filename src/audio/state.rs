//! Per-guild playback state and the registry that owns it.

use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    collections::VecDeque,
    sync::Arc,
    time::Instant,
};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::{
    queue::TrackFilters,
    voice::{PlaybackEndNotifier, PlaybackEvent, VoiceSession},
};
use crate::{
    error::{MusicError, MusicResult},
    sources::Track,
};

/// Mutable record of one guild holding a voice session.
pub struct GuildState {
    pub voice: Arc<dyn VoiceSession>,
    pub text_channel: ChannelId,

    pub queue: Vec<Track>,
    pub history: VecDeque<Track>,
    pub queue_to_loop: Vec<Track>,
    pub current_track: Option<Track>,
    pub track_to_loop: Option<Track>,

    pub is_looping: bool,
    pub is_looping_queue: bool,
    pub is_random: bool,
    pub filters: TrackFilters,

    started_at: Option<Instant>,
    elapsed_secs: f64,

    /// The next end notification is the result of an intentional stop
    pub stop_flag: bool,
    pub user_disconnect: bool,
    pub user_interrupted_playback: bool,
    pub handling_disconnect_action: bool,
    pub handling_move_action: bool,
    pub pending_cleanup: bool,
    /// Crash recoveries spent on the current track
    pub crash_recoveries: u32,
}

impl GuildState {
    pub fn new(voice: Arc<dyn VoiceSession>, text_channel: ChannelId) -> Self {
        Self {
            voice,
            text_channel,
            queue: Vec::new(),
            history: VecDeque::new(),
            queue_to_loop: Vec::new(),
            current_track: None,
            track_to_loop: None,
            is_looping: false,
            is_looping_queue: false,
            is_random: false,
            filters: TrackFilters::default(),
            started_at: None,
            elapsed_secs: 0.0,
            stop_flag: false,
            user_disconnect: false,
            user_interrupted_playback: false,
            handling_disconnect_action: false,
            handling_move_action: false,
            pending_cleanup: false,
            crash_recoveries: 0,
        }
    }

    /// Seconds into the current track, across pauses and seeks.
    pub fn position_secs(&self) -> f64 {
        self.elapsed_secs + self.started_at.map_or(0.0, |s| s.elapsed().as_secs_f64())
    }

    pub fn mark_started(&mut self, position_secs: f64) {
        self.elapsed_secs = position_secs;
        self.started_at = Some(Instant::now());
    }

    pub fn mark_paused(&mut self) {
        if let Some(started) = self.started_at.take() {
            self.elapsed_secs += started.elapsed().as_secs_f64();
        }
    }

    pub fn mark_resumed(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn clear_timers(&mut self) {
        self.started_at = None;
        self.elapsed_secs = 0.0;
    }

    pub fn is_paused(&self) -> bool {
        self.current_track.is_some() && self.started_at.is_none()
    }

    /// Appends to the history, evicting the oldest entries past `limit`.
    pub fn push_history(&mut self, track: Track, limit: usize) {
        self.history.push_back(track);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Moves the clock back as if playback had started `by` earlier.
    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: std::time::Duration) {
        if let Some(started) = self.started_at {
            self.started_at = Some(started.checked_sub(by).unwrap_or(started));
        }
    }
}

/// Conceptual playback phase, derived from the state and the locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Playing,
    Paused,
    Locked,
}

/// Real per-guild mutexes standing in for the cooperative busy flags.
#[derive(Default)]
pub struct GuildLocks {
    /// Held while a play, skip or seek operation is in flight
    playback: Mutex<()>,
    /// Held by multi-step structural queue edits
    modification: Mutex<()>,
    /// Held while tracks are being resolved for this guild
    extraction: Mutex<()>,
}

/// Registry entry of a guild: its state plus the locks and control channel.
pub struct GuildHandle {
    guild_id: GuildId,
    state: parking_lot::Mutex<GuildState>,
    locks: GuildLocks,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl GuildHandle {
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Runs `f` with exclusive access to the state. Never await inside.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut GuildState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn voice(&self) -> Arc<dyn VoiceSession> {
        self.state.lock().voice.clone()
    }

    pub fn text_channel(&self) -> ChannelId {
        self.state.lock().text_channel
    }

    pub fn try_lock_playback(&self) -> MusicResult<MutexGuard<'_, ()>> {
        self.locks
            .playback
            .try_lock()
            .map_err(|_| MusicError::locked("Playback"))
    }

    pub fn try_lock_modification(&self) -> MusicResult<MutexGuard<'_, ()>> {
        self.locks
            .modification
            .try_lock()
            .map_err(|_| MusicError::locked("The queue"))
    }

    pub fn try_lock_extraction(&self) -> MusicResult<MutexGuard<'_, ()>> {
        self.locks
            .extraction
            .try_lock()
            .map_err(|_| MusicError::locked("Track lookup"))
    }

    pub fn voice_client_locked(&self) -> bool {
        self.locks.playback.try_lock().is_err()
    }

    pub fn phase(&self) -> PlaybackPhase {
        if self.voice_client_locked() {
            return PlaybackPhase::Locked;
        }
        let state = self.state.lock();
        match (&state.current_track, state.is_paused()) {
            (None, _) => PlaybackPhase::Idle,
            (Some(_), true) => PlaybackPhase::Paused,
            (Some(_), false) => PlaybackPhase::Playing,
        }
    }

    pub fn end_notifier(&self) -> PlaybackEndNotifier {
        PlaybackEndNotifier::new(self.guild_id, self.events.clone())
    }

    pub(crate) fn post(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }
}

/// Guild id → state registry.
#[derive(Default)]
pub struct GuildStateStore {
    guilds: DashMap<GuildId, Arc<GuildHandle>>,
}

impl GuildStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh state for `guild_id`, overwriting any previous entry.
    /// The receiver feeds the guild's control loop.
    pub fn allocate(
        &self,
        guild_id: GuildId,
        voice: Arc<dyn VoiceSession>,
        text_channel: ChannelId,
    ) -> (Arc<GuildHandle>, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(GuildHandle {
            guild_id,
            state: parking_lot::Mutex::new(GuildState::new(voice, text_channel)),
            locks: GuildLocks::default(),
            events,
        });

        if let Some(previous) = self.guilds.insert(guild_id, handle.clone()) {
            previous.post(PlaybackEvent::Shutdown);
        }
        info!("🆕 Guild state allocated for {}", guild_id);
        (handle, rx)
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildHandle>> {
        self.guilds.get(&guild_id).map(|h| h.clone())
    }

    /// Replaces the record with defaults, discarding queue and history.
    pub fn reset(&self, guild_id: GuildId, voice: Arc<dyn VoiceSession>, text_channel: ChannelId) -> bool {
        match self.get(guild_id) {
            Some(handle) => {
                handle.with_state(|state| *state = GuildState::new(voice, text_channel));
                debug!("♻️ Guild state reset for {}", guild_id);
                true
            }
            None => false,
        }
    }

    /// Removes the entry and stops its control loop. Store caches and locks
    /// of the guild are the caller's to drop.
    pub fn destroy(&self, guild_id: GuildId) -> Option<Arc<GuildHandle>> {
        let (_, handle) = self.guilds.remove(&guild_id)?;
        handle.post(PlaybackEvent::Shutdown);
        info!("🗑️ Guild state destroyed for {}", guild_id);
        Some(handle)
    }

    /// True when `handle` is still the registered entry of its guild.
    pub fn is_current(&self, handle: &Arc<GuildHandle>) -> bool {
        self.guilds
            .get(&handle.guild_id)
            .is_some_and(|h| Arc::ptr_eq(h.value(), handle))
    }

    pub fn guild_ids(&self) -> Vec<GuildId> {
        self.guilds.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.guilds.len()
    }
}
