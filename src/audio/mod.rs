//! # Audio Module
//!
//! Per-guild playback for GuildTunes.
//!
//! ## Architecture
//!
//! ### [`state`] - Guild Registry
//! - One [`GuildState`] record per guild holding a voice session
//! - Real per-guild mutexes for playback, queue edits and track lookups
//! - Allocation, reset on `/stop`, destruction on leave
//!
//! ### [`player`] - Playback Engine
//! - Next-track selection (loop pin, filters, random, head of queue)
//! - Stream probing and re-resolution before every start
//! - Crash detection with bounded auto-recovery
//! - Seek family: pause, resume, restart, seek, rewind, forward
//!
//! ### [`queue`] - Queue Operations
//! - Pure functions shared by the live queue and saved playlists
//!
//! ### [`voice`] - Discord Seams
//! - [`VoiceSession`] over songbird with an ffmpeg child per track
//! - End-of-track relay into the guild control loop
//!
//! ## Threading
//!
//! Songbird fires track events on its own tasks. Those handlers never touch
//! guild state; they post a [`PlaybackEvent`] and the guild's control loop
//! advances the queue serially.

pub mod player;
pub mod queue;
pub mod state;
pub mod voice;

#[cfg(test)]
pub(crate) mod testing;

pub use player::{Enqueued, NowPlaying, PlayReason, PlaybackEngine, QueueSnapshot};
pub use state::{GuildHandle, GuildState, GuildStateStore, PlaybackPhase};
pub use voice::{Announcer, HttpAnnouncer, PlaybackEndNotifier, PlaybackEvent, SongbirdSession, VoiceSession};
