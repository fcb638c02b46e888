//! In-memory fakes of the Discord seams for engine tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::ChannelId;
use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use super::voice::{Announcer, PlaybackEndNotifier, VoiceSession};
use crate::error::{MusicError, MusicResult};

pub struct FakeVoice {
    pub plays: Mutex<Vec<(String, Duration)>>,
    pub fail_play: AtomicBool,
    pub listeners: AtomicUsize,
    pub connected: AtomicBool,
    pub paused: AtomicBool,
    pub stops: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl Default for FakeVoice {
    fn default() -> Self {
        Self {
            plays: Mutex::new(Vec::new()),
            fail_play: AtomicBool::new(false),
            listeners: AtomicUsize::new(1),
            connected: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }
}

impl FakeVoice {
    pub fn play_count(&self) -> usize {
        self.plays.lock().len()
    }

    pub fn last_play(&self) -> Option<(String, Duration)> {
        self.plays.lock().last().cloned()
    }
}

#[async_trait]
impl VoiceSession for FakeVoice {
    async fn play(&self, stream_url: &str, position: Duration, _on_end: PlaybackEndNotifier) -> MusicResult<()> {
        if self.fail_play.load(Ordering::SeqCst) {
            return Err(MusicError::stream("ffmpeg could not start"));
        }
        self.plays.lock().push((stream_url.to_string(), position));
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self) -> MusicResult<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> MusicResult<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn disconnect(&self, _timeout: Duration) -> bool {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        true
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingAnnouncer {
    pub messages: Mutex<Vec<String>>,
}

impl RecordingAnnouncer {
    pub fn said(&self, fragment: &str) -> bool {
        self.messages.lock().iter().any(|m| m.contains(fragment))
    }
}

#[async_trait]
impl Announcer for RecordingAnnouncer {
    async fn announce(&self, _channel: ChannelId, text: &str) {
        self.messages.lock().push(text.to_string());
    }
}
