//! Process-wide freeze flags and the shutdown drain.
//!
//! On Ctrl-C the bot stops accepting voice and file work, waits a bounded
//! time for in-flight document writes to release their mutexes, then tears
//! down every voice session concurrently. Exit is never blocked by a slow
//! gateway: each disconnect has its own timeout and the drain gives up after
//! `max_wait`.

use futures::future::join_all;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{audio::PlaybackEngine, storage::DocumentStore};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Freeze flags checked by the playback engine and the document store.
#[derive(Debug, Default)]
pub struct Lockdown {
    voice: AtomicBool,
    files: AtomicBool,
}

impl Lockdown {
    pub fn freeze_voice(&self) {
        self.voice.store(true, Ordering::SeqCst);
    }

    pub fn freeze_files(&self) {
        self.files.store(true, Ordering::SeqCst);
    }

    pub fn voice_frozen(&self) -> bool {
        self.voice.load(Ordering::SeqCst)
    }

    pub fn files_frozen(&self) -> bool {
        self.files.load(Ordering::SeqCst)
    }
}

pub struct ShutdownCoordinator {
    lockdown: Arc<Lockdown>,
    store: Arc<DocumentStore>,
    engine: PlaybackEngine,
}

impl ShutdownCoordinator {
    pub fn new(lockdown: Arc<Lockdown>, store: Arc<DocumentStore>, engine: PlaybackEngine) -> Self {
        Self {
            lockdown,
            store,
            engine,
        }
    }

    /// Freezes new work and waits up to `max_wait` for held document locks.
    /// Returns false when the wait timed out.
    pub async fn drain(&self, max_wait: Duration) -> bool {
        self.lockdown.freeze_voice();
        self.lockdown.freeze_files();
        info!("🧊 Voice and file operations frozen, draining");

        let deadline = Instant::now() + max_wait;
        while self.store.any_locked() {
            if Instant::now() >= deadline {
                warn!("⏱️ Drain timed out after {:?} with locks still held", max_wait);
                return false;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }

        info!("✅ Drain complete");
        true
    }

    /// Stops and disconnects every voice session concurrently. Returns how
    /// many sessions left cleanly.
    pub async fn close_all_voice_sessions(&self) -> usize {
        let guilds = self.engine.guilds().clone();
        let timeout = self.engine.settings().disconnect_timeout;
        debug!("Closing {} voice session(s)", guilds.len());

        let closing = guilds.guild_ids().into_iter().filter_map(|id| guilds.get(id)).map(|handle| {
            let engine = self.engine.clone();
            async move {
                let voice = handle.with_state(|s| {
                    s.handling_disconnect_action = true;
                    s.stop_flag = true;
                    s.voice.clone()
                });
                voice.stop().await;
                let clean = voice.disconnect(timeout).await;
                engine.cleanup_guild(handle.guild_id());
                clean
            }
        });

        let results = join_all(closing).await;
        let clean = results.iter().filter(|ok| **ok).count();
        info!("👋 Closed {} voice session(s), {} cleanly", results.len(), clean);
        clean
    }

    pub async fn run(&self, max_wait: Duration) {
        self.drain(max_wait).await;
        self.close_all_voice_sessions().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            testing::{FakeVoice, RecordingAnnouncer},
            GuildStateStore,
        },
        config::{PlaybackSettings, StoreSettings},
        sources::MockTrackResolver,
    };
    use serenity::model::id::{ChannelId, GuildId};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn coordinator(dir: &TempDir) -> (ShutdownCoordinator, Arc<DocumentStore>, PlaybackEngine) {
        let lockdown = Arc::new(Lockdown::default());
        let store = Arc::new(DocumentStore::new(
            StoreSettings {
                root: dir.path().to_path_buf(),
                cache_ttl: Duration::from_secs(60),
                enable_backups: true,
            },
            lockdown.clone(),
        ));
        let engine = PlaybackEngine::new(
            Arc::new(GuildStateStore::new()),
            Arc::new(MockTrackResolver::new()),
            Arc::new(RecordingAnnouncer::default()),
            store.clone(),
            lockdown.clone(),
            PlaybackSettings::default(),
        );
        (
            ShutdownCoordinator::new(lockdown, store.clone(), engine.clone()),
            store,
            engine,
        )
    }

    #[tokio::test]
    async fn test_drain_freezes_and_completes_when_idle() {
        let dir = TempDir::new().unwrap();
        let (coordinator, store, _) = coordinator(&dir);

        assert!(coordinator.drain(Duration::from_secs(1)).await);
        assert!(coordinator.lockdown.voice_frozen());
        assert!(matches!(
            store.read(GuildId::new(1), crate::storage::Domain::Roles).await,
            Err(crate::error::MusicError::Frozen("File"))
        ));
    }

    #[tokio::test]
    async fn test_drain_gives_up_while_a_document_is_held() {
        let dir = TempDir::new().unwrap();
        let (coordinator, store, _) = coordinator(&dir);
        let mutex = store.mutex_for(GuildId::new(1), crate::storage::Domain::Playlists);
        let held = mutex.lock().await;

        let started = Instant::now();
        assert!(!coordinator.drain(Duration::from_millis(200)).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(coordinator.lockdown.files_frozen());
        drop(held);
    }

    #[tokio::test]
    async fn test_drain_waits_for_a_write_to_finish() {
        let dir = TempDir::new().unwrap();
        let (coordinator, store, _) = coordinator(&dir);
        let mutex = store.mutex_for(GuildId::new(1), crate::storage::Domain::Playlists);
        let held = mutex.clone().lock_owned().await;

        tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            drop(held);
        });
        assert!(coordinator.drain(Duration::from_secs(2)).await);
        assert!(!store.any_locked());
    }

    #[tokio::test]
    async fn test_close_all_disconnects_every_guild() {
        let dir = TempDir::new().unwrap();
        let (coordinator, _, engine) = coordinator(&dir);

        let voices: Vec<Arc<FakeVoice>> = (1..=3).map(|_| Arc::new(FakeVoice::default())).collect();
        let mut receivers = Vec::new();
        for (i, voice) in voices.iter().enumerate() {
            let (_, rx) = engine
                .guilds()
                .allocate(GuildId::new(i as u64 + 1), voice.clone(), ChannelId::new(9));
            receivers.push(rx);
        }

        assert_eq!(coordinator.close_all_voice_sessions().await, 3);
        assert_eq!(engine.guilds().len(), 0);
        for voice in &voices {
            assert_eq!(voice.stops.load(Ordering::SeqCst), 1);
            assert_eq!(voice.disconnects.load(Ordering::SeqCst), 1);
        }
    }
}
