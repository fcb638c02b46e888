//! Guarded per-guild JSON documents.
//!
//! Each guild owns a directory under the store root holding one file per
//! [`Domain`]. Every read and write of a `(guild, domain)` pair goes through
//! its own async mutex, a time-bounded cache and the process-wide file
//! freeze flag. Playlists and roles are thin typed views over the same store.

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use serenity::model::id::{GuildId, RoleId};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, sync::Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    audio::queue,
    cache::TtlCache,
    config::StoreSettings,
    error::{MusicError, MusicResult},
    shutdown::Lockdown,
    sources::{SourceWebsite, Track, TrackResolver},
};

/// Kind of document kept per guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Playlists,
    Roles,
}

impl Domain {
    pub fn file_name(&self) -> &'static str {
        match self {
            Domain::Playlists => "playlists.json",
            Domain::Roles => "roles.json",
        }
    }
}

type DocKey = (GuildId, Domain);

/// JSON documents per guild and domain, behind per-document mutexes.
pub struct DocumentStore {
    settings: StoreSettings,
    lockdown: Arc<Lockdown>,
    mutexes: DashMap<DocKey, Arc<Mutex<()>>>,
    cache: TtlCache<DocKey, Value>,
}

impl DocumentStore {
    pub fn new(settings: StoreSettings, lockdown: Arc<Lockdown>) -> Self {
        info!("📁 Storage initialised at: {}", settings.root.display());
        Self {
            cache: TtlCache::new(settings.cache_ttl),
            settings,
            lockdown,
            mutexes: DashMap::new(),
        }
    }

    /// Reads the document, from cache when fresh, creating `{}` on first access.
    pub async fn read(&self, guild_id: GuildId, domain: Domain) -> MusicResult<Value> {
        self.ensure_unfrozen()?;
        let mutex = self.mutex_for(guild_id, domain);
        let _guard = mutex.lock().await;

        if let Some(doc) = self.cache.get(&(guild_id, domain)) {
            debug!("Cache hit for {:?} of guild {}", domain, guild_id);
            return Ok(doc);
        }

        let path = self.ensure_file(guild_id, domain).await?;
        let raw = fs::read_to_string(&path).await.map_err(|e| {
            error!("Error reading {}: {}", path.display(), e);
            MusicError::persistence(format!("read {}: {e}", path.display()))
        })?;

        let doc: Value = serde_json::from_str(&raw).map_err(|e| {
            error!("Corrupt document {}: {}", path.display(), e);
            MusicError::persistence(format!("parse {}: {e}", path.display()))
        })?;
        if !doc.is_object() {
            return Err(MusicError::persistence(format!("{} is not a JSON object", path.display())));
        }

        self.cache.insert((guild_id, domain), doc.clone());
        Ok(doc)
    }

    /// Replaces the whole document. On failure the `backup` (the document as
    /// it was before the caller's edit) is written back when backups are on.
    pub async fn write(
        &self,
        guild_id: GuildId,
        domain: Domain,
        content: &Value,
        backup: Option<&Value>,
    ) -> MusicResult<()> {
        self.ensure_unfrozen()?;
        let mutex = self.mutex_for(guild_id, domain);
        let _guard = mutex.lock().await;

        let path = self.ensure_file(guild_id, domain).await?;
        let serialized = serde_json::to_string_pretty(content)
            .map_err(|e| MusicError::persistence(format!("serialize {:?}: {e}", domain)))?;

        match fs::write(&path, serialized).await {
            Ok(()) => {
                self.cache.insert((guild_id, domain), content.clone());
                debug!("💾 {:?} saved for guild {}", domain, guild_id);
                Ok(())
            }
            Err(e) => {
                error!("Error writing {}: {}", path.display(), e);
                self.cache.invalidate(&(guild_id, domain));

                if let (true, Some(backup)) = (self.settings.enable_backups, backup) {
                    // Best-effort; the next read re-reads whatever is on disk
                    if Self::restore_backup(&path, backup).await {
                        info!("♻️ Restored previous {:?} for guild {}", domain, guild_id);
                    }
                }

                Err(MusicError::persistence(format!("write {}: {e}", path.display())))
            }
        }
    }

    /// Writes `backup` over `path`. False when it could not be restored.
    async fn restore_backup(path: &Path, backup: &Value) -> bool {
        let previous = match serde_json::to_string_pretty(backup) {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Backup could not be serialized: {}", e);
                return false;
            }
        };
        match fs::write(path, previous).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Backup restore failed for {}: {}", path.display(), e);
                false
            }
        }
    }

    pub async fn read_as<T: DeserializeOwned>(&self, guild_id: GuildId, domain: Domain) -> MusicResult<T> {
        let doc = self.read(guild_id, domain).await?;
        serde_json::from_value(doc)
            .map_err(|e| MusicError::persistence(format!("decode {:?} of guild {guild_id}: {e}", domain)))
    }

    pub async fn write_as<T: Serialize>(
        &self,
        guild_id: GuildId,
        domain: Domain,
        content: &T,
        backup: Option<&T>,
    ) -> MusicResult<()> {
        let encode = |v: &T| {
            serde_json::to_value(v).map_err(|e| MusicError::persistence(format!("encode {:?}: {e}", domain)))
        };
        let content = encode(content)?;
        let backup = backup.map(encode).transpose()?;
        self.write(guild_id, domain, &content, backup.as_ref()).await
    }

    /// Whether any document mutex is currently held.
    pub fn any_locked(&self) -> bool {
        self.mutexes.iter().any(|entry| entry.value().try_lock().is_err())
    }

    /// Evicts expired cache entries; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let purged = self.cache.cleanup_expired();
        debug!("🧹 {} cached documents expired, {} kept", purged, self.cache.len());
        purged
    }

    /// Drops cached documents and idle mutexes of a guild that left.
    pub fn forget_guild(&self, guild_id: GuildId) {
        self.cache.invalidate_where(|(guild, _)| *guild == guild_id);
        self.mutexes
            .retain(|(guild, _), mutex| *guild != guild_id || mutex.try_lock().is_err());
        debug!("🧹 Store entries dropped for guild {}", guild_id);
    }

    fn ensure_unfrozen(&self) -> MusicResult<()> {
        if self.lockdown.files_frozen() {
            return Err(MusicError::Frozen("File"));
        }
        Ok(())
    }

    pub(crate) fn mutex_for(&self, guild_id: GuildId, domain: Domain) -> Arc<Mutex<()>> {
        self.mutexes
            .entry((guild_id, domain))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guild_dir(&self, guild_id: GuildId) -> PathBuf {
        self.settings.root.join(guild_id.get().to_string())
    }

    async fn ensure_file(&self, guild_id: GuildId, domain: Domain) -> MusicResult<PathBuf> {
        let dir = self.guild_dir(guild_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| MusicError::persistence(format!("create {}: {e}", dir.display())))?;

        let path = dir.join(domain.file_name());
        if fs::metadata(&path).await.is_err() {
            fs::write(&path, "{}")
                .await
                .map_err(|e| MusicError::persistence(format!("create {}: {e}", path.display())))?;
            info!("📝 Created {} for guild {}", domain.file_name(), guild_id);
        }
        Ok(path)
    }
}

/// Playlist name → ordered track projections.
pub type PlaylistBook = BTreeMap<String, Vec<Track>>;

/// Advisory per-guild locks on playlist names.
///
/// A locked name refuses other structural edits until its guard drops.
#[derive(Debug, Default, Clone)]
pub struct PlaylistLocks {
    inner: Arc<DashMap<GuildId, HashMap<String, bool>>>,
}

impl PlaylistLocks {
    /// Marks `name` locked, creating the entry for names that do not exist yet.
    pub fn lock(&self, guild_id: GuildId, name: &str) -> MusicResult<PlaylistLockGuard> {
        let mut names = self.inner.entry(guild_id).or_default();
        if names.get(name).copied().unwrap_or(false) {
            return Err(MusicError::locked(format!("Playlist '{name}'")));
        }
        names.insert(name.to_string(), true);

        Ok(PlaylistLockGuard {
            locks: self.inner.clone(),
            guild_id,
            name: name.to_string(),
        })
    }

    pub fn is_locked(&self, guild_id: GuildId, name: &str) -> bool {
        self.inner
            .get(&guild_id)
            .and_then(|names| names.get(name).copied())
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn known_names(&self, guild_id: GuildId) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .get(&guild_id)
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Releases the playlist lock when dropped.
#[derive(Debug)]
pub struct PlaylistLockGuard {
    locks: Arc<DashMap<GuildId, HashMap<String, bool>>>,
    guild_id: GuildId,
    name: String,
}

impl PlaylistLockGuard {
    /// Unlocks and prunes unlocked entries whose playlist no longer exists.
    pub fn release(self, book: &PlaylistBook) {
        if let Some(mut names) = self.locks.get_mut(&self.guild_id) {
            names.insert(self.name.clone(), false);
            names.retain(|name, locked| *locked || book.contains_key(name));
        }
    }
}

impl Drop for PlaylistLockGuard {
    fn drop(&mut self) {
        if let Some(mut names) = self.locks.get_mut(&self.guild_id) {
            if let Some(locked) = names.get_mut(&self.name) {
                *locked = false;
            }
        }
    }
}

/// Saved playlists of every guild.
pub struct PlaylistManager {
    store: Arc<DocumentStore>,
    locks: PlaylistLocks,
    max_name_length: usize,
    max_playlist_size: usize,
}

impl PlaylistManager {
    pub fn new(store: Arc<DocumentStore>, max_name_length: usize, max_playlist_size: usize) -> Self {
        Self {
            store,
            locks: PlaylistLocks::default(),
            max_name_length,
            max_playlist_size,
        }
    }

    pub fn locks(&self) -> &PlaylistLocks {
        &self.locks
    }

    pub async fn names(&self, guild_id: GuildId) -> MusicResult<Vec<String>> {
        let book: PlaylistBook = self.store.read_as(guild_id, Domain::Playlists).await?;
        Ok(book.into_keys().collect())
    }

    pub async fn tracks(&self, guild_id: GuildId, name: &str) -> MusicResult<Vec<Track>> {
        if self.locks.is_locked(guild_id, name) {
            return Err(MusicError::locked(format!("Playlist '{name}'")));
        }
        let mut book: PlaylistBook = self.store.read_as(guild_id, Domain::Playlists).await?;
        book.remove(name)
            .ok_or_else(|| MusicError::validation(format!("Playlist '{name}' does not exist")))
    }

    pub async fn create(&self, guild_id: GuildId, name: &str) -> MusicResult<()> {
        let name = self.check_name(name)?;
        self.edit(guild_id, &name, |book| {
            if book.contains_key(&name) {
                return Err(MusicError::validation(format!("Playlist '{name}' already exists")));
            }
            book.insert(name.clone(), Vec::new());
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, guild_id: GuildId, name: &str) -> MusicResult<usize> {
        self.edit(guild_id, name, |book| {
            book.remove(name)
                .map(|tracks| tracks.len())
                .ok_or_else(|| MusicError::validation(format!("Playlist '{name}' does not exist")))
        })
        .await
    }

    /// Appends tracks (as projections); returns how many were added.
    pub async fn add(&self, guild_id: GuildId, name: &str, tracks: Vec<Track>) -> MusicResult<usize> {
        let max = self.max_playlist_size;
        self.edit(guild_id, name, |book| {
            let list = Self::playlist_mut(book, name)?;
            if list.len() + tracks.len() > max {
                return Err(MusicError::validation(format!(
                    "Playlist '{name}' can hold at most {max} tracks"
                )));
            }
            let added = tracks.len();
            list.extend(tracks.iter().map(Track::projection));
            Ok(added)
        })
        .await
    }

    pub async fn remove(&self, guild_id: GuildId, name: &str, targets: &[String], by_index: bool) -> MusicResult<Vec<Track>> {
        self.edit(guild_id, name, |book| {
            queue::remove_tracks(targets, Self::playlist_mut(book, name)?, by_index)
        })
        .await
    }

    pub async fn reposition(
        &self,
        guild_id: GuildId,
        name: &str,
        target: &str,
        new_position: usize,
        by_index: bool,
    ) -> MusicResult<(Track, usize, usize)> {
        self.edit(guild_id, name, |book| {
            queue::reposition_track(target, new_position, Self::playlist_mut(book, name)?, by_index)
        })
        .await
    }

    pub async fn rename_tracks(
        &self,
        guild_id: GuildId,
        name: &str,
        pairs: &[(String, String)],
        by_index: bool,
    ) -> MusicResult<Vec<(String, String)>> {
        let max = self.max_name_length;
        self.edit(guild_id, name, |book| {
            queue::rename_tracks(pairs, Self::playlist_mut(book, name)?, by_index, max)
        })
        .await
    }

    /// Resolves `query` and swaps it in for `target`. The playlist stays
    /// locked from the first read until the write, so positions cannot shift
    /// during the lookup. Returns the old and the new track.
    #[allow(clippy::too_many_arguments)]
    pub async fn replace_with(
        &self,
        resolver: &dyn TrackResolver,
        guild_id: GuildId,
        name: &str,
        target: &str,
        by_index: bool,
        query: &str,
        source_hint: Option<SourceWebsite>,
    ) -> MusicResult<(Track, Track)> {
        let guard = self.locks.lock(guild_id, name)?;

        let mut book: PlaylistBook = self.store.read_as(guild_id, Domain::Playlists).await?;
        let (current, _) = queue::find_track(target, Self::playlist_mut(&mut book, name)?, by_index)?;
        let replacement = queue::resolve_replacement(resolver, &current, query, source_hint).await?;

        let old = self
            .edit_locked(guard, guild_id, |book| {
                queue::replace_track(target, Self::playlist_mut(book, name)?, by_index, replacement.projection())
            })
            .await?;
        Ok((old, replacement))
    }

    pub async fn rename_playlist(&self, guild_id: GuildId, old: &str, new: &str) -> MusicResult<()> {
        let new = self.check_name(new)?;
        if old == new {
            return Err(MusicError::validation(format!("Playlist '{old}' already has that name")));
        }
        // Lock the target too so nobody creates it meanwhile
        let _target = self.locks.lock(guild_id, &new)?;
        self.edit(guild_id, old, |book| {
            if book.contains_key(&new) {
                return Err(MusicError::validation(format!("Playlist '{new}' already exists")));
            }
            let tracks = book
                .remove(old)
                .ok_or_else(|| MusicError::validation(format!("Playlist '{old}' does not exist")))?;
            book.insert(new.clone(), tracks);
            Ok(())
        })
        .await
    }

    /// Read-modify-write of the whole book under the playlist lock.
    async fn edit<R>(
        &self,
        guild_id: GuildId,
        name: &str,
        apply: impl FnOnce(&mut PlaylistBook) -> MusicResult<R>,
    ) -> MusicResult<R> {
        let guard = self.locks.lock(guild_id, name)?;
        self.edit_locked(guard, guild_id, apply).await
    }

    async fn edit_locked<R>(
        &self,
        guard: PlaylistLockGuard,
        guild_id: GuildId,
        apply: impl FnOnce(&mut PlaylistBook) -> MusicResult<R>,
    ) -> MusicResult<R> {
        let mut book: PlaylistBook = self.store.read_as(guild_id, Domain::Playlists).await?;
        let backup = book.clone();
        let result = apply(&mut book)?;

        self.store
            .write_as(guild_id, Domain::Playlists, &book, Some(&backup))
            .await?;

        guard.release(&book);
        Ok(result)
    }

    fn playlist_mut<'a>(book: &'a mut PlaylistBook, name: &str) -> MusicResult<&'a mut Vec<Track>> {
        book.get_mut(name)
            .ok_or_else(|| MusicError::validation(format!("Playlist '{name}' does not exist")))
    }

    fn check_name(&self, name: &str) -> MusicResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MusicError::validation("The playlist name is empty"));
        }
        if name.chars().count() > self.max_name_length {
            return Err(MusicError::validation(format!(
                "Playlist names are limited to {} characters",
                self.max_name_length
            )));
        }
        Ok(name.to_string())
    }
}

/// Role a command category requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Music,
    Playlist,
}

impl RoleKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "music" => Some(RoleKind::Music),
            "playlist" | "playlists" => Some(RoleKind::Playlist),
            _ => None,
        }
    }
}

/// Role kind → role id (as a string, the way Discord ids are stored).
pub type RoleBook = BTreeMap<RoleKind, String>;

pub struct RoleManager {
    store: Arc<DocumentStore>,
}

impl RoleManager {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, guild_id: GuildId, kind: RoleKind) -> MusicResult<Option<RoleId>> {
        let book: RoleBook = self.store.read_as(guild_id, Domain::Roles).await?;
        Ok(book
            .get(&kind)
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|id| *id != 0)
            .map(RoleId::new))
    }

    /// Sets or clears the role required for `kind`.
    pub async fn set(&self, guild_id: GuildId, kind: RoleKind, role: Option<RoleId>) -> MusicResult<()> {
        let mut book: RoleBook = self.store.read_as(guild_id, Domain::Roles).await?;
        let backup = book.clone();
        match role {
            Some(role) => book.insert(kind, role.get().to_string()),
            None => book.remove(&kind),
        };
        self.store.write_as(guild_id, Domain::Roles, &book, Some(&backup)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{test_track, MockTrackResolver};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> (Arc<DocumentStore>, Arc<Lockdown>) {
        let lockdown = Arc::new(Lockdown::default());
        let settings = StoreSettings {
            root: dir.path().join("guilds"),
            cache_ttl: Duration::from_secs(60),
            enable_backups: true,
        };
        (Arc::new(DocumentStore::new(settings, lockdown.clone())), lockdown)
    }

    fn guild() -> GuildId {
        GuildId::new(42)
    }

    #[tokio::test]
    async fn test_first_read_creates_empty_document() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);

        let doc = store.read(guild(), Domain::Roles).await.unwrap();
        assert_eq!(doc, json!({}));
        assert!(dir.path().join("guilds/42/roles.json").exists());
    }

    #[tokio::test]
    async fn test_round_trip_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        let doc = json!({"chill": [{"title": "a"}]});

        store.write(guild(), Domain::Playlists, &doc, None).await.unwrap();
        // Disk changes behind the store's back are not observed while cached
        std::fs::write(dir.path().join("guilds/42/playlists.json"), "{}").unwrap();

        assert_eq!(store.read(guild(), Domain::Playlists).await.unwrap(), doc);
    }

    #[tokio::test]
    async fn test_frozen_store_fails_fast() {
        let dir = TempDir::new().unwrap();
        let (store, lockdown) = store_in(&dir);
        lockdown.freeze_files();

        assert_eq!(store.read(guild(), Domain::Roles).await, Err(MusicError::Frozen("File")));
        assert!(store.write(guild(), Domain::Roles, &json!({}), None).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_write_is_reported() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        // A directory where the file should be makes every write fail
        std::fs::create_dir_all(dir.path().join("guilds/42/playlists.json")).unwrap();

        let err = store
            .write(guild(), Domain::Playlists, &json!({"a": []}), Some(&json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, MusicError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_backup_restore_overwrites_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("playlists.json");
        std::fs::write(&path, "{\"chill\": [").unwrap();

        let backup = json!({"chill": []});
        assert!(DocumentStore::restore_backup(&path, &backup).await);
        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, backup);

        // Nothing can be written over a directory
        let blocked = dir.path().join("blocked");
        std::fs::create_dir_all(&blocked).unwrap();
        assert!(!DocumentStore::restore_backup(&blocked, &backup).await);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_a_read_error() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        std::fs::create_dir_all(dir.path().join("guilds/42")).unwrap();
        std::fs::write(dir.path().join("guilds/42/roles.json"), "{not json").unwrap();

        assert!(matches!(
            store.read(guild(), Domain::Roles).await,
            Err(MusicError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_any_locked_and_forget() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        store.read(guild(), Domain::Roles).await.unwrap();
        assert!(!store.any_locked());

        let mutex = store.mutex_for(guild(), Domain::Roles);
        let held = mutex.lock().await;
        assert!(store.any_locked());
        drop(held);

        store.forget_guild(guild());
        assert!(!store.any_locked());
        assert_eq!(store.cache.len(), 0);
    }

    #[tokio::test]
    async fn test_playlist_lifecycle() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        let playlists = PlaylistManager::new(store.clone(), 20, 3);

        playlists.create(guild(), "chill").await.unwrap();
        assert!(playlists.create(guild(), "chill").await.is_err());

        let added = playlists
            .add(guild(), "chill", vec![test_track("a", 100), test_track("b", 100)])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert!(playlists
            .add(guild(), "chill", vec![test_track("c", 1), test_track("d", 1)])
            .await
            .is_err());

        let tracks = playlists.tracks(guild(), "chill").await.unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| t.stream_url().is_none()));

        playlists.rename_playlist(guild(), "chill", "calm").await.unwrap();
        assert_eq!(playlists.names(guild()).await.unwrap(), vec!["calm".to_string()]);
        assert_eq!(playlists.delete(guild(), "calm").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_locked_playlist_refuses_edits() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        let playlists = PlaylistManager::new(store, 20, 10);
        playlists.create(guild(), "chill").await.unwrap();

        let guard = playlists.locks().lock(guild(), "chill").unwrap();
        let err = playlists.delete(guild(), "chill").await.unwrap_err();
        assert!(err.is_contention());
        assert!(playlists.tracks(guild(), "chill").await.is_err());
        drop(guard);

        assert!(playlists.tracks(guild(), "chill").await.is_ok());
    }

    #[tokio::test]
    async fn test_replace_with_holds_lock_during_lookup() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        let playlists = PlaylistManager::new(store, 20, 10);
        playlists.create(guild(), "chill").await.unwrap();
        playlists
            .add(guild(), "chill", vec![test_track("a", 100), test_track("b", 100)])
            .await
            .unwrap();

        let locks = playlists.locks().clone();
        let mut resolver = MockTrackResolver::new();
        resolver.expect_resolve().times(1).returning(move |_, _| {
            assert!(locks.is_locked(GuildId::new(42), "chill"));
            Ok(test_track("c", 120))
        });

        let (old, new) = playlists
            .replace_with(&resolver, guild(), "chill", "2", true, "c", None)
            .await
            .unwrap();
        assert_eq!(old.title(), "b");
        assert_eq!(new.title(), "c");
        assert!(!playlists.locks().is_locked(guild(), "chill"));

        let titles: Vec<String> = playlists
            .tracks(guild(), "chill")
            .await
            .unwrap()
            .iter()
            .map(|t| t.title().to_string())
            .collect();
        assert_eq!(titles, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_replace_with_refuses_locked_playlist() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        let playlists = PlaylistManager::new(store, 20, 10);
        playlists.create(guild(), "chill").await.unwrap();
        playlists.add(guild(), "chill", vec![test_track("a", 100)]).await.unwrap();

        let mut resolver = MockTrackResolver::new();
        resolver.expect_resolve().never();

        let _guard = playlists.locks().lock(guild(), "chill").unwrap();
        let err = playlists
            .replace_with(&resolver, guild(), "chill", "a", false, "c", None)
            .await
            .unwrap_err();
        assert!(err.is_contention());
    }

    #[test]
    fn test_release_prunes_stale_names() {
        let locks = PlaylistLocks::default();
        drop(locks.lock(guild(), "old").unwrap());
        let pending = locks.lock(guild(), "pending").unwrap();

        let mut book = PlaylistBook::new();
        book.insert("new".to_string(), Vec::new());
        locks.lock(guild(), "new").unwrap().release(&book);

        // "old" no longer exists, "pending" is still held
        assert_eq!(locks.known_names(guild()), vec!["new".to_string(), "pending".to_string()]);
        drop(pending);
        assert!(!locks.is_locked(guild(), "pending"));
    }

    #[tokio::test]
    async fn test_roles() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store_in(&dir);
        let roles = RoleManager::new(store);

        assert_eq!(roles.get(guild(), RoleKind::Music).await.unwrap(), None);
        roles.set(guild(), RoleKind::Music, Some(RoleId::new(7))).await.unwrap();
        assert_eq!(roles.get(guild(), RoleKind::Music).await.unwrap(), Some(RoleId::new(7)));

        let raw = std::fs::read_to_string(dir.path().join("guilds/42/roles.json")).unwrap();
        assert!(raw.contains("\"music\": \"7\""));

        roles.set(guild(), RoleKind::Music, None).await.unwrap();
        assert_eq!(roles.get(guild(), RoleKind::Music).await.unwrap(), None);
    }
}
