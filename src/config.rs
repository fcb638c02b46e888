use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Development guild for commands
    pub command_prefix: String,

    // Paths
    pub data_dir: PathBuf,
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,

    // Limits
    pub max_history_tracks: usize,
    pub max_queue_size: usize,
    pub max_skip: usize,
    pub max_name_length: usize,
    pub max_playlist_size: usize,

    // Crash recovery
    pub crash_grace_secs: u64,
    pub recovery_backoff_secs: u64,
    pub max_crash_recoveries: u32,

    // Storage
    pub cache_ttl_secs: u64,
    pub enable_backups: bool,

    // Timeouts
    pub connect_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

/// Reads an optional variable, falling back to `default` when unset or blank.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().parse()?),
        _ => Ok(default),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),
            command_prefix: env_or("COMMAND_PREFIX", defaults.command_prefix)?,

            // Paths
            data_dir: env_or("DATA_DIR", defaults.data_dir)?,
            ytdlp_path: env_or("YTDLP_PATH", defaults.ytdlp_path)?,
            ffmpeg_path: env_or("FFMPEG_PATH", defaults.ffmpeg_path)?,

            // Limits
            max_history_tracks: env_or("MAX_HISTORY_TRACKS", defaults.max_history_tracks)?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            max_skip: env_or("MAX_SKIP", defaults.max_skip)?,
            max_name_length: env_or("MAX_NAME_LENGTH", defaults.max_name_length)?,
            max_playlist_size: env_or("MAX_PLAYLIST_SIZE", defaults.max_playlist_size)?,

            // Crash recovery
            crash_grace_secs: env_or("CRASH_GRACE_SECS", defaults.crash_grace_secs)?,
            recovery_backoff_secs: env_or("RECOVERY_BACKOFF_SECS", defaults.recovery_backoff_secs)?,
            max_crash_recoveries: env_or("MAX_CRASH_RECOVERIES", defaults.max_crash_recoveries)?,

            // Storage
            cache_ttl_secs: env_or("CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            enable_backups: env_or("ENABLE_BACKUPS", defaults.enable_backups)?,

            // Timeouts
            connect_timeout_secs: env_or("CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs)?,
            disconnect_timeout_secs: env_or("DISCONNECT_TIMEOUT_SECS", defaults.disconnect_timeout_secs)?,
            drain_timeout_secs: env_or("DRAIN_TIMEOUT_SECS", defaults.drain_timeout_secs)?,
            probe_timeout_secs: env_or("PROBE_TIMEOUT_SECS", defaults.probe_timeout_secs)?,
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - The Discord token and command prefix must not be empty
    /// - Queue, history, skip and name limits must be greater than 0
    /// - The recovery backoff must stay below the crash grace period plus one
    ///   minute, otherwise a recovered track would restart far behind
    /// - Timeouts must be greater than 0
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN must not be empty");
        }

        if self.command_prefix.trim().is_empty() {
            anyhow::bail!("COMMAND_PREFIX must not be empty");
        }

        if self.max_history_tracks == 0 || self.max_queue_size == 0 || self.max_skip == 0 {
            anyhow::bail!("History, queue and skip limits must be greater than 0");
        }

        if self.max_name_length == 0 || self.max_playlist_size == 0 {
            anyhow::bail!("Name length and playlist size limits must be greater than 0");
        }

        if self.recovery_backoff_secs >= self.crash_grace_secs + 60 {
            anyhow::bail!(
                "Recovery backoff ({}s) is too large for a grace period of {}s",
                self.recovery_backoff_secs,
                self.crash_grace_secs
            );
        }

        if self.connect_timeout_secs == 0
            || self.disconnect_timeout_secs == 0
            || self.drain_timeout_secs == 0
            || self.probe_timeout_secs == 0
        {
            anyhow::bail!("Timeouts must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {}), prefix '{}'\n  \
            Limits: {} queue, {} history, {} skip, {} playlist entries\n  \
            Recovery: {}s grace, {}s backoff, {} attempts\n  \
            Storage: {} ({}s cache, backups={})\n  \
            Timeouts: connect {}, disconnect {}, drain {}",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.command_prefix,
            self.max_queue_size,
            self.max_history_tracks,
            self.max_skip,
            self.max_playlist_size,
            self.crash_grace_secs,
            self.recovery_backoff_secs,
            self.max_crash_recoveries,
            self.data_dir.display(),
            self.cache_ttl_secs,
            self.enable_backups,
            humantime::format_duration(self.connect_timeout()),
            humantime::format_duration(Duration::from_secs(self.disconnect_timeout_secs)),
            humantime::format_duration(self.drain_timeout())
        )
    }

    pub fn playback_settings(&self) -> PlaybackSettings {
        PlaybackSettings {
            max_history_tracks: self.max_history_tracks,
            max_queue_size: self.max_queue_size,
            max_skip: self.max_skip,
            crash_grace: Duration::from_secs(self.crash_grace_secs),
            recovery_backoff: Duration::from_secs(self.recovery_backoff_secs),
            max_crash_recoveries: self.max_crash_recoveries,
            disconnect_timeout: Duration::from_secs(self.disconnect_timeout_secs),
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            root: self.data_dir.join("guilds"),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            enable_backups: self.enable_backups,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,
            command_prefix: "!".to_string(),

            data_dir: "./data".into(),
            ytdlp_path: "yt-dlp".into(),
            ffmpeg_path: "ffmpeg".into(),

            max_history_tracks: 50,
            max_queue_size: 500,
            max_skip: 50,
            max_name_length: 100,
            max_playlist_size: 500,

            crash_grace_secs: 10,
            recovery_backoff_secs: 3,
            max_crash_recoveries: 3,

            cache_ttl_secs: 300,
            enable_backups: true,

            connect_timeout_secs: 15,
            disconnect_timeout_secs: 3,
            drain_timeout_secs: 20,
            probe_timeout_secs: 8,
        }
    }
}

/// Playback engine knobs, independent of Discord credentials.
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub max_history_tracks: usize,
    pub max_queue_size: usize,
    pub max_skip: usize,
    pub crash_grace: Duration,
    pub recovery_backoff: Duration,
    pub max_crash_recoveries: u32,
    pub disconnect_timeout: Duration,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Config::default().playback_settings()
    }
}

/// Document store knobs.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub root: PathBuf,
    pub cache_ttl: Duration,
    pub enable_backups: bool,
}
