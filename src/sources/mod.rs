//! # Sources Module
//!
//! Track descriptors and the resolver seam used by the playback engine.
//!
//! The engine never talks to media websites directly. It asks a
//! [`TrackResolver`] for a [`Track`], probes whether the stream URL is still
//! alive and re-resolves by the track's webpage URL when it expired.
//! [`YtDlpResolver`] is the production implementation.

pub mod ytdlp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::error::{MusicError, MusicResult};

pub use ytdlp::YtDlpResolver;

/// Website a track was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceWebsite {
    YouTube,
    YouTubeMusic,
    SoundCloud,
    Bandcamp,
    Vimeo,
    Twitch,
    Direct,
}

impl SourceWebsite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceWebsite::YouTube => "YouTube",
            SourceWebsite::YouTubeMusic => "YouTube Music",
            SourceWebsite::SoundCloud => "SoundCloud",
            SourceWebsite::Bandcamp => "Bandcamp",
            SourceWebsite::Vimeo => "Vimeo",
            SourceWebsite::Twitch => "Twitch",
            SourceWebsite::Direct => "Direct link",
        }
    }

    /// Canonical member of the website family (YouTube Music is YouTube).
    pub fn family(&self) -> SourceWebsite {
        match self {
            SourceWebsite::YouTubeMusic => SourceWebsite::YouTube,
            other => *other,
        }
    }

    pub fn same_family(&self, other: &SourceWebsite) -> bool {
        self.family() == other.family()
    }

    /// Classifies a URL by host; anything unknown is a direct link.
    pub fn from_url(raw: &str) -> Self {
        let host = url::Url::parse(raw)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_ascii_lowercase()));

        match host.as_deref() {
            Some("music.youtube.com") => SourceWebsite::YouTubeMusic,
            Some("youtube.com") | Some("m.youtube.com") | Some("youtu.be") => SourceWebsite::YouTube,
            Some(h) if h == "soundcloud.com" || h.ends_with(".soundcloud.com") => SourceWebsite::SoundCloud,
            Some(h) if h.ends_with("bandcamp.com") => SourceWebsite::Bandcamp,
            Some("vimeo.com") | Some("player.vimeo.com") => SourceWebsite::Vimeo,
            Some("twitch.tv") | Some("m.twitch.tv") => SourceWebsite::Twitch,
            _ => SourceWebsite::Direct,
        }
    }

    /// Maps a yt-dlp `extractor_key`; every SoundCloud extractor
    /// (track, set, playlist, user) lands in the SoundCloud family.
    pub fn from_extractor(key: &str) -> Self {
        let key = key.to_ascii_lowercase();
        if key.starts_with("youtubemusic") {
            SourceWebsite::YouTubeMusic
        } else if key.starts_with("youtube") {
            SourceWebsite::YouTube
        } else if key.starts_with("soundcloud") {
            SourceWebsite::SoundCloud
        } else if key.starts_with("bandcamp") {
            SourceWebsite::Bandcamp
        } else if key.starts_with("vimeo") {
            SourceWebsite::Vimeo
        } else if key.starts_with("twitch") {
            SourceWebsite::Twitch
        } else {
            SourceWebsite::Direct
        }
    }

    /// Parses a user-typed website name ("yt", "soundcloud", ...).
    pub fn parse(name: &str) -> Option<Self> {
        let compact: String = name
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        match compact.as_str() {
            "youtube" | "yt" => Some(SourceWebsite::YouTube),
            "youtubemusic" | "ytmusic" | "ytm" => Some(SourceWebsite::YouTubeMusic),
            "soundcloud" | "sc" => Some(SourceWebsite::SoundCloud),
            "bandcamp" | "bc" => Some(SourceWebsite::Bandcamp),
            "vimeo" => Some(SourceWebsite::Vimeo),
            "twitch" => Some(SourceWebsite::Twitch),
            "direct" | "directlink" | "url" => Some(SourceWebsite::Direct),
            _ => None,
        }
    }
}

impl fmt::Display for SourceWebsite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A playable media reference plus display metadata.
///
/// Values are immutable once built; `with_*` methods return modified copies.
/// The stream URL is never persisted since it expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    title: String,
    uploader: String,
    /// Seconds; 0 when unknown (live streams)
    duration: u64,
    webpage_url: String,
    #[serde(skip)]
    stream_url: Option<String>,
    source_website: SourceWebsite,
}

impl Track {
    pub fn new(title: String, uploader: String, duration: u64, webpage_url: String, source_website: SourceWebsite) -> Self {
        Self {
            title,
            uploader,
            duration,
            webpage_url,
            stream_url: None,
            source_website,
        }
    }

    // Getters
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn uploader(&self) -> &str {
        &self.uploader
    }
    pub fn duration(&self) -> u64 {
        self.duration
    }
    pub fn webpage_url(&self) -> &str {
        &self.webpage_url
    }
    pub fn stream_url(&self) -> Option<&str> {
        self.stream_url.as_deref()
    }
    pub fn source_website(&self) -> SourceWebsite {
        self.source_website
    }

    // Builders
    pub fn with_stream_url(mut self, stream_url: String) -> Self {
        self.stream_url = Some(stream_url);
        self
    }

    pub fn with_title(mut self, title: String) -> Self {
        self.title = title;
        self
    }

    /// Keeps the user-visible identity of `original` on a freshly resolved
    /// copy; some sites rename tracks between lookups.
    pub fn with_identity_of(mut self, original: &Track) -> Self {
        self.title = original.title.clone();
        self.source_website = original.source_website;
        self
    }

    /// Copy without the expiring stream URL, as stored in playlists.
    pub fn projection(&self) -> Track {
        Track {
            stream_url: None,
            ..self.clone()
        }
    }
}

/// External lookup of tracks on media websites.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Resolves a search string or URL into a playable track.
    async fn resolve(&self, query: &str, source_hint: Option<SourceWebsite>) -> MusicResult<Track>;

    /// Whether the stream URL still answers.
    async fn probe_alive(&self, stream_url: &str) -> bool;

    /// Resolves a fresh stream URL for an already known webpage.
    async fn reresolve(&self, webpage_url: &str) -> MusicResult<Track>;
}

/// Returns `track` if its stream still answers, otherwise a re-resolved copy
/// carrying the original title and source website.
pub async fn ensure_playable(resolver: &dyn TrackResolver, track: &Track) -> MusicResult<Track> {
    if let Some(stream_url) = track.stream_url() {
        if resolver.probe_alive(stream_url).await {
            return Ok(track.clone());
        }
        warn!("🔗 Stream expired for '{}', re-resolving", track.title());
    }

    refresh_stream(resolver, track).await
}

/// Unconditionally re-resolves the stream of `track`.
pub async fn refresh_stream(resolver: &dyn TrackResolver, track: &Track) -> MusicResult<Track> {
    if track.webpage_url().is_empty() {
        return Err(MusicError::stream(format!("'{}' has no webpage to re-resolve", track.title())));
    }

    match resolver.reresolve(track.webpage_url()).await {
        Ok(fresh) if fresh.stream_url().is_some() => {
            info!("🔄 Stream re-resolved for '{}'", track.title());
            Ok(fresh.with_identity_of(track))
        }
        Ok(_) => Err(MusicError::stream(format!("no stream for '{}'", track.title()))),
        Err(e) => Err(MusicError::stream(e.to_string())),
    }
}

#[cfg(test)]
pub(crate) fn test_track(title: &str, duration: u64) -> Track {
    Track::new(
        title.to_string(),
        "Test Uploader".to_string(),
        duration,
        format!("https://www.youtube.com/watch?v={}", title.replace(' ', "_")),
        SourceWebsite::YouTube,
    )
    .with_stream_url(format!("https://stream.example/{}", title.replace(' ', "_")))
}
