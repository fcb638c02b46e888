use async_trait::async_trait;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{SourceWebsite, Track, TrackResolver};
use crate::error::{MusicError, MusicResult};

const YTDLP_TIMEOUT: Duration = Duration::from_secs(60);

/// Resolver that uses yt-dlp for metadata and stream URLs
pub struct YtDlpResolver {
    ytdlp_path: PathBuf,
    http: reqwest::Client,
    probe_timeout: Duration,
}

/// Subset of the `yt-dlp -j` output we care about
#[derive(Debug, Deserialize)]
struct VideoInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    url: Option<String>,
    extractor_key: Option<String>,
}

impl YtDlpResolver {
    pub fn new(ytdlp_path: PathBuf, probe_timeout: Duration) -> Self {
        Self {
            ytdlp_path,
            http: reqwest::Client::new(),
            probe_timeout,
        }
    }

    /// Checks that yt-dlp is available
    pub async fn verify_dependencies(&self) -> anyhow::Result<()> {
        let output = tokio::process::Command::new(&self.ytdlp_path)
            .arg("--version")
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!("yt-dlp not available at {}", self.ytdlp_path.display());
        }

        info!("✅ yt-dlp version: {}", String::from_utf8_lossy(&output.stdout).trim());
        Ok(())
    }

    /// Builds the yt-dlp target: URLs pass through, text becomes a search.
    fn search_target(query: &str, source_hint: Option<SourceWebsite>) -> String {
        if query.starts_with("http://") || query.starts_with("https://") {
            return query.to_string();
        }

        match source_hint.map(|s| s.family()) {
            Some(SourceWebsite::SoundCloud) => format!("scsearch1:{query}"),
            _ => format!("ytsearch1:{query}"),
        }
    }

    async fn extract(&self, target: &str) -> MusicResult<Track> {
        debug!("🔍 yt-dlp extract: {}", target);

        let mut cmd = tokio::process::Command::new(&self.ytdlp_path);
        cmd.args([
            "-j",
            "--no-playlist",
            "--no-warnings",
            "-f",
            "bestaudio/best",
            "--socket-timeout",
            "15",
            "--retries",
            "2",
        ])
        .arg(target)
        .kill_on_drop(true);

        let output = match timeout(YTDLP_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(MusicError::resolution(format!("yt-dlp could not start: {e}"))),
            Err(_) => return Err(MusicError::resolution("lookup timed out")),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp failed for {}: {}", target, stderr.trim());
            return Err(MusicError::resolution(
                stderr.lines().last().unwrap_or("no results").trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| MusicError::resolution("no results"))?;

        Self::parse_info(line)
    }

    fn parse_info(json: &str) -> MusicResult<Track> {
        let info: VideoInfo = serde_json::from_str(json)
            .map_err(|e| MusicError::resolution(format!("unexpected yt-dlp output: {e}")))?;

        let webpage_url = info
            .webpage_url
            .or(info.original_url)
            .ok_or_else(|| MusicError::resolution("result has no webpage"))?;
        let stream_url = info.url.ok_or_else(|| MusicError::resolution("result has no stream"))?;

        let source = match info.extractor_key.as_deref() {
            Some(key) => SourceWebsite::from_extractor(key),
            None => SourceWebsite::from_url(&webpage_url),
        };

        let track = Track::new(
            info.title.unwrap_or_else(|| "Unknown".to_string()),
            info.uploader.or(info.channel).unwrap_or_else(|| "Unknown".to_string()),
            info.duration.map(|d| d.max(0.0).round() as u64).unwrap_or(0),
            webpage_url,
            source,
        )
        .with_stream_url(stream_url);

        Ok(track)
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str, source_hint: Option<SourceWebsite>) -> MusicResult<Track> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MusicError::validation("The search query is empty"));
        }

        let track = self.extract(&Self::search_target(query, source_hint)).await?;
        info!("🎵 Resolved '{}' -> {}", query, track.title());
        Ok(track)
    }

    async fn probe_alive(&self, stream_url: &str) -> bool {
        let head = self.http.head(stream_url).timeout(self.probe_timeout).send().await;
        if let Ok(resp) = &head {
            if resp.status().is_success() {
                return true;
            }
        }

        // Some CDNs refuse HEAD; ask for a single byte instead
        match self
            .http
            .get(stream_url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Stream probe failed: {}", e);
                false
            }
        }
    }

    async fn reresolve(&self, webpage_url: &str) -> MusicResult<Track> {
        self.extract(webpage_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_target() {
        assert_eq!(YtDlpResolver::search_target("lofi beats", None), "ytsearch1:lofi beats");
        assert_eq!(
            YtDlpResolver::search_target("lofi beats", Some(SourceWebsite::SoundCloud)),
            "scsearch1:lofi beats"
        );
        assert_eq!(
            YtDlpResolver::search_target("https://youtu.be/abc", Some(SourceWebsite::SoundCloud)),
            "https://youtu.be/abc"
        );
    }

    #[test]
    fn test_parse_info() {
        let json = r#"{
            "title": "Song",
            "channel": "Artist",
            "duration": 212.6,
            "webpage_url": "https://soundcloud.com/artist/song",
            "url": "https://cf-media.sndcdn.com/abc",
            "extractor_key": "Soundcloud"
        }"#;

        let track = YtDlpResolver::parse_info(json).unwrap();
        assert_eq!(track.title(), "Song");
        assert_eq!(track.uploader(), "Artist");
        assert_eq!(track.duration(), 213);
        assert_eq!(track.source_website(), SourceWebsite::SoundCloud);
        assert_eq!(track.stream_url(), Some("https://cf-media.sndcdn.com/abc"));
    }

    #[test]
    fn test_parse_info_without_stream_fails() {
        let json = r#"{"title": "x", "webpage_url": "https://youtu.be/x"}"#;
        assert!(matches!(YtDlpResolver::parse_info(json), Err(MusicError::Resolution(_))));
    }
}
