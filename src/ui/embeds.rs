use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::{
    audio::{
        queue::{self, format_seconds, TrackPage},
        NowPlaying, QueueSnapshot,
    },
    sources::Track,
};

/// Embed colors shared by every reply
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer shared by every embed
const STANDARD_FOOTER: &str = "🎵 GuildTunes";

/// Entries shown per page of a track list.
pub const ITEMS_PER_PAGE: usize = 10;

fn length(track: &Track) -> String {
    match track.duration() {
        0 => "🔴 Live".to_string(),
        secs => format_seconds(secs),
    }
}

fn track_line(index: usize, track: &Track) -> String {
    format!(
        "`{}.` [{}]({}) - {} `{}`",
        index,
        track.title(),
        track.webpage_url(),
        track.uploader(),
        length(track)
    )
}

/// Text progress bar for the now playing embed.
fn progress_bar(position: u64, duration: u64) -> String {
    const WIDTH: u64 = 16;
    if duration == 0 {
        return "🔴".to_string();
    }
    let filled = (position.min(duration) * WIDTH / duration) as usize;
    format!(
        "{}🔘{}",
        "▬".repeat(filled),
        "▬".repeat(WIDTH as usize - filled)
    )
}

fn total_length(tracks: &[Track]) -> String {
    let secs: u64 = tracks.iter().map(Track::duration).sum();
    humantime::format_duration(Duration::from_secs(secs)).to_string()
}

fn page_footer(page: &TrackPage) -> CreateEmbedFooter {
    CreateEmbedFooter::new(format!(
        "Page {}/{} • {} track(s) • {}",
        page.current_page, page.total_pages, page.total_items, STANDARD_FOOTER
    ))
}

pub fn now_playing_embed(now: &NowPlaying) -> CreateEmbed {
    let track = &now.track;
    let status = match (now.paused, now.looping) {
        (true, _) => "⏸️ Paused",
        (false, true) => "🔂 Looping",
        (false, false) => "🎵 Now Playing",
    };

    CreateEmbed::default()
        .title(status)
        .description(format!("**[{}]({})**", track.title(), track.webpage_url()))
        .color(colors::SUCCESS_GREEN)
        .field("🎤 Uploader", track.uploader(), true)
        .field(
            "⏱️ Position",
            format!("{} / {}", format_seconds(now.position_secs), length(track)),
            true,
        )
        .field("🔗 Source", track.source_website().to_string(), true)
        .field("\u{200b}", progress_bar(now.position_secs, track.duration()), false)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn track_added_embed(track: &Track, position: usize, started: bool) -> CreateEmbed {
    let description = if started {
        format!("**{}** is starting now", track.title())
    } else {
        format!("**{}** was added to the queue at position {}", track.title(), position)
    };

    CreateEmbed::default()
        .title("✅ Track Added")
        .description(description)
        .url(track.webpage_url())
        .color(colors::SUCCESS_GREEN)
        .field("🎤 Uploader", track.uploader(), true)
        .field("⏱️ Duration", length(track), true)
        .field("🔗 Source", track.source_website().to_string(), true)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

pub fn queue_embed(snapshot: &QueueSnapshot, page: usize) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("📋 Queue")
        .color(colors::INFO_BLUE);

    if snapshot.current.is_none() && snapshot.queue.is_empty() {
        return embed
            .description("😴 **The queue is empty**\n\n💡 Use `/play <song>` to add music")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER));
    }

    if let Some(current) = &snapshot.current {
        let status = if snapshot.is_looping { "🔂" } else { "▶️" };
        embed = embed.field(
            format!("{status} Playing"),
            format!("**{}** - {} `{}`", current.title(), current.uploader(), length(current)),
            false,
        );
    }

    let listing = queue::page(&snapshot.queue, page, ITEMS_PER_PAGE);
    if !listing.items.is_empty() {
        let lines: Vec<String> = listing.items.iter().map(|(i, t)| track_line(*i, t)).collect();
        embed = embed.field("⏭️ Up next", lines.join("\n"), false);
    }

    let modes = [
        (snapshot.is_looping, "🔂 loop"),
        (snapshot.is_looping_queue, "🔁 loop queue"),
        (snapshot.is_random, "🔀 random"),
    ]
    .iter()
    .filter(|(on, _)| *on)
    .map(|(_, label)| *label)
    .collect::<Vec<_>>();

    embed
        .field(
            "⚙️ Modes",
            if modes.is_empty() { "none".to_string() } else { modes.join(", ") },
            true,
        )
        .field("🔍 Filters", snapshot.filters.describe(), true)
        .field("⏳ Total", total_length(&snapshot.queue), true)
        .footer(page_footer(&listing))
}

/// History is shown most recent first.
pub fn history_embed(snapshot: &QueueSnapshot, page: usize) -> CreateEmbed {
    let recent_first: Vec<Track> = snapshot.history.iter().rev().cloned().collect();
    track_list_embed("🕘 History", &recent_first, page, "Nothing has been played yet")
}

pub fn playlist_embed(name: &str, tracks: &[Track], page: usize) -> CreateEmbed {
    track_list_embed(&format!("📂 Playlist: {name}"), tracks, page, "This playlist is empty")
        .color(colors::MUSIC_PURPLE)
}

pub fn playlists_embed(names: &[String]) -> CreateEmbed {
    let description = if names.is_empty() {
        "No playlists yet. Create one with `/playlist create`".to_string()
    } else {
        names.iter().map(|n| format!("• {n}")).collect::<Vec<_>>().join("\n")
    };

    CreateEmbed::default()
        .title("📂 Playlists")
        .description(description)
        .color(colors::MUSIC_PURPLE)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

fn track_list_embed(title: &str, tracks: &[Track], page: usize, empty: &str) -> CreateEmbed {
    let listing = queue::page(tracks, page, ITEMS_PER_PAGE);
    let description = if listing.items.is_empty() {
        empty.to_string()
    } else {
        listing
            .items
            .iter()
            .map(|(i, t)| track_line(*i, t))
            .collect::<Vec<_>>()
            .join("\n")
    };

    CreateEmbed::default()
        .title(title)
        .description(description)
        .color(colors::INFO_BLUE)
        .footer(page_footer(&listing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::queue::TrackFilters, sources::test_track};

    fn rendered(embed: &CreateEmbed) -> String {
        serde_json::to_string(embed).unwrap()
    }

    fn snapshot() -> QueueSnapshot {
        QueueSnapshot {
            current: Some(test_track("Current Song", 240)),
            queue: (1..=12).map(|i| test_track(&format!("Queued {i}"), 60)).collect(),
            history: vec![test_track("Old", 60), test_track("Newer", 60)],
            is_looping: false,
            is_looping_queue: true,
            is_random: false,
            filters: TrackFilters::default(),
        }
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(0, 100).chars().next(), Some('🔘'));
        assert!(progress_bar(100, 100).ends_with('🔘'));
        assert_eq!(progress_bar(5, 0), "🔴");
    }

    #[test]
    fn test_queue_embed_pages() {
        let json = rendered(&queue_embed(&snapshot(), 2));
        assert!(json.contains("Current Song"));
        assert!(json.contains("Queued 11"));
        assert!(!json.contains("[Queued 3]"));
        assert!(json.contains("Page 2/2"));
        assert!(json.contains("loop queue"));
    }

    #[test]
    fn test_history_is_most_recent_first() {
        let json = rendered(&history_embed(&snapshot(), 1));
        let newer = json.find("Newer").unwrap();
        let old = json.find("Old").unwrap();
        assert!(newer < old);
    }
}
