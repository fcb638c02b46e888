//! Pure operations over track lists.
//!
//! These functions back the queue, the history, the loop snapshot and the
//! saved playlists alike. They never lock, never log user data and never
//! touch the guild registry: callers hand in the list they already hold.

use rand::{seq::SliceRandom, Rng};
use std::collections::HashSet;

use crate::{
    error::{MusicError, MusicResult},
    sources::{SourceWebsite, Track, TrackResolver},
};

/// Active next-track filters of a guild.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackFilters {
    pub uploader: Option<String>,
    pub min_duration: Option<u64>,
    pub max_duration: Option<u64>,
    pub source: Option<SourceWebsite>,
}

impl TrackFilters {
    pub fn is_empty(&self) -> bool {
        self.uploader.is_none()
            && self.min_duration.is_none()
            && self.max_duration.is_none()
            && self.source.is_none()
    }

    /// A track matches when it satisfies every active filter.
    pub fn matches(&self, track: &Track) -> bool {
        if let Some(uploader) = &self.uploader {
            if normalize(uploader) != normalize(track.uploader()) {
                return false;
            }
        }
        if let Some(min) = self.min_duration {
            if track.duration() < min {
                return false;
            }
        }
        if let Some(max) = self.max_duration {
            if track.duration() > max {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if !source.same_family(&track.source_website()) {
                return false;
            }
        }
        true
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(uploader) = &self.uploader {
            parts.push(format!("uploader = {uploader}"));
        }
        if let Some(min) = self.min_duration {
            parts.push(format!("min duration = {}", format_seconds(min)));
        }
        if let Some(max) = self.max_duration {
            parts.push(format!("max duration = {}", format_seconds(max)));
        }
        if let Some(source) = &self.source {
            parts.push(format!("source = {source}"));
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Lowercase with all whitespace removed.
fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Finds a track by title (case and whitespace insensitive) or, when
/// `by_index`, by 1-based position. Returns the track and its 0-based index.
pub fn find_track(name_or_index: &str, list: &[Track], by_index: bool) -> MusicResult<(Track, usize)> {
    let needle = name_or_index.trim();
    if needle.is_empty() {
        return Err(MusicError::validation("No track name given"));
    }

    if by_index {
        let position: usize = needle
            .parse()
            .map_err(|_| MusicError::validation(format!("'{needle}' is not a valid position")))?;
        if position == 0 || position > list.len() {
            return Err(MusicError::validation(format!(
                "Position {position} is out of range (1-{})",
                list.len()
            )));
        }
        return Ok((list[position - 1].clone(), position - 1));
    }

    let wanted = normalize(needle);
    list.iter()
        .position(|t| normalize(t.title()) == wanted)
        .map(|i| (list[i].clone(), i))
        .ok_or_else(|| MusicError::validation(format!("'{needle}' was not found")))
}

/// Resolves every name before removing anything, then removes by
/// descending index. Returns the removed tracks in request order.
pub fn remove_tracks(names: &[String], list: &mut Vec<Track>, by_index: bool) -> MusicResult<Vec<Track>> {
    if names.is_empty() {
        return Err(MusicError::validation("No tracks given"));
    }

    let mut indexes = Vec::with_capacity(names.len());
    let mut seen = HashSet::new();
    for name in names {
        let (track, index) = find_track(name, list, by_index)?;
        if !seen.insert(index) {
            return Err(MusicError::validation(format!(
                "'{}' was given more than once",
                track.title()
            )));
        }
        indexes.push(index);
    }

    let removed: Vec<Track> = indexes.iter().map(|&i| list[i].clone()).collect();

    let mut descending = indexes;
    descending.sort_unstable_by(|a, b| b.cmp(a));
    for index in descending {
        list.remove(index);
    }

    Ok(removed)
}

/// Moves a track to the 1-based `new_position`. Returns the track and its
/// old and new 0-based indexes.
pub fn reposition_track(
    name: &str,
    new_position: usize,
    list: &mut Vec<Track>,
    by_index: bool,
) -> MusicResult<(Track, usize, usize)> {
    let (track, old_index) = find_track(name, list, by_index)?;

    if new_position == 0 || new_position > list.len() {
        return Err(MusicError::validation(format!(
            "Position {new_position} is out of range (1-{})",
            list.len()
        )));
    }

    let new_index = new_position - 1;
    if new_index == old_index {
        return Err(MusicError::validation(format!(
            "'{}' is already at position {new_position}",
            track.title()
        )));
    }

    let moved = list.remove(old_index);
    list.insert(new_index, moved);
    Ok((track, old_index, new_index))
}

/// Resolves the replacement for `current`; rejects a lookup that lands on
/// the same webpage.
pub async fn resolve_replacement(
    resolver: &dyn TrackResolver,
    current: &Track,
    query: &str,
    source_hint: Option<SourceWebsite>,
) -> MusicResult<Track> {
    let replacement = resolver.resolve(query, source_hint).await?;
    if replacement.webpage_url() == current.webpage_url() {
        return Err(MusicError::validation(format!(
            "'{}' would be replaced by the same track",
            current.title()
        )));
    }
    Ok(replacement)
}

/// Replaces the track found by `name` with `replacement`, returning the old
/// track. Identical webpages are rejected.
pub fn replace_track(name: &str, list: &mut [Track], by_index: bool, replacement: Track) -> MusicResult<Track> {
    let (old, index) = find_track(name, list, by_index)?;
    if old.webpage_url() == replacement.webpage_url() {
        return Err(MusicError::validation(format!(
            "'{}' would be replaced by the same track",
            old.title()
        )));
    }
    list[index] = replacement;
    Ok(old)
}

/// Bulk rename. Every pair is validated before any title changes.
pub fn rename_tracks(
    pairs: &[(String, String)],
    list: &mut [Track],
    by_index: bool,
    max_name_length: usize,
) -> MusicResult<Vec<(String, String)>> {
    if pairs.is_empty() {
        return Err(MusicError::validation("No tracks given"));
    }

    let mut planned = Vec::with_capacity(pairs.len());
    let mut sources = HashSet::new();
    let mut targets = HashSet::new();

    for (name, new_name) in pairs {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(MusicError::validation("The new name is empty"));
        }
        if new_name.chars().count() > max_name_length {
            return Err(MusicError::validation(format!(
                "'{new_name}' is longer than {max_name_length} characters"
            )));
        }

        let (track, index) = find_track(name, list, by_index)?;
        if track.title() == new_name {
            return Err(MusicError::validation(format!(
                "'{}' already has that name",
                track.title()
            )));
        }
        if !sources.insert(index) {
            return Err(MusicError::validation(format!(
                "'{}' was given more than once",
                track.title()
            )));
        }
        if !targets.insert(normalize(new_name)) {
            return Err(MusicError::validation(format!("'{new_name}' is used more than once")));
        }

        planned.push((index, track.title().to_string(), new_name.to_string()));
    }

    Ok(planned
        .into_iter()
        .map(|(index, old, new)| {
            list[index] = list[index].clone().with_title(new.clone());
            (old, new)
        })
        .collect())
}

/// Removes and returns the first track matching `filters`; falls back to
/// the head when nothing matches. `None` only for an empty queue.
pub fn find_next_filtered_track(queue: &mut Vec<Track>, filters: &TrackFilters) -> Option<Track> {
    if queue.is_empty() {
        return None;
    }
    let index = queue.iter().position(|t| filters.matches(t)).unwrap_or(0);
    Some(queue.remove(index))
}

/// Removes and returns a uniformly random track.
pub fn take_random_track(queue: &mut Vec<Track>) -> Option<Track> {
    if queue.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..queue.len());
    Some(queue.remove(index))
}

/// Pops up to `amount - 1` extra tracks from the head (bounded by the queue
/// length and `cap`) unless looping, and returns them after the current
/// track as the skipped set.
pub fn skip_tracks(
    queue: &mut Vec<Track>,
    current: Option<&Track>,
    is_looping: bool,
    amount: usize,
    cap: usize,
) -> Vec<Track> {
    let mut skipped: Vec<Track> = current.cloned().into_iter().collect();

    if !is_looping {
        let extra = amount.saturating_sub(1).min(cap).min(queue.len());
        skipped.extend(queue.drain(..extra));
    }

    skipped
}

pub fn shuffle(list: &mut [Track]) {
    list.shuffle(&mut rand::thread_rng());
}

/// Parses "90", "1:30" or "1:02:03" into seconds.
pub fn parse_timestamp(input: &str) -> MusicResult<u64> {
    let invalid = || MusicError::validation(format!("'{}' is not a valid time", input.trim()));

    let parts: Vec<&str> = input.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(invalid());
    }

    let mut total: u64 = 0;
    for (i, part) in parts.iter().enumerate() {
        let value: u64 = part.trim().parse().map_err(|_| invalid())?;
        if i > 0 && value >= 60 {
            return Err(invalid());
        }
        total = total
            .checked_mul(60)
            .and_then(|t| t.checked_add(value))
            .ok_or_else(|| MusicError::validation(format!("'{}' is too far into the track", input.trim())))?;
    }
    Ok(total)
}

pub fn format_seconds(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

/// A page of a track list.
#[derive(Debug, Clone)]
pub struct TrackPage {
    pub items: Vec<(usize, Track)>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

/// Slices `list` into 1-based pages; out-of-range pages clamp to the last.
pub fn page<'a>(list: impl IntoIterator<Item = &'a Track>, page: usize, per_page: usize) -> TrackPage {
    let all: Vec<&Track> = list.into_iter().collect();
    let per_page = per_page.max(1);
    let total_pages = all.len().div_ceil(per_page).max(1);
    let current_page = page.clamp(1, total_pages);
    let start = (current_page - 1) * per_page;

    TrackPage {
        items: all
            .iter()
            .enumerate()
            .skip(start)
            .take(per_page)
            .map(|(i, t)| (i + 1, (*t).clone()))
            .collect(),
        current_page,
        total_pages,
        total_items: all.len(),
    }
}
