use anyhow::Result;
use serenity::{
    all::{CommandDataOptionValue, Permissions},
    builder::{CreateEmbed, CreateMessage, EditInteractionResponse},
    model::{
        application::CommandInteraction,
        channel::Message,
        id::{ChannelId, GuildId, RoleId, UserId},
    },
    prelude::Context,
};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::{
    audio::queue::{self, format_seconds, parse_timestamp, TrackFilters},
    bot::GuildTunesBot,
    error::{MusicError, MusicResult},
    sources::SourceWebsite,
    storage::RoleKind,
    ui::embeds,
};

/// Commands that require the caller to share the bot's voice channel.
const VOICE_BOUND: &[&str] = &[
    "leave", "play", "pause", "resume", "skip", "stop", "loop", "loopqueue", "random", "shuffle",
    "remove", "move", "rename", "replace", "filter", "seek", "rewind", "forward", "restart",
];

/// A command with its arguments, whether it came from a slash interaction
/// or a prefixed message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub name: String,
    args: HashMap<String, String>,
}

impl Request {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn from_slash(command: &CommandInteraction) -> Self {
        let mut request = Self::new(command.data.name.as_str());
        for option in &command.data.options {
            let value = match &option.value {
                CommandDataOptionValue::String(s) => s.clone(),
                CommandDataOptionValue::Integer(i) => i.to_string(),
                CommandDataOptionValue::Number(n) => n.to_string(),
                CommandDataOptionValue::Boolean(b) => b.to_string(),
                CommandDataOptionValue::Role(role) => role.get().to_string(),
                _ => continue,
            };
            request.args.insert(option.name.clone(), value);
        }
        request
    }

    /// Parses `!name arg arg rest...`. Arguments are positional and the last
    /// one takes the remainder; with `|` in the text the arguments are split
    /// on `|` instead. Unknown commands yield `None`.
    pub fn from_prefix(content: &str, prefix: &str) -> Option<Self> {
        let body = content.trim().strip_prefix(prefix)?.trim_start();
        let (name, rest) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (body, ""),
        };
        let name = name.to_lowercase();
        let piped = rest.contains('|');
        let layout = positional_layout(&name, rest.split_whitespace().next(), piped)?;

        let mut values: Vec<String> = if piped {
            rest.split('|').map(|v| v.trim().to_string()).collect()
        } else {
            split_greedy(rest, layout.len()).into_iter().map(str::to_string).collect()
        };
        // Extra pipes belong to the last argument
        if !layout.is_empty() && values.len() > layout.len() {
            let tail = values.split_off(layout.len() - 1).join(" | ");
            values.push(tail);
        }

        let mut request = Self::new(name);
        for (key, value) in layout.iter().zip(values) {
            if !value.is_empty() {
                request.args.insert(key.to_string(), value);
            }
        }
        Some(request)
    }

    /// Non-blank argument value.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> MusicResult<&str> {
        self.arg(key)
            .ok_or_else(|| MusicError::validation(format!("Missing argument `{key}`")))
    }

    fn number(&self, key: &str) -> MusicResult<Option<usize>> {
        self.arg(key)
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| MusicError::validation(format!("`{key}` must be a positive number")))
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> bool {
        self.arg(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    fn page(&self) -> MusicResult<usize> {
        Ok(self.number("page")?.unwrap_or(1))
    }

    fn source_hint(&self) -> MusicResult<Option<SourceWebsite>> {
        self.arg("source")
            .map(|raw| {
                SourceWebsite::parse(raw)
                    .ok_or_else(|| MusicError::validation(format!("Unknown source '{raw}'")))
            })
            .transpose()
    }

    /// Comma separated track targets. `#n` entries are positions.
    fn targets(&self, key: &str) -> MusicResult<(Vec<String>, bool)> {
        let items: Vec<&str> = self
            .required(key)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if items.is_empty() {
            return Err(MusicError::validation("No tracks given"));
        }
        let by_index = self.flag("by_index") || items.iter().all(|s| s.starts_with('#'));
        let names = items
            .iter()
            .map(|s| s.trim_start_matches('#').trim().to_string())
            .collect();
        Ok((names, by_index))
    }

    fn target(&self, key: &str) -> MusicResult<(String, bool)> {
        let raw = self.required(key)?;
        let by_index = self.flag("by_index") || raw.starts_with('#');
        Ok((raw.trim_start_matches('#').trim().to_string(), by_index))
    }
}

/// Argument names in positional order. Without pipes a playlist name is
/// greedy, so pages can only follow it in piped form.
fn positional_layout(name: &str, first: Option<&str>, piped: bool) -> Option<&'static [&'static str]> {
    let layout: &'static [&'static str] = match name {
        "join" | "leave" | "pause" | "resume" | "stop" | "nowplaying" | "loop" | "loopqueue"
        | "random" | "shuffle" | "restart" => &[],
        "play" => &["query"],
        "skip" => &["amount"],
        "queue" | "history" => &["page"],
        "remove" => &["tracks"],
        "move" => &["track", "position"],
        "rename" => &["track", "name"],
        "replace" => &["track", "query"],
        "filter" => &["kind", "value"],
        "seek" => &["time"],
        "rewind" | "forward" => &["seconds"],
        "role" => &["kind", "role"],
        "playlist" => match first.map(str::to_lowercase).as_deref() {
            Some("add") => &["action", "playlist", "query"],
            Some("remove") => &["action", "playlist", "tracks"],
            Some("move") => &["action", "playlist", "track", "position"],
            Some("retitle") => &["action", "playlist", "track", "title"],
            Some("replace") => &["action", "playlist", "track", "query"],
            Some("rename") => &["action", "playlist", "new_name"],
            _ if piped => &["action", "playlist", "page"],
            _ => &["action", "playlist"],
        },
        _ => return None,
    };
    Some(layout)
}

/// Splits on whitespace into at most `n` pieces; the last keeps the rest.
fn split_greedy(rest: &str, n: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut remaining = rest.trim();
    while !remaining.is_empty() && n > 0 {
        if out.len() + 1 == n {
            out.push(remaining);
            break;
        }
        match remaining.split_once(char::is_whitespace) {
            Some((head, tail)) => {
                out.push(head);
                remaining = tail.trim_start();
            }
            None => {
                out.push(remaining);
                break;
            }
        }
    }
    out
}

/// Accepts a role mention, a raw id, or `none`/`clear` to drop the requirement.
pub fn parse_role(raw: &str) -> MusicResult<Option<RoleId>> {
    let raw = raw.trim();
    if ["none", "clear", "off"].iter().any(|w| raw.eq_ignore_ascii_case(w)) {
        return Ok(None);
    }
    let digits = raw
        .strip_prefix("<@&")
        .and_then(|r| r.strip_suffix('>'))
        .unwrap_or(raw);
    match digits.parse::<u64>() {
        Ok(id) if id != 0 => Ok(Some(RoleId::new(id))),
        _ => Err(MusicError::validation(format!("'{raw}' is not a role"))),
    }
}

/// Who sent the command, and where.
#[derive(Debug, Clone)]
pub struct Invoker {
    pub user: UserId,
    pub guild: GuildId,
    pub channel: ChannelId,
    pub roles: Vec<RoleId>,
    pub is_manager: bool,
}

impl Invoker {
    pub fn from_interaction(command: &CommandInteraction, guild: GuildId) -> Self {
        let member = command.member.as_deref();
        Self {
            user: command.user.id,
            guild,
            channel: command.channel_id,
            roles: member.map(|m| m.roles.clone()).unwrap_or_default(),
            is_manager: member
                .and_then(|m| m.permissions)
                .is_some_and(is_manager_permissions),
        }
    }

    pub fn from_message(ctx: &Context, msg: &Message, guild: GuildId) -> Self {
        let roles = msg
            .member
            .as_ref()
            .map(|m| m.roles.clone())
            .unwrap_or_default();
        let is_manager = ctx.cache.guild(guild).is_some_and(|g| {
            g.owner_id == msg.author.id
                || roles
                    .iter()
                    .filter_map(|r| g.roles.get(r))
                    .any(|r| is_manager_permissions(r.permissions))
        });

        Self {
            user: msg.author.id,
            guild,
            channel: msg.channel_id,
            roles,
            is_manager,
        }
    }
}

fn is_manager_permissions(permissions: Permissions) -> bool {
    permissions.contains(Permissions::ADMINISTRATOR) || permissions.contains(Permissions::MANAGE_GUILD)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Anyone,
    Role(RoleKind),
    Manager,
}

fn access_for(request: &Request) -> Access {
    match request.name.as_str() {
        "queue" | "history" | "nowplaying" => Access::Anyone,
        "role" => Access::Manager,
        "playlist" => Access::Role(RoleKind::Playlist),
        _ => Access::Role(RoleKind::Music),
    }
}

/// Managers bypass role requirements.
fn role_allows(required: Option<RoleId>, invoker: &Invoker) -> bool {
    match required {
        Some(role) => invoker.is_manager || invoker.roles.contains(&role),
        None => true,
    }
}

async fn check_access(bot: &GuildTunesBot, invoker: &Invoker, access: Access) -> MusicResult<()> {
    match access {
        Access::Anyone => Ok(()),
        Access::Manager if invoker.is_manager => Ok(()),
        Access::Manager => Err(MusicError::validation(
            "You need the Manage Server permission to use this command",
        )),
        Access::Role(kind) => {
            let required = bot.roles.get(invoker.guild, kind).await?;
            if role_allows(required, invoker) {
                Ok(())
            } else {
                let role = required.map(|r| r.get()).unwrap_or_default();
                Err(MusicError::validation(format!(
                    "You need the <@&{role}> role to use this command"
                )))
            }
        }
    }
}

/// What a command answers with.
pub enum Reply {
    Text(String),
    Embed(CreateEmbed),
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub async fn send_to_channel(self, ctx: &Context, channel: ChannelId) -> Result<()> {
        let message = match self {
            Reply::Text(text) => CreateMessage::new().content(text),
            Reply::Embed(embed) => CreateMessage::new().embed(embed),
        };
        channel.send_message(&ctx.http, message).await?;
        Ok(())
    }

    pub async fn edit_interaction(self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        let response = match self {
            Reply::Text(text) => EditInteractionResponse::new().content(text),
            Reply::Embed(embed) => EditInteractionResponse::new().embed(embed),
        };
        command.edit_response(&ctx.http, response).await?;
        Ok(())
    }
}

/// Runs a command and turns every outcome into a reply.
pub async fn dispatch(ctx: &Context, bot: &GuildTunesBot, invoker: &Invoker, request: &Request) -> Reply {
    info!(
        "📝 Command {} used by {} in guild {}",
        request.name, invoker.user, invoker.guild
    );

    let result = match check_access(bot, invoker, access_for(request)).await {
        Ok(()) => execute(ctx, bot, invoker, request).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(reply) => reply,
        Err(e) => error_reply(&request.name, &e),
    }
}

fn error_reply(command: &str, err: &anyhow::Error) -> Reply {
    match err.downcast_ref::<MusicError>() {
        Some(e) if e.is_contention() => {
            debug!("⏳ {} rejected: {}", command, e);
            Reply::text(e.user_message())
        }
        Some(e) => {
            warn!("⚠️ {} failed: {}", command, e);
            Reply::text(e.user_message())
        }
        None => {
            error!("❌ Unexpected error in {}: {:?}", command, err);
            Reply::text("❌ An unknown error occurred")
        }
    }
}

async fn execute(ctx: &Context, bot: &GuildTunesBot, invoker: &Invoker, request: &Request) -> Result<Reply> {
    let guild = invoker.guild;
    let engine = &bot.engine;

    if VOICE_BOUND.contains(&request.name.as_str()) {
        same_channel(ctx, invoker)?;
    }

    let reply = match request.name.as_str() {
        "join" => {
            if engine.guilds().get(guild).is_some() {
                return Err(MusicError::validation("I'm already in a voice channel").into());
            }
            let channel = user_voice_channel(ctx, invoker)?;
            bot.join_voice_channel(ctx, guild, channel, invoker.channel).await?;
            Reply::text(format!("🔊 Joined <#{channel}>"))
        }
        "leave" => {
            engine.disconnect(guild, true).await?;
            Reply::text("👋 Left the voice channel")
        }
        "play" => {
            let query = request.required("query")?;
            let hint = request.source_hint()?;
            ensure_joined(ctx, bot, invoker).await?;
            let track = engine.resolve_for(guild, query, hint).await?;
            let added = engine.enqueue(guild, vec![track.clone()]).await?;
            Reply::Embed(embeds::track_added_embed(&track, added.position, added.started))
        }
        "pause" => {
            engine.pause(guild).await?;
            Reply::text("⏸️ Paused")
        }
        "resume" => {
            engine.resume(guild).await?;
            Reply::text("▶️ Resumed")
        }
        "skip" => {
            let amount = request.number("amount")?.unwrap_or(1);
            let skipped = engine.skip(guild, amount).await?;
            match skipped.as_slice() {
                [] => Reply::text("❌ Nothing to skip"),
                [only] => Reply::text(format!("⏭️ Skipped **{}**", only.title())),
                many => Reply::text(format!("⏭️ Skipped {} tracks", many.len())),
            }
        }
        "stop" => {
            engine.stop(guild).await?;
            Reply::text("⏹️ Stopped playback and cleared the queue")
        }
        "queue" => Reply::Embed(embeds::queue_embed(&engine.snapshot(guild)?, request.page()?)),
        "history" => Reply::Embed(embeds::history_embed(&engine.snapshot(guild)?, request.page()?)),
        "nowplaying" => match engine.now_playing(guild)? {
            Some(now) => Reply::Embed(embeds::now_playing_embed(&now)),
            None => Reply::text("❌ Nothing is playing"),
        },
        "loop" => Reply::text(if engine.toggle_loop(guild)? {
            "🔂 Loop enabled"
        } else {
            "➡️ Loop disabled"
        }),
        "loopqueue" => Reply::text(if engine.toggle_loop_queue(guild)? {
            "🔁 Queue loop enabled"
        } else {
            "➡️ Queue loop disabled"
        }),
        "random" => Reply::text(if engine.toggle_random(guild)? {
            "🔀 Random mode enabled"
        } else {
            "➡️ Random mode disabled"
        }),
        "shuffle" => {
            let count = engine.edit_queue(guild, |q| {
                if q.len() < 2 {
                    return Err(MusicError::validation("Not enough tracks to shuffle"));
                }
                queue::shuffle(q);
                Ok(q.len())
            })?;
            Reply::text(format!("🔀 Shuffled {count} tracks"))
        }
        "remove" => {
            let (targets, by_index) = request.targets("tracks")?;
            let removed = engine.edit_queue(guild, |q| queue::remove_tracks(&targets, q, by_index))?;
            Reply::text(format!("🗑️ Removed: {}", titles(&removed)))
        }
        "move" => {
            let (target, by_index) = request.target("track")?;
            let position = request
                .number("position")?
                .ok_or_else(|| MusicError::validation("Missing argument `position`"))?;
            let (track, old, new) =
                engine.edit_queue(guild, |q| queue::reposition_track(&target, position, q, by_index))?;
            Reply::text(format!(
                "↕️ Moved **{}** from {} to {}",
                track.title(),
                old + 1,
                new + 1
            ))
        }
        "rename" => {
            let (target, by_index) = request.target("track")?;
            let pairs = [(target, request.required("name")?.to_string())];
            let max = bot.config.max_name_length;
            let renamed = engine.edit_queue(guild, |q| queue::rename_tracks(&pairs, q, by_index, max))?;
            Reply::text(renamed_lines(&renamed))
        }
        "replace" => {
            let (target, by_index) = request.target("track")?;
            let query = request.required("query")?;
            let (old, new) = engine
                .replace_in_queue(guild, &target, by_index, query, request.source_hint()?)
                .await?;
            Reply::text(format!("🔄 Replaced **{}** with **{}**", old.title(), new.title()))
        }
        "filter" => {
            let filters = next_filters(engine.snapshot(guild)?.filters, request)?;
            let applied = engine.update_filters(guild, |f| *f = filters)?;
            Reply::text(format!("🔍 Filters: {}", applied.describe()))
        }
        "seek" => {
            let target = parse_timestamp(request.required("time")?)?;
            let position = engine.seek(guild, target).await?;
            Reply::text(format!("⏩ Jumped to {}", format_seconds(position)))
        }
        "rewind" => {
            let amount = parse_timestamp(request.required("seconds")?)?;
            let position = engine.rewind(guild, amount).await?;
            Reply::text(format!("⏪ Rewound to {}", format_seconds(position)))
        }
        "forward" => {
            let amount = parse_timestamp(request.required("seconds")?)?;
            let position = engine.forward(guild, amount).await?;
            Reply::text(format!("⏩ Forwarded to {}", format_seconds(position)))
        }
        "restart" => {
            engine.restart(guild).await?;
            Reply::text("🔁 Restarted the track")
        }
        "playlist" => handle_playlist(ctx, bot, invoker, request).await?,
        "role" => {
            let raw_kind = request.required("kind")?;
            let kind = RoleKind::parse(raw_kind)
                .ok_or_else(|| MusicError::validation(format!("Unknown role kind '{raw_kind}'")))?;
            let role = match request.arg("role") {
                Some(raw) => parse_role(raw)?,
                None => None,
            };
            bot.roles.set(guild, kind, role).await?;
            match role {
                Some(role) => Reply::text(format!("🛡️ {raw_kind} commands now require <@&{role}>")),
                None => Reply::text(format!("🛡️ {raw_kind} commands are open to everyone")),
            }
        }
        _ => Reply::text("❌ Unknown command"),
    };

    Ok(reply)
}

async fn handle_playlist(
    ctx: &Context,
    bot: &GuildTunesBot,
    invoker: &Invoker,
    request: &Request,
) -> Result<Reply> {
    let guild = invoker.guild;
    let playlists = &bot.playlists;
    let action = request.required("action")?.to_lowercase();

    if action == "show" && request.arg("playlist").is_none() {
        return Ok(Reply::Embed(embeds::playlists_embed(&playlists.names(guild).await?)));
    }
    let name = request.required("playlist")?;

    let reply = match action.as_str() {
        "create" => {
            playlists.create(guild, name).await?;
            Reply::text(format!("📂 Created playlist **{name}**"))
        }
        "delete" => {
            let count = playlists.delete(guild, name).await?;
            Reply::text(format!("🗑️ Deleted playlist **{name}** ({count} tracks)"))
        }
        "show" => {
            let tracks = playlists.tracks(guild, name).await?;
            Reply::Embed(embeds::playlist_embed(name, &tracks, request.page()?))
        }
        "add" => {
            let track = match request.arg("query") {
                Some(query) => bot.engine.resolver().resolve(query, request.source_hint()?).await?,
                None => bot
                    .engine
                    .now_playing(guild)
                    .ok()
                    .flatten()
                    .map(|now| now.track)
                    .ok_or_else(|| MusicError::validation("Nothing is playing; give a track to add"))?,
            };
            playlists.add(guild, name, vec![track.clone()]).await?;
            Reply::text(format!("➕ Added **{}** to **{name}**", track.title()))
        }
        "remove" => {
            let (targets, by_index) = request.targets("tracks")?;
            let removed = playlists.remove(guild, name, &targets, by_index).await?;
            Reply::text(format!("🗑️ Removed from **{name}**: {}", titles(&removed)))
        }
        "move" => {
            let (target, by_index) = request.target("track")?;
            let position = request
                .number("position")?
                .ok_or_else(|| MusicError::validation("Missing argument `position`"))?;
            let (track, old, new) = playlists.reposition(guild, name, &target, position, by_index).await?;
            Reply::text(format!(
                "↕️ Moved **{}** from {} to {} in **{name}**",
                track.title(),
                old + 1,
                new + 1
            ))
        }
        "retitle" => {
            let (target, by_index) = request.target("track")?;
            let pairs = [(target, request.required("title")?.to_string())];
            let renamed = playlists.rename_tracks(guild, name, &pairs, by_index).await?;
            Reply::text(renamed_lines(&renamed))
        }
        "replace" => {
            let (target, by_index) = request.target("track")?;
            let query = request.required("query")?;
            let (old, replacement) = playlists
                .replace_with(
                    bot.engine.resolver().as_ref(),
                    guild,
                    name,
                    &target,
                    by_index,
                    query,
                    request.source_hint()?,
                )
                .await?;
            Reply::text(format!(
                "🔄 Replaced **{}** with **{}** in **{name}**",
                old.title(),
                replacement.title()
            ))
        }
        "play" => {
            same_channel(ctx, invoker)?;
            let tracks = playlists.tracks(guild, name).await?;
            if tracks.is_empty() {
                return Err(MusicError::validation(format!("Playlist '{name}' is empty")).into());
            }
            ensure_joined(ctx, bot, invoker).await?;
            let added = bot.engine.enqueue(guild, tracks).await?;
            Reply::text(format!("▶️ Queued {} tracks from **{name}**", added.added))
        }
        "rename" => {
            let new_name = request.required("new_name")?;
            playlists.rename_playlist(guild, name, new_name).await?;
            Reply::text(format!("✏️ Renamed playlist **{name}** to **{}**", new_name.trim()))
        }
        other => Reply::text(format!("❌ Unknown playlist action '{other}'")),
    };

    Ok(reply)
}

/// Applies the `filter` command to the current filters.
fn next_filters(mut filters: TrackFilters, request: &Request) -> MusicResult<TrackFilters> {
    let kind = request.required("kind")?.to_lowercase();
    let value = request.arg("value");

    match kind.as_str() {
        "clear" => filters = TrackFilters::default(),
        "uploader" => filters.uploader = value.map(str::to_string),
        "min" => filters.min_duration = value.map(parse_timestamp).transpose()?,
        "max" => filters.max_duration = value.map(parse_timestamp).transpose()?,
        "source" => {
            filters.source = value
                .map(|raw| {
                    SourceWebsite::parse(raw)
                        .ok_or_else(|| MusicError::validation(format!("Unknown source '{raw}'")))
                })
                .transpose()?
        }
        other => return Err(MusicError::validation(format!("Unknown filter '{other}'"))),
    }

    if let (Some(min), Some(max)) = (filters.min_duration, filters.max_duration) {
        if min > max {
            return Err(MusicError::validation(
                "The minimum duration is longer than the maximum",
            ));
        }
    }
    Ok(filters)
}

fn titles(tracks: &[crate::sources::Track]) -> String {
    tracks
        .iter()
        .map(|t| format!("**{}**", t.title()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn renamed_lines(renamed: &[(String, String)]) -> String {
    renamed
        .iter()
        .map(|(old, new)| format!("✏️ Renamed **{old}** to **{new}**"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Joins the caller's channel when the guild has no voice session yet.
async fn ensure_joined(ctx: &Context, bot: &GuildTunesBot, invoker: &Invoker) -> Result<()> {
    if bot.engine.guilds().get(invoker.guild).is_none() {
        let channel = user_voice_channel(ctx, invoker)?;
        bot.join_voice_channel(ctx, invoker.guild, channel, invoker.channel)
            .await?;
    }
    Ok(())
}

fn user_voice_channel(ctx: &Context, invoker: &Invoker) -> MusicResult<ChannelId> {
    ctx.cache
        .guild(invoker.guild)
        .and_then(|g| g.voice_states.get(&invoker.user).and_then(|v| v.channel_id))
        .ok_or_else(|| MusicError::validation("You must be in a voice channel"))
}

/// Rejects callers outside the bot's current voice channel.
fn same_channel(ctx: &Context, invoker: &Invoker) -> MusicResult<()> {
    let bot_id = ctx.cache.current_user().id;
    let Some(guild) = ctx.cache.guild(invoker.guild) else {
        return Ok(());
    };
    let bot_channel = guild.voice_states.get(&bot_id).and_then(|v| v.channel_id);
    let user_channel = guild.voice_states.get(&invoker.user).and_then(|v| v.channel_id);

    match (bot_channel, user_channel) {
        (Some(_), None) => Err(MusicError::validation("You must be in a voice channel")),
        (Some(bot), Some(user)) if bot != user => {
            Err(MusicError::validation(format!("You must be in <#{bot}> to do that")))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn invoker(roles: Vec<RoleId>, is_manager: bool) -> Invoker {
        Invoker {
            user: UserId::new(1),
            guild: GuildId::new(2),
            channel: ChannelId::new(3),
            roles,
            is_manager,
        }
    }

    #[test]
    fn test_prefix_last_argument_is_greedy() {
        let request = Request::from_prefix("!play never gonna give you up", "!").unwrap();
        assert_eq!(request.name, "play");
        assert_eq!(request.arg("query"), Some("never gonna give you up"));

        let request = Request::from_prefix("!MOVE #3 1", "!").unwrap();
        assert_eq!(request.name, "move");
        assert_eq!(request.arg("track"), Some("#3"));
        assert_eq!(request.arg("position"), Some("1"));
    }

    #[test]
    fn test_prefix_pipe_separated_arguments() {
        let request = Request::from_prefix("!play AC | DC live", "!").unwrap();
        assert_eq!(request.arg("query"), Some("AC | DC live"));

        let request = Request::from_prefix("!rename Old Song | New Song", "!").unwrap();
        assert_eq!(request.arg("track"), Some("Old Song"));
        assert_eq!(request.arg("name"), Some("New Song"));

        let request =
            Request::from_prefix("!playlist retitle | road trip | Old Title | New Title", "!").unwrap();
        assert_eq!(request.arg("action"), Some("retitle"));
        assert_eq!(request.arg("playlist"), Some("road trip"));
        assert_eq!(request.arg("track"), Some("Old Title"));
        assert_eq!(request.arg("title"), Some("New Title"));
    }

    #[test]
    fn test_prefix_playlist_layout_follows_action() {
        let request = Request::from_prefix("!playlist add mix lofi beats", "!").unwrap();
        assert_eq!(request.arg("playlist"), Some("mix"));
        assert_eq!(request.arg("query"), Some("lofi beats"));

        let request = Request::from_prefix("!playlist show", "!").unwrap();
        assert_eq!(request.arg("action"), Some("show"));
        assert_eq!(request.arg("playlist"), None);

        let request = Request::from_prefix("!playlist create road trip", "!").unwrap();
        assert_eq!(request.arg("playlist"), Some("road trip"));

        let request = Request::from_prefix("!playlist show | road trip | 2", "!").unwrap();
        assert_eq!(request.arg("playlist"), Some("road trip"));
        assert_eq!(request.arg("page"), Some("2"));
    }

    #[test]
    fn test_prefix_ignores_other_messages() {
        assert!(Request::from_prefix("hello there", "!").is_none());
        assert!(Request::from_prefix("!dance", "!").is_none());
        assert!(Request::from_prefix("!", "!").is_none());
        assert_eq!(Request::from_prefix("!stop now", "!").unwrap(), Request::new("stop"));
    }

    #[test]
    fn test_targets_detect_positions() {
        let request = Request::new("remove").with_arg("tracks", "#1, #3");
        assert_eq!(
            request.targets("tracks").unwrap(),
            (vec!["1".to_string(), "3".to_string()], true)
        );

        let request = Request::new("remove").with_arg("tracks", "Song A, #3");
        assert_eq!(request.targets("tracks").unwrap().1, false);

        let request = Request::new("remove")
            .with_arg("tracks", "2")
            .with_arg("by_index", "true");
        assert_eq!(request.targets("tracks").unwrap(), (vec!["2".to_string()], true));

        let request = Request::new("remove").with_arg("tracks", " , ");
        assert!(request.targets("tracks").is_err());
    }

    #[test]
    fn test_parse_role() {
        assert_eq!(parse_role("<@&42>").unwrap(), Some(RoleId::new(42)));
        assert_eq!(parse_role("42").unwrap(), Some(RoleId::new(42)));
        assert_eq!(parse_role("None").unwrap(), None);
        assert!(parse_role("0").is_err());
        assert!(parse_role("@everyone").is_err());
    }

    #[test]
    fn test_role_requirements() {
        let dj = RoleId::new(10);
        assert!(role_allows(None, &invoker(vec![], false)));
        assert!(role_allows(Some(dj), &invoker(vec![dj], false)));
        assert!(!role_allows(Some(dj), &invoker(vec![RoleId::new(11)], false)));
        assert!(role_allows(Some(dj), &invoker(vec![], true)));
    }

    #[test]
    fn test_access_categories() {
        assert_eq!(access_for(&Request::new("queue")), Access::Anyone);
        assert_eq!(access_for(&Request::new("role")), Access::Manager);
        assert_eq!(access_for(&Request::new("playlist")), Access::Role(RoleKind::Playlist));
        assert_eq!(access_for(&Request::new("skip")), Access::Role(RoleKind::Music));
    }

    #[test]
    fn test_filter_arguments() {
        let request = Request::new("filter").with_arg("kind", "min").with_arg("value", "1:00");
        let filters = next_filters(TrackFilters::default(), &request).unwrap();
        assert_eq!(filters.min_duration, Some(60));

        let request = Request::new("filter").with_arg("kind", "max").with_arg("value", "30");
        assert!(next_filters(filters.clone(), &request).is_err());

        let request = Request::new("filter").with_arg("kind", "min");
        assert_eq!(next_filters(filters, &request).unwrap(), TrackFilters::default());
    }

    #[test]
    fn test_error_replies() {
        let unknown = anyhow::anyhow!("boom");
        match error_reply("play", &unknown) {
            Reply::Text(text) => assert_eq!(text, "❌ An unknown error occurred"),
            Reply::Embed(_) => panic!("expected text"),
        }

        let locked: anyhow::Error = MusicError::locked("Playback").into();
        match error_reply("skip", &locked) {
            Reply::Text(text) => assert!(text.starts_with("⏳")),
            Reply::Embed(_) => panic!("expected text"),
        }
    }
}
