use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

/// Registers the commands globally
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registers the commands for one guild (development)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;

    Ok(())
}

fn all_commands() -> Vec<CreateCommand> {
    vec![
        join_command(),
        leave_command(),
        play_command(),
        simple("pause", "Pause the current track"),
        simple("resume", "Resume the paused track"),
        skip_command(),
        simple("stop", "Stop playback and clear the queue"),
        page_command("queue", "Show the queue"),
        page_command("history", "Show recently played tracks"),
        simple("nowplaying", "Show the current track"),
        simple("loop", "Toggle looping of the current track"),
        simple("loopqueue", "Toggle looping of the whole queue"),
        simple("random", "Toggle random next-track selection"),
        simple("shuffle", "Shuffle the queue once"),
        remove_command(),
        move_command(),
        rename_command(),
        replace_command(),
        filter_command(),
        seek_command(),
        offset_command("rewind", "Go back in the current track"),
        offset_command("forward", "Skip ahead in the current track"),
        simple("restart", "Restart the current track"),
        playlist_command(),
        role_command(),
    ]
}

fn simple(name: &str, description: &str) -> CreateCommand {
    CreateCommand::new(name).description(description)
}

fn by_index_option() -> CreateCommandOption {
    CreateCommandOption::new(
        CommandOptionType::Boolean,
        "by_index",
        "Treat track arguments as queue positions",
    )
}

fn source_option() -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::String, "source", "Website to search")
        .add_string_choice("YouTube", "youtube")
        .add_string_choice("YouTube Music", "youtubemusic")
        .add_string_choice("SoundCloud", "soundcloud")
        .add_string_choice("Bandcamp", "bandcamp")
}

// Connection

fn join_command() -> CreateCommand {
    CreateCommand::new("join").description("Join your voice channel")
}

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Leave the voice channel")
}

// Playback

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Play a track or add it to the queue")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "URL or search terms")
                .required(true),
        )
        .add_option(source_option())
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip")
        .description("Skip the current track")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "amount", "How many tracks to skip")
                .min_int_value(1),
        )
}

fn seek_command() -> CreateCommand {
    CreateCommand::new("seek")
        .description("Jump to a position in the current track")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "time", "Position, e.g. 90 or 1:30")
                .required(true),
        )
}

fn offset_command(name: &str, description: &str) -> CreateCommand {
    CreateCommand::new(name).description(description).add_option(
        CreateCommandOption::new(CommandOptionType::String, "seconds", "Amount, e.g. 15 or 1:00")
            .required(true),
    )
}

// Queue

fn page_command(name: &str, description: &str) -> CreateCommand {
    CreateCommand::new(name).description(description).add_option(
        CreateCommandOption::new(CommandOptionType::Integer, "page", "Page number").min_int_value(1),
    )
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Remove tracks from the queue")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "tracks",
                "Comma-separated titles or positions",
            )
            .required(true),
        )
        .add_option(by_index_option())
}

fn move_command() -> CreateCommand {
    CreateCommand::new("move")
        .description("Move a queued track to another position")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "track", "Title or position")
                .required(true),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "position", "New position")
                .min_int_value(1)
                .required(true),
        )
        .add_option(by_index_option())
}

fn rename_command() -> CreateCommand {
    CreateCommand::new("rename")
        .description("Rename a queued track")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "track", "Title or position")
                .required(true),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "name", "New title").required(true),
        )
        .add_option(by_index_option())
}

fn replace_command() -> CreateCommand {
    CreateCommand::new("replace")
        .description("Replace a queued track with another one")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "track", "Title or position")
                .required(true),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "URL or search terms")
                .required(true),
        )
        .add_option(source_option())
        .add_option(by_index_option())
}

fn filter_command() -> CreateCommand {
    CreateCommand::new("filter")
        .description("Filter which queued track plays next")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "kind", "Filter to set")
                .add_string_choice("Uploader", "uploader")
                .add_string_choice("Minimum duration", "min")
                .add_string_choice("Maximum duration", "max")
                .add_string_choice("Source website", "source")
                .add_string_choice("Clear all", "clear")
                .required(true),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "value",
            "Filter value; empty removes this filter",
        ))
}

// Playlists

fn playlist_command() -> CreateCommand {
    CreateCommand::new("playlist")
        .description("Manage saved playlists")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "action", "What to do")
                .add_string_choice("Create", "create")
                .add_string_choice("Delete", "delete")
                .add_string_choice("Show", "show")
                .add_string_choice("Add", "add")
                .add_string_choice("Remove", "remove")
                .add_string_choice("Move", "move")
                .add_string_choice("Retitle", "retitle")
                .add_string_choice("Replace", "replace")
                .add_string_choice("Play", "play")
                .add_string_choice("Rename", "rename")
                .required(true),
        )
        .add_option(CreateCommandOption::new(CommandOptionType::String, "playlist", "Playlist name"))
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "query",
            "Track to add or use as replacement; empty adds the current track",
        ))
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "tracks",
            "Comma-separated titles or positions",
        ))
        .add_option(CreateCommandOption::new(CommandOptionType::String, "track", "Title or position"))
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "position", "New position")
                .min_int_value(1),
        )
        .add_option(CreateCommandOption::new(CommandOptionType::String, "title", "New track title"))
        .add_option(CreateCommandOption::new(
            CommandOptionType::String,
            "new_name",
            "New playlist name",
        ))
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "page", "Page number").min_int_value(1),
        )
        .add_option(by_index_option())
}

// Administration

fn role_command() -> CreateCommand {
    CreateCommand::new("role")
        .description("Require a role for music or playlist commands")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "kind", "Command category")
                .add_string_choice("Music", "music")
                .add_string_choice("Playlist", "playlist")
                .required(true),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::Role,
            "role",
            "Required role; empty removes the requirement",
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names_are_unique() {
        let names: Vec<String> = all_commands()
            .iter()
            .map(|c| serde_json::to_value(c).unwrap()["name"].as_str().unwrap().to_string())
            .collect();
        let unique: std::collections::HashSet<&String> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
        assert!(names.iter().any(|n| n == "playlist"));
    }
}
