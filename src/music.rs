use serenity::{
    builder::{CreateEmbed, CreateMessage},
    model::prelude::*,
    prelude::*,
};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::error::PlaybackError;
use crate::library::VideoLibrary;
use crate::media::{MediaAcquirer, MediaSource, Requester};
use crate::orchestrator::{Admission, PlayRequest, PlaybackOrchestrator};
use crate::ytdlp::{is_twitch, is_youtube, twitch_title};

type MusicResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const SEARCH_LIMIT: usize = 5;

/// Everything a command needs, stored once in the client's TypeMap.
pub struct Bot {
    pub orchestrator: PlaybackOrchestrator,
    pub library: RwLock<VideoLibrary>,
    pub acquirer: Arc<dyn MediaAcquirer>,
    pub config: AppConfig,
}

pub struct BotStore;
impl TypeMapKey for BotStore {
    type Value = Arc<Bot>;
}

/// The parts of an incoming message commands care about, pulled out before
/// any await so the handler future stays Send.
#[derive(Clone, Copy, Debug)]
pub struct Invocation {
    pub channel: ChannelId,
    pub message_id: MessageId,
    pub author_id: UserId,
    pub guild_id: Option<GuildId>,
    pub user_voice: Option<ChannelId>,
}

impl Invocation {
    fn requester(&self) -> Requester {
        Requester { user_id: self.author_id, command_channel: self.channel, message_id: Some(self.message_id) }
    }

    fn guild(&self) -> Result<GuildId, PlaybackError> {
        self.guild_id.ok_or(PlaybackError::UnresolvableGuild)
    }
}

pub async fn handle_command(ctx: &Context, bot: &Bot, inv: Invocation, cmd: &str, args: &str) -> serenity::Result<()> {
    let color = bot.config.embed_color;
    let result: MusicResult<()> = match cmd {
        "play" => play_local(ctx, bot, inv, args).await,
        "playlink" => play_link(ctx, bot, inv, args).await,
        "ytplay" => yt_play(ctx, bot, inv, args).await,
        "ytsearch" => yt_search(ctx, bot, inv, args).await,
        "queue" => show_queue(ctx, bot, inv).await,
        "remove" => remove(ctx, bot, inv, args).await,
        "skip" => skip(ctx, bot, inv).await,
        "stop" => stop(ctx, bot, inv).await,
        "status" => status(ctx, bot, inv).await,
        "list" => list(ctx, bot, inv).await,
        "refresh" => refresh(ctx, bot, inv).await,
        "help" => help(ctx, bot, inv).await,
        _ => send_info(ctx, inv.channel, color, "❌ Error", "Invalid command").await,
    };

    if let Err(err) = result {
        tracing::warn!(command = cmd, error = %err, "command failed");
        let _ = inv.channel.create_reaction(&ctx.http, inv.message_id, ReactionType::Unicode("❌".into())).await;
        let _ = send_info(ctx, inv.channel, color, "❌ Error", &format!("{err}")).await;
    }

    Ok(())
}

async fn submit(
    ctx: &Context,
    bot: &Bot,
    inv: Invocation,
    source: MediaSource,
    title: Option<String>,
) -> MusicResult<()> {
    let display = title.clone().unwrap_or_else(|| source.to_string());
    let request = PlayRequest {
        guild_id: inv.guild_id,
        requester: inv.requester(),
        source,
        title,
        voice_channel_id: inv.user_voice,
    };

    match bot.orchestrator.play(request).await? {
        Admission::Started => {}
        Admission::Queued { position } => {
            send_info(
                ctx,
                inv.channel,
                bot.config.embed_color,
                "📋 Queued",
                &format!("**{display}** is #{position} in the queue"),
            )
            .await?;
        }
    }
    Ok(())
}

async fn play_local(ctx: &Context, bot: &Bot, inv: Invocation, args: &str) -> MusicResult<()> {
    let name = args.split_whitespace().next().ok_or("Provide a video name: play <name>")?;
    let video = bot.library.read().await.find(name)?.clone();
    tracing::info!(path = %video.path.display(), "playing local video");
    submit(ctx, bot, inv, MediaSource::LocalPath(video.path), Some(video.name)).await
}

async fn play_link(ctx: &Context, bot: &Bot, inv: Invocation, args: &str) -> MusicResult<()> {
    let link = args.split_whitespace().next().ok_or("Please provide a link.")?;

    let title = if is_youtube(link) {
        match bot.acquirer.resolve_info(link).await {
            Ok(info) => info.title,
            Err(e) => {
                tracing::error!(%link, error = %e, "failed to get YouTube video info");
                return Err("Failed to process YouTube link.".into());
            }
        }
    } else if is_twitch(link) {
        twitch_title(link)
    } else {
        None
    };

    submit(ctx, bot, inv, MediaSource::RemoteUrl(link.to_string()), title).await
}

async fn yt_play(ctx: &Context, bot: &Bot, inv: Invocation, args: &str) -> MusicResult<()> {
    let query = args.trim();
    if query.is_empty() {
        return Err("Please provide a video title.".into());
    }
    let first = bot
        .acquirer
        .search(query, 1)
        .await?
        .into_iter()
        .next()
        .ok_or("Could not find video")?;
    submit(ctx, bot, inv, MediaSource::RemoteUrl(first.url), Some(first.title)).await
}

async fn yt_search(ctx: &Context, bot: &Bot, inv: Invocation, args: &str) -> MusicResult<()> {
    let query = args.trim();
    if query.is_empty() {
        return Err("Please provide a search query.".into());
    }
    let results = bot.acquirer.search(query, SEARCH_LIMIT).await?;
    if results.is_empty() {
        return Err("No results".into());
    }
    let lines = results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}\n{}", i + 1, r.title, r.url))
        .collect::<Vec<_>>()
        .join("\n");
    send_info(ctx, inv.channel, bot.config.embed_color, "📋 Search results", &lines).await
}

async fn show_queue(ctx: &Context, bot: &Bot, inv: Invocation) -> MusicResult<()> {
    let items = bot.orchestrator.queue(inv.guild()?);
    let desc = if items.is_empty() {
        "Queue is empty".to_string()
    } else {
        items
            .iter()
            .enumerate()
            .map(|(i, item)| format!("{}. `{}`", i + 1, item.display_title()))
            .collect::<Vec<_>>()
            .join("\n")
    };
    send_info(ctx, inv.channel, bot.config.embed_color, "📋 Queue", &desc).await
}

async fn remove(ctx: &Context, bot: &Bot, inv: Invocation, args: &str) -> MusicResult<()> {
    let index: usize = args
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or("Provide a queue position: remove <n>")?;
    let item = bot.orchestrator.remove(inv.guild()?, index).await?;
    send_info(
        ctx,
        inv.channel,
        bot.config.embed_color,
        "🗑️ Removed",
        &item.display_title(),
    )
    .await
}

async fn skip(ctx: &Context, bot: &Bot, inv: Invocation) -> MusicResult<()> {
    bot.orchestrator.skip(inv.guild()?).await?;
    send_info(ctx, inv.channel, bot.config.embed_color, "⏭️ Skipped", "Moving on to the next item.").await
}

async fn stop(ctx: &Context, bot: &Bot, inv: Invocation) -> MusicResult<()> {
    match bot.orchestrator.stop(inv.guild()?).await {
        Ok(()) => {}
        Err(PlaybackError::NothingPlaying) => return Err("**Already Stopped!**".into()),
        Err(e) => return Err(e.into()),
    }
    let _ = inv.channel.create_reaction(&ctx.http, inv.message_id, ReactionType::Unicode("✅".into())).await;
    send_info(ctx, inv.channel, bot.config.embed_color, "✅ Success", "Stopped playing video.").await
}

async fn status(ctx: &Context, bot: &Bot, inv: Invocation) -> MusicResult<()> {
    let guild_id = inv.guild()?;
    let status = bot.orchestrator.status(guild_id).await;
    let desc = format!(
        "Joined: {}\nPlaying: {}\nState: {:?}\nQueued: {}",
        status.joined,
        status.playing,
        status.phase,
        bot.orchestrator.queue(guild_id).len()
    );
    send_info(ctx, inv.channel, bot.config.embed_color, "ℹ️ Status", &desc).await
}

async fn list(ctx: &Context, bot: &Bot, inv: Invocation) -> MusicResult<()> {
    let lib = bot.library.read().await;
    if lib.videos().is_empty() {
        return Err("No videos found".into());
    }
    let lines = numbered_names(&lib);
    drop(lib);
    send_info(ctx, inv.channel, bot.config.embed_color, "📋 Videos", &lines).await
}

async fn refresh(ctx: &Context, bot: &Bot, inv: Invocation) -> MusicResult<()> {
    let mut lib = bot.library.write().await;
    let count = lib.refresh().await?;
    let lines = format!("({count} videos found)\n{}", numbered_names(&lib));
    drop(lib);
    send_info(ctx, inv.channel, bot.config.embed_color, "📋 Video list refreshed", &lines).await
}

fn numbered_names(lib: &VideoLibrary) -> String {
    lib.videos()
        .iter()
        .enumerate()
        .map(|(i, v)| format!("{}. `{}`", i + 1, v.name))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn help(ctx: &Context, bot: &Bot, inv: Invocation) -> MusicResult<()> {
    let prefix = &bot.config.prefix;
    let fields: Vec<(String, String, bool)> = [
        ("play <name>", "Play a local video"),
        ("playlink <url>", "Play a video from a URL, YouTube or Twitch"),
        ("ytplay <query>", "Play the first YouTube result"),
        ("ytsearch <query>", "Search YouTube"),
        ("queue", "Show the queue"),
        ("remove <n>", "Remove an item from the queue"),
        ("skip", "Skip to the next item"),
        ("stop", "Stop playback"),
        ("list", "List local videos"),
        ("refresh", "Rescan local videos"),
        ("status", "Show playback status"),
    ]
    .iter()
    .map(|(name, desc)| (format!("{prefix}{name}"), (*desc).to_string(), false))
    .collect();

    let embed = CreateEmbed::new()
        .title("📽 Commands")
        .color(bot.config.embed_color)
        .fields(fields);
    inv.channel.send_message(&ctx.http, CreateMessage::new().embed(embed)).await?;
    Ok(())
}

async fn send_info(
    ctx: &Context,
    channel: ChannelId,
    color: u32,
    title: &str,
    desc: &str,
) -> MusicResult<()> {
    let embed = CreateEmbed::new()
        .title(title)
        .description(desc)
        .color(color);

    let message = CreateMessage::new().embed(embed);
    channel.send_message(&ctx.http, message).await?;
    Ok(())
}

pub fn voice_channel_for_user_id(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    ctx.cache
        .guild(guild_id)
        .and_then(|guild| guild.voice_states.get(&user_id).and_then(|vs| vs.channel_id))
}
