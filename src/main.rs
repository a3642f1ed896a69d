use serenity::{
    async_trait,
    model::{channel::Message, gateway::Ready},
    prelude::*,
};
use songbird::{SerenityInit, Songbird};
use dotenvy::dotenv;
use std::env;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

use voxcast::config::load_config;
use voxcast::ffmpeg::{FfProbe, SongbirdTransport};
use voxcast::library::VideoLibrary;
use voxcast::music::{handle_command, voice_channel_for_user_id, Bot, BotStore, Invocation};
use voxcast::voice::{idle_activity, DiscordNotifier, DiscordVoice};
use voxcast::ytdlp::{ensure_media_tools, YtDlp};
use voxcast::{Collaborators, PlaybackOrchestrator};

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        // move any data we need out of the potentially non-Send `Message` before awaiting
        let author_is_bot = msg.author.bot;
        let channel_id = msg.channel_id;
        let message_id = msg.id;
        let author_id = msg.author.id;
        let guild_id = msg.guild_id;
        let content = msg.content.clone();

        drop(msg);

        if author_is_bot || author_id == ctx.cache.current_user().id {
            return;
        }

        let Some(bot) = ctx.data.read().await.get::<BotStore>().cloned() else {
            return;
        };

        if !bot.config.accepts_channel(channel_id.get()) {
            return;
        }

        let Some(command) = content.trim().strip_prefix(bot.config.prefix.as_str()) else {
            return;
        };

        let mut parts = command.trim().split_whitespace();
        let cmd = parts.next().unwrap_or("").to_ascii_lowercase();
        let args = parts.collect::<Vec<_>>().join(" ");
        if cmd.is_empty() {
            return;
        }

        let user_voice = guild_id.and_then(|gid| voice_channel_for_user_id(&ctx, gid, author_id));
        let inv = Invocation { channel: channel_id, message_id, author_id, guild_id, user_voice };

        if let Err(why) = handle_command(&ctx, &bot, inv, &cmd, &args).await {
            tracing::error!(error = ?why, "error handling command");
        }
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, guilds = ctx.cache.guild_count(), "connected");
        ctx.set_activity(Some(idle_activity()));
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let token = env::var("DISCORD_TOKEN").expect("DISCORD_TOKEN not set");
    let config = load_config().await.expect("Failed to load config.jsonc");

    let ytdlp_path = ensure_media_tools(&config.bin_dir)
        .await
        .expect("Failed to prepare media tools (yt-dlp)");
    let ytdlp = Arc::new(YtDlp::new(ytdlp_path));
    ytdlp.self_update().await;

    let library = VideoLibrary::open(&config.videos_dir)
        .await
        .expect("Failed to open videos directory");
    tracing::info!(
        videos = ?library.videos().iter().map(|v| v.name.as_str()).collect::<Vec<_>>(),
        "available videos"
    );

    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES;

    let songbird = Songbird::serenity();

    let mut client = Client::builder(&token, intents)
        .register_songbird_with(songbird.clone())
        .event_handler(Handler)
        .await
        .expect("Err creating client");

    let orchestrator = PlaybackOrchestrator::new(
        Collaborators {
            gateway: Arc::new(DiscordVoice::new(songbird.clone(), client.shard_manager.clone(), token.clone())),
            notifier: Arc::new(DiscordNotifier::new(client.http.clone(), config.embed_color)),
            acquirer: ytdlp.clone(),
            transport: Arc::new(SongbirdTransport::new(songbird)),
            probe: Arc::new(FfProbe),
        },
        config.playback_settings(),
    );

    {
        let mut data = client.data.write().await;
        data.insert::<BotStore>(Arc::new(Bot {
            orchestrator,
            library: RwLock::new(library),
            acquirer: ytdlp,
            config,
        }));
    }

    if let Err(why) = client.start().await {
        tracing::error!(error = ?why, "client error");
    }
}
