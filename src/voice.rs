use async_trait::async_trait;
use serenity::builder::{CreateEmbed, CreateMessage};
use serenity::gateway::{ActivityData, ShardManager};
use serenity::http::Http;
use serenity::model::channel::ReactionType;
use serenity::model::id::{ChannelId, GuildId};
use songbird::Songbird;
use std::sync::Arc;

use crate::error::{PlaybackError, PlaybackResult};
use crate::media::{PlaybackNotifier, Requester, VoiceGateway};

const DISCORD_API: &str = "https://discord.com/api/v10";

/// Presence shown while nothing is playing.
pub fn idle_activity() -> ActivityData {
    ActivityData::custom("📽 Watching something!")
}

/// Voice membership through songbird, voice channel status through the
/// REST endpoint serenity does not wrap. Presence is per shard, so it
/// reflects whichever guild changed last.
pub struct DiscordVoice {
    manager: Arc<Songbird>,
    shards: Arc<ShardManager>,
    client: reqwest::Client,
    token: String,
}

impl DiscordVoice {
    pub fn new(manager: Arc<Songbird>, shards: Arc<ShardManager>, token: String) -> Self {
        Self { manager, shards, client: reqwest::Client::new(), token }
    }
}

#[async_trait]
impl VoiceGateway for DiscordVoice {
    async fn join_voice(&self, guild_id: GuildId, channel_id: ChannelId) -> PlaybackResult<()> {
        self.manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| PlaybackError::JoinFailed(format!("{e:?}")))?;
        tracing::info!(guild = %guild_id, channel = %channel_id, "joined voice");
        Ok(())
    }

    async fn leave_voice(&self, guild_id: GuildId) -> PlaybackResult<()> {
        if self.manager.get(guild_id).is_none() {
            return Ok(());
        }
        self.manager
            .remove(guild_id)
            .await
            .map_err(|e| PlaybackError::Gateway(format!("{e:?}")))
    }

    async fn stop_active_stream(&self, guild_id: GuildId) -> PlaybackResult<()> {
        if let Some(call) = self.manager.get(guild_id) {
            call.lock().await.stop();
        }
        Ok(())
    }

    async fn set_voice_status(&self, channel_id: ChannelId, text: Option<&str>) -> PlaybackResult<()> {
        let url = format!("{DISCORD_API}/channels/{}/voice-status", channel_id.get());
        self.client
            .put(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(&serde_json::json!({ "status": text.unwrap_or("") }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PlaybackError::Gateway(e.to_string()))?;
        Ok(())
    }

    async fn set_presence(&self, watching: Option<&str>) -> PlaybackResult<()> {
        let activity = match watching {
            Some(title) => ActivityData::watching(title),
            None => idle_activity(),
        };
        for runner in self.shards.runners.lock().await.values() {
            runner.runner_tx.set_activity(Some(activity.clone()));
        }
        Ok(())
    }
}

/// Replies in the requester's command channel, embed style.
pub struct DiscordNotifier {
    http: Arc<Http>,
    color: u32,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>, color: u32) -> Self {
        Self { http, color }
    }

    async fn react(&self, requester: &Requester, emoji: &str) {
        if let Some(message_id) = requester.message_id {
            let reaction = ReactionType::Unicode(emoji.to_string());
            if let Err(e) = requester.command_channel.create_reaction(&self.http, message_id, reaction).await {
                tracing::warn!(error = %e, "failed to react");
            }
        }
    }

    async fn send(&self, channel: ChannelId, title: &str, desc: &str) {
        let embed = CreateEmbed::new().title(title).description(desc).color(self.color);
        if let Err(e) = channel.send_message(&self.http, CreateMessage::new().embed(embed)).await {
            tracing::warn!(channel = %channel, error = %e, "failed to send message");
        }
    }
}

#[async_trait]
impl PlaybackNotifier for DiscordNotifier {
    async fn acquiring(&self, requester: &Requester, title: &str) {
        self.send(requester.command_channel, "📥 Preparing", title).await;
    }

    async fn now_playing(&self, requester: &Requester, title: &str) {
        self.react(requester, "▶️").await;
        self.send(requester.command_channel, "📽 Now playing", title).await;
    }

    async fn playback_ended(&self, requester: &Requester) {
        self.send(requester.command_channel, "⏹️ Finished", "The video has ended.").await;
    }

    async fn playback_failed(&self, requester: &Requester, error: &PlaybackError) {
        self.react(requester, "❌").await;
        self.send(requester.command_channel, "❌ Error", &error.to_string()).await;
    }
}
