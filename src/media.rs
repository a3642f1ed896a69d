//! Types and collaborator traits shared by the playback core.
//!
//! Everything the core needs from the outside world (voice connection,
//! chat output, media download, transcoding) goes through the traits in
//! this module. Production implementations live in `voice`, `ytdlp` and
//! `ffmpeg`.

use async_trait::async_trait;
use serde::Deserialize;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{PlaybackError, PlaybackResult};

/// Where a request came from. Used to address replies and reactions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Requester {
    pub user_id: UserId,
    pub command_channel: ChannelId,
    pub message_id: Option<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaSource {
    LocalPath(PathBuf),
    RemoteUrl(String),
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::LocalPath(p) => write!(f, "{}", p.display()),
            MediaSource::RemoteUrl(u) => f.write_str(u),
        }
    }
}

/// What the transport actually reads from once acquisition is done.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportSource {
    File(PathBuf),
    Url(String),
}

impl TransportSource {
    pub fn as_input(&self) -> String {
        match self {
            TransportSource::File(p) => p.to_string_lossy().into_owned(),
            TransportSource::Url(u) => u.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct StreamOptions {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_bitrate")]
    pub bitrate_kbps: u32,
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate_kbps: u32,
    #[serde(default = "default_volume")]
    pub volume: f32,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    30
}

fn default_bitrate() -> u32 {
    1000
}

fn default_max_bitrate() -> u32 {
    2500
}

fn default_volume() -> f32 {
    0.5
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            bitrate_kbps: default_bitrate(),
            max_bitrate_kbps: default_max_bitrate(),
            volume: default_volume(),
        }
    }
}

impl StreamOptions {
    /// Overlay probed parameters of a local file onto the configured options.
    pub fn with_probed(&self, params: &VideoParams) -> StreamOptions {
        let mut opts = self.clone();
        opts.width = params.width;
        opts.height = params.height;
        if let Some(kbps) = params.bitrate_kbps {
            opts.bitrate_kbps = kbps;
            opts.max_bitrate_kbps = kbps;
        }
        if let Some(fps) = params.fps {
            opts.fps = fps;
        }
        opts
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QualityConstraints {
    pub max_height: u32,
}

impl QualityConstraints {
    /// yt-dlp format selector preferring mp4/m4a at or below `max_height`.
    pub fn format_selector(&self) -> String {
        let h = self.max_height;
        format!(
            "bestvideo[height<={h}][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<={h}]+bestaudio/best[height<={h}]/best"
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub is_live: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: Option<u32>,
    pub fps: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportError {
    pub reason: String,
    /// Raised because our own cancellation token fired.
    pub cancelled: bool,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Handle on a running transport. Resolves once the pipeline itself has
/// terminated, not merely when cancellation was requested.
pub struct TransportSession {
    done: oneshot::Receiver<Result<(), TransportError>>,
}

impl TransportSession {
    pub fn channel() -> (oneshot::Sender<Result<(), TransportError>>, TransportSession) {
        let (tx, rx) = oneshot::channel();
        (tx, TransportSession { done: rx })
    }

    pub async fn finished(self) -> Result<(), TransportError> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(TransportError {
                reason: "transport dropped without reporting".into(),
                cancelled: false,
            }),
        }
    }
}

#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn join_voice(&self, guild_id: GuildId, channel_id: ChannelId) -> PlaybackResult<()>;
    async fn leave_voice(&self, guild_id: GuildId) -> PlaybackResult<()>;
    async fn stop_active_stream(&self, guild_id: GuildId) -> PlaybackResult<()>;
    /// `None` clears the status text.
    async fn set_voice_status(&self, channel_id: ChannelId, text: Option<&str>) -> PlaybackResult<()>;
    /// Show what the bot is watching; `None` puts back the idle presence.
    async fn set_presence(&self, watching: Option<&str>) -> PlaybackResult<()>;
}

#[async_trait]
pub trait PlaybackNotifier: Send + Sync {
    async fn acquiring(&self, requester: &Requester, title: &str);
    async fn now_playing(&self, requester: &Requester, title: &str);
    async fn playback_ended(&self, requester: &Requester);
    async fn playback_failed(&self, requester: &Requester, error: &PlaybackError);
}

#[async_trait]
pub trait MediaAcquirer: Send + Sync {
    /// Whether `url` is something we know how to resolve and download.
    /// Anything else is handed to the transport as-is.
    fn is_downloadable(&self, url: &str) -> bool;
    /// Page URLs that are never downloaded but must be turned into a
    /// direct stream URL before the transport can read them.
    fn needs_stream_url(&self, url: &str) -> bool;
    async fn resolve_info(&self, url: &str) -> PlaybackResult<MediaInfo>;
    /// Direct media URL for a live or page URL.
    async fn resolve_stream_url(&self, url: &str) -> PlaybackResult<String>;
    async fn download(
        &self,
        url: &str,
        quality: QualityConstraints,
        cancel: &CancellationToken,
    ) -> PlaybackResult<PathBuf>;
    async fn search(&self, query: &str, limit: usize) -> PlaybackResult<Vec<SearchResult>>;
}

#[async_trait]
pub trait TransportPipeline: Send + Sync {
    async fn start(
        &self,
        guild_id: GuildId,
        source: TransportSource,
        options: &StreamOptions,
        cancel: CancellationToken,
    ) -> PlaybackResult<TransportSession>;
}

#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> PlaybackResult<VideoParams>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_selector_caps_height() {
        let q = QualityConstraints { max_height: 480 };
        let f = q.format_selector();
        assert!(f.starts_with("bestvideo[height<=480][ext=mp4]"));
        assert!(f.ends_with("/best"));
    }

    #[test]
    fn probed_params_override_configured_options() {
        let base = StreamOptions::default();
        let probed = base.with_probed(&VideoParams { width: 1920, height: 1080, bitrate_kbps: Some(4000), fps: None });
        assert_eq!(probed.height, 1080);
        assert_eq!(probed.bitrate_kbps, 4000);
        assert_eq!(probed.max_bitrate_kbps, 4000);
        assert_eq!(probed.fps, base.fps);
    }

    #[tokio::test]
    async fn dropped_sender_reports_failure() {
        let (tx, session) = TransportSession::channel();
        drop(tx);
        let err = session.finished().await.unwrap_err();
        assert!(!err.cancelled);
    }
}
