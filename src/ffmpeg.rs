use async_trait::async_trait;
use serde_json::Value;
use serenity::model::id::GuildId;
use songbird::events::{Event, EventContext, EventHandler, TrackEvent};
use songbird::input::{ChildContainer, Input};
use songbird::tracks::Track;
use songbird::Songbird;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{PlaybackError, PlaybackResult};
use crate::media::{
    MediaProbe, StreamOptions, TransportError, TransportPipeline, TransportSession, TransportSource, VideoParams,
};

/// Reads stream parameters of local files through `ffprobe`.
pub struct FfProbe;

#[async_trait]
impl MediaProbe for FfProbe {
    async fn probe(&self, path: &Path) -> PlaybackResult<VideoParams> {
        let out = tokio::process::Command::new("ffprobe")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-show_streams")
            .arg("-print_format")
            .arg("json")
            .arg(path)
            .output()
            .await?;
        if !out.status.success() {
            return Err(PlaybackError::AcquisitionFailed(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        let v: Value = serde_json::from_slice(&out.stdout)
            .map_err(|e| PlaybackError::AcquisitionFailed(format!("unreadable ffprobe output: {e}")))?;
        parse_video_params(&v).ok_or_else(|| PlaybackError::AcquisitionFailed("Unable to get resolution".into()))
    }
}

/// First video stream's size, bitrate (kbps) and frame rate. Bitrate may be
/// reported as "N/A", in which case it is left unset.
pub fn parse_video_params(v: &Value) -> Option<VideoParams> {
    let stream = v
        .get("streams")?
        .as_array()?
        .iter()
        .find(|s| s.get("codec_type").and_then(Value::as_str) == Some("video"))?;

    let width = stream.get("width")?.as_u64()? as u32;
    let height = stream.get("height")?.as_u64()? as u32;
    let bitrate_kbps = stream
        .get("bit_rate")
        .and_then(Value::as_str)
        .and_then(|b| b.parse::<u64>().ok())
        .map(|b| (b / 1000) as u32);
    let fps = stream
        .get("avg_frame_rate")
        .and_then(Value::as_str)
        .and_then(parse_rate);

    Some(VideoParams { width, height, bitrate_kbps, fps })
}

fn parse_rate(rate: &str) -> Option<u32> {
    let (num, den) = rate.split_once('/').unwrap_or((rate, "1"));
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 || num == 0.0 {
        return None;
    }
    Some((num / den).round() as u32)
}

pub fn ffmpeg_args(source: &TransportSource, options: &StreamOptions) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    if let TransportSource::Url(_) = source {
        for a in ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"] {
            args.push(a.into());
        }
    }
    args.push("-i".into());
    args.push(source.as_input());
    args.extend(
        ["-vn", "-c:a", "pcm_s16le", "-ar", "48000", "-ac", "2", "-af"]
            .into_iter()
            .map(String::from),
    );
    args.push(format!("volume={:.2}", options.volume));
    args.extend(["-f", "wav", "-"].into_iter().map(String::from));
    args
}

type DoneSender = Arc<Mutex<Option<oneshot::Sender<Result<(), TransportError>>>>>;

struct SessionEnd {
    done: DoneSender,
    cancel: CancellationToken,
    errored: bool,
}

#[async_trait]
impl EventHandler for SessionEnd {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let result = if self.errored {
            let reason = match ctx {
                EventContext::Track(tracks) => tracks
                    .first()
                    .map(|(state, _)| format!("{:?}", state.playing))
                    .unwrap_or_else(|| "track error".into()),
                _ => "track error".into(),
            };
            Err(TransportError { reason, cancelled: self.cancel.is_cancelled() })
        } else {
            Ok(())
        };

        let sender = self.done.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = sender {
            let _ = tx.send(result);
        }
        None
    }
}

/// Streams through an ffmpeg child process into the guild's songbird call.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl TransportPipeline for SongbirdTransport {
    async fn start(
        &self,
        guild_id: GuildId,
        source: TransportSource,
        options: &StreamOptions,
        cancel: CancellationToken,
    ) -> PlaybackResult<TransportSession> {
        let call = self
            .manager
            .get(guild_id)
            .ok_or_else(|| PlaybackError::TransportFailed("not connected to a voice channel".into()))?;

        tracing::debug!(
            guild = %guild_id,
            width = options.width,
            height = options.height,
            fps = options.fps,
            bitrate_kbps = options.bitrate_kbps,
            "spawning ffmpeg"
        );
        let child = std::process::Command::new("ffmpeg")
            .args(ffmpeg_args(&source, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PlaybackError::TransportFailed(format!("failed to spawn ffmpeg: {e}")))?;

        let input: Input = ChildContainer::from(child).into();
        let handle = call.lock().await.play_only(Track::from(input));

        let (tx, session) = TransportSession::channel();
        let done: DoneSender = Arc::new(Mutex::new(Some(tx)));
        for (event, errored) in [(TrackEvent::End, false), (TrackEvent::Error, true)] {
            let handler = SessionEnd { done: done.clone(), cancel: cancel.clone(), errored };
            if let Err(e) = handle.add_event(Event::Track(event), handler) {
                return Err(PlaybackError::TransportFailed(format!("failed to watch track: {e:?}")));
            }
        }

        // Stopping the track raises End, which completes the session.
        tokio::spawn(async move {
            cancel.cancelled().await;
            let _ = handle.stop();
        });

        Ok(session)
    }
}
