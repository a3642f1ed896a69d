use serde::Deserialize;
use std::{io::ErrorKind, path::PathBuf};

use crate::media::StreamOptions;
use crate::orchestrator::PlaybackSettings;

pub const CONFIG_PATH: &str = "config.jsonc";

const DEFAULT_CONFIG: &str = r#"// Bot config (JSONC: supports comments)
{
  // Command prefix
  "prefix": "$",
  // Channels that accept commands; empty means any channel
  "command_channels": [],
  // Local library for `play <name>`
  "videos_dir": "./videos",
  // Where yt-dlp gets installed
  "bin_dir": ".bin",
  // Probe local files and stream them with their own parameters
  "respect_video_params": false,
  "embed_color": 5793266,
  "stream": {
    "width": 1280,
    "height": 720,
    "fps": 30,
    "bitrate_kbps": 1000,
    "max_bitrate_kbps": 2500,
    "volume": 0.5
  }
}
"#;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub command_channels: Vec<u64>,
    #[serde(default = "default_videos_dir")]
    pub videos_dir: PathBuf,
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,
    #[serde(default)]
    pub respect_video_params: bool,
    #[serde(default = "default_embed_color")]
    pub embed_color: u32,
    #[serde(default)]
    pub stream: StreamOptions,
}

fn default_prefix() -> String {
    "$".into()
}

fn default_videos_dir() -> PathBuf {
    PathBuf::from("./videos")
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from(".bin")
}

fn default_embed_color() -> u32 {
    0x5865F2
}

impl AppConfig {
    pub fn accepts_channel(&self, channel_id: u64) -> bool {
        self.command_channels.is_empty() || self.command_channels.contains(&channel_id)
    }

    pub fn playback_settings(&self) -> PlaybackSettings {
        PlaybackSettings { stream: self.stream.clone(), respect_video_params: self.respect_video_params }
    }
}

pub fn parse_config(contents: &str) -> Result<AppConfig, json5::Error> {
    json5::from_str(contents)
}

pub async fn ensure_default_config() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match tokio::fs::metadata(CONFIG_PATH).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tokio::fs::write(CONFIG_PATH, DEFAULT_CONFIG).await?;
            tracing::info!(path = CONFIG_PATH, "wrote default config");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

pub async fn load_config() -> Result<AppConfig, Box<dyn std::error::Error + Send + Sync>> {
    let _ = ensure_default_config().await;

    let contents = tokio::fs::read_to_string(CONFIG_PATH).await?;
    let cfg = parse_config(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let cfg = parse_config(DEFAULT_CONFIG).unwrap();
        assert_eq!(cfg.prefix, "$");
        assert_eq!(cfg.stream.height, 720);
        assert!(cfg.accepts_channel(42));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg = parse_config(r#"{ command_channels: [10], stream: { height: 480 } }"#).unwrap();
        assert!(cfg.accepts_channel(10));
        assert!(!cfg.accepts_channel(11));
        assert_eq!(cfg.stream.height, 480);
        assert_eq!(cfg.stream.width, StreamOptions::default().width);
        assert_eq!(cfg.playback_settings().quality().max_height, 480);
    }
}
