use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{PlaybackError, PlaybackResult};
use crate::media::{MediaAcquirer, MediaInfo, QualityConstraints, SearchResult};

type ToolResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const YTDLP_BIN: &str = "yt-dlp";
const YTDLP_URL: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp";

/// Make sure `yt-dlp` is present in `bin_dir` and that directory is on PATH.
/// Also checks that ffmpeg can be run.
pub async fn ensure_media_tools(bin_dir: &Path) -> ToolResult<PathBuf> {
    let ytdlp_path = bin_dir.join(YTDLP_BIN);

    if fs::metadata(&ytdlp_path).await.is_err() {
        tracing::info!(path = %ytdlp_path.display(), "yt-dlp not found, downloading");
        fs::create_dir_all(bin_dir).await?;
        let resp = Client::new().get(YTDLP_URL).send().await?.error_for_status()?;
        let content = resp.bytes().await?;
        fs::write(&ytdlp_path, &content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&ytdlp_path).await?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&ytdlp_path, perms).await?;
        }
        tracing::info!("yt-dlp has been downloaded");
    }

    match Command::new("ffmpeg").arg("-version").output().await {
        Ok(o) if o.status.success() => tracing::debug!("ffmpeg found"),
        Ok(o) => tracing::warn!(stderr = %String::from_utf8_lossy(&o.stderr), "ffmpeg exists but failed to run"),
        Err(_) => tracing::warn!("ffmpeg not found on PATH, playback will fail"),
    }

    prepend_path(bin_dir)?;
    Ok(ytdlp_path)
}

fn prepend_path(bin: &Path) -> ToolResult<()> {
    let mut paths: Vec<PathBuf> = env::var_os("PATH")
        .map(|p| env::split_paths(&p).collect())
        .unwrap_or_default();

    if !paths.iter().any(|p| p == bin) {
        paths.insert(0, bin.to_path_buf());
        let new_path = env::join_paths(paths)?;
        unsafe {
            env::set_var("PATH", &new_path);
        }
    }
    Ok(())
}

fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.trim_start_matches("www.").trim_start_matches("m.").to_string())
}

pub fn is_youtube(url: &str) -> bool {
    matches!(host_of(url).as_deref(), Some("youtube.com" | "youtu.be" | "music.youtube.com"))
}

/// Twitch channel (live) and VOD pages.
pub fn is_twitch(url: &str) -> bool {
    matches!(host_of(url).as_deref(), Some("twitch.tv"))
}

/// Display name for a Twitch link: `twitch.tv/<last path segment>`.
pub fn twitch_title(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let id = parsed.path_segments()?.rfind(|s| !s.is_empty())?;
    Some(format!("twitch.tv/{id}"))
}

pub struct YtDlp {
    bin: PathBuf,
    temp_dir: PathBuf,
}

impl YtDlp {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin, temp_dir: env::temp_dir() }
    }

    /// Run `yt-dlp --update`. Failures are logged, never fatal.
    pub async fn self_update(&self) {
        match Command::new(&self.bin).arg("--update").output().await {
            Ok(o) if o.status.success() => {
                let stdout = String::from_utf8_lossy(&o.stdout);
                if stdout.contains("Updated yt-dlp to") {
                    tracing::info!(output = %stdout.trim(), "yt-dlp updated");
                }
            }
            Ok(o) => tracing::warn!(
                code = ?o.status.code(),
                stderr = %String::from_utf8_lossy(&o.stderr).trim(),
                "yt-dlp update check failed"
            ),
            Err(e) => tracing::error!(error = %e, "could not run yt-dlp update"),
        }
    }

    async fn json(&self, args: &[String]) -> PlaybackResult<Value> {
        let out = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !out.status.success() {
            return Err(PlaybackError::AcquisitionFailed(format!(
                "yt-dlp failed with exit code {:?}: {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        serde_json::from_slice(&out.stdout)
            .map_err(|e| PlaybackError::AcquisitionFailed(format!("unreadable yt-dlp output: {e}")))
    }
}

pub fn temp_file_path(dir: &Path) -> PathBuf {
    let id = uuid::Uuid::new_v4().simple().to_string();
    dir.join(format!("ytdlp_temp_{}.mp4", &id[..12]))
}

pub fn download_args(url: &str, quality: QualityConstraints, output: &Path) -> Vec<String> {
    vec![
        url.to_string(),
        "--format".into(),
        quality.format_selector(),
        "--no-playlist".into(),
        "--output".into(),
        output.to_string_lossy().into_owned(),
        "--quiet".into(),
        "--no-warnings".into(),
    ]
}

pub fn parse_info(v: &Value) -> MediaInfo {
    let is_live = v.get("is_live").and_then(Value::as_bool).unwrap_or(false)
        || v.get("live_status").and_then(Value::as_str) == Some("is_live");
    MediaInfo {
        title: v.get("title").and_then(Value::as_str).map(str::to_string),
        is_live,
    }
}

pub fn parse_search(v: &Value) -> Vec<SearchResult> {
    let Some(entries) = v.get("entries").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|e| {
            let title = e.get("title").and_then(Value::as_str)?.to_string();
            let url = match e.get("url").and_then(Value::as_str) {
                Some(u) if u.starts_with("http") => u.to_string(),
                _ => format!("https://www.youtube.com/watch?v={}", e.get("id").and_then(Value::as_str)?),
            };
            Some(SearchResult { title, url })
        })
        .collect()
}

async fn remove_partial(path: &Path) {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    for p in [path.to_path_buf(), PathBuf::from(part)] {
        if fs::metadata(&p).await.is_ok() {
            if let Err(e) = fs::remove_file(&p).await {
                tracing::warn!(path = %p.display(), error = %e, "failed to clean up partial download");
            }
        }
    }
}

#[async_trait]
impl MediaAcquirer for YtDlp {
    fn is_downloadable(&self, url: &str) -> bool {
        is_youtube(url)
    }

    fn needs_stream_url(&self, url: &str) -> bool {
        is_twitch(url)
    }

    async fn resolve_info(&self, url: &str) -> PlaybackResult<MediaInfo> {
        let v = self
            .json(&[url.to_string(), "-J".into(), "--no-playlist".into(), "--no-warnings".into()])
            .await?;
        Ok(parse_info(&v))
    }

    async fn resolve_stream_url(&self, url: &str) -> PlaybackResult<String> {
        let out = Command::new(&self.bin)
            .args([url, "-g", "-f", "best", "--no-playlist", "--no-warnings"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        match stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
            Some(line) if out.status.success() => Ok(line.to_string()),
            _ => Err(PlaybackError::AcquisitionFailed(format!(
                "no stream URL for {url}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
        }
    }

    async fn download(
        &self,
        url: &str,
        quality: QualityConstraints,
        cancel: &CancellationToken,
    ) -> PlaybackResult<PathBuf> {
        let path = temp_file_path(&self.temp_dir);
        let child = Command::new(&self.bin)
            .args(download_args(url, quality, &path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            out = child.wait_with_output() => out,
            _ = cancel.cancelled() => {
                // Dropping the wait future kills the child.
                remove_partial(&path).await;
                return Err(PlaybackError::AcquisitionFailed("download cancelled".into()));
            }
        };

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                remove_partial(&path).await;
                return Err(e.into());
            }
        };
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            remove_partial(&path).await;
            return Err(PlaybackError::AcquisitionFailed(format!(
                "yt-dlp failed to download to temp file. Exit code: {:?}. Stderr: {stderr}",
                output.status.code()
            )));
        }
        if fs::metadata(&path).await.is_err() {
            return Err(PlaybackError::AcquisitionFailed(format!(
                "yt-dlp exited successfully but {} was not created. Stderr: {stderr}",
                path.display()
            )));
        }
        Ok(path)
    }

    async fn search(&self, query: &str, limit: usize) -> PlaybackResult<Vec<SearchResult>> {
        let v = self
            .json(&[
                format!("ytsearch{limit}:{query}"),
                "-J".into(),
                "--flat-playlist".into(),
                "--no-warnings".into(),
            ])
            .await?;
        Ok(parse_search(&v))
    }
}
