use std::path::{Path, PathBuf};

use crate::error::{PlaybackError, PlaybackResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Video {
    /// File stem with spaces replaced by underscores, so it fits in one
    /// command argument.
    pub name: String,
    pub path: PathBuf,
}

/// Videos available on disk for `play <name>`.
#[derive(Debug, Default)]
pub struct VideoLibrary {
    dir: PathBuf,
    videos: Vec<Video>,
}

impl VideoLibrary {
    /// Create the directory if needed and scan it.
    pub async fn open(dir: &Path) -> PlaybackResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let mut lib = Self { dir: dir.to_path_buf(), videos: Vec::new() };
        lib.refresh().await?;
        Ok(lib)
    }

    pub async fn refresh(&mut self) -> PlaybackResult<usize> {
        let mut videos = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            let Some(stem) = path.file_stem() else { continue };
            videos.push(Video { name: stem.to_string_lossy().replace(' ', "_"), path });
        }
        videos.sort_by(|a, b| a.name.cmp(&b.name));
        self.videos = videos;
        Ok(self.videos.len())
    }

    pub fn find(&self, name: &str) -> PlaybackResult<&Video> {
        self.videos
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| PlaybackError::VideoNotFound(name.to_string()))
    }

    pub fn videos(&self) -> &[Video] {
        &self.videos
    }
}
