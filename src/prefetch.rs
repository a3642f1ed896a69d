use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PlaybackResult;
use crate::media::{MediaAcquirer, MediaSource, QualityConstraints};
use crate::queue::{PlaybackQueue, QueueItem};

struct InFlight {
    generation: u64,
    task: JoinHandle<()>,
}

/// Downloads the head of a guild's queue in the background while
/// something else is playing. At most one task per guild.
#[derive(Clone)]
pub struct PrefetchCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Arc<PlaybackQueue>,
    acquirer: Arc<dyn MediaAcquirer>,
    quality: QualityConstraints,
    in_flight: DashMap<GuildId, InFlight>,
    generations: AtomicU64,
}

impl PrefetchCoordinator {
    pub fn new(queue: Arc<PlaybackQueue>, acquirer: Arc<dyn MediaAcquirer>, quality: QualityConstraints) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                acquirer,
                quality,
                in_flight: DashMap::new(),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Start a prefetch for the current head if one is useful and none is
    /// running for this guild. Returns whether a task was started.
    pub fn ensure_prefetch(&self, guild_id: GuildId) -> bool {
        let Some(head) = self.inner.queue.peek_front(guild_id) else {
            return false;
        };
        if head.prefetch_settled() {
            return false;
        }
        let url = match &head.source {
            MediaSource::RemoteUrl(url) if self.inner.acquirer.is_downloadable(url) => url.clone(),
            _ => return false,
        };

        match self.inner.in_flight.entry(guild_id) {
            Entry::Occupied(o) if !o.get().task.is_finished() => false,
            _ if !head.begin_prefetch() => false,
            entry => {
                let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(guild = %guild_id, %url, "starting prefetch");
                let task = tokio::spawn(self.clone().run(guild_id, generation, head, url));
                entry.insert(InFlight { generation, task });
                true
            }
        }
    }

    pub fn is_in_flight(&self, guild_id: GuildId) -> bool {
        self.inner
            .in_flight
            .get(&guild_id)
            .is_some_and(|f| !f.task.is_finished())
    }

    /// Drop the guild's marker if its task has already ended.
    pub fn release(&self, guild_id: GuildId) {
        self.inner.in_flight.remove_if(&guild_id, |_, f| f.task.is_finished());
    }

    async fn run(self, guild_id: GuildId, generation: u64, item: Arc<QueueItem>, url: String) {
        match self.fetch(&item, &url).await {
            Ok(Some(path)) => {
                if let Err(path) = item.attach_prefetched(path) {
                    tracing::debug!(guild = %guild_id, path = %path.display(), "prefetch target closed, discarding");
                    remove_quietly(path).await;
                } else {
                    tracing::info!(guild = %guild_id, %url, "prefetch ready");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(guild = %guild_id, %url, error = %e, "prefetch failed, will download on demand");
                item.abandon_prefetch();
            }
        }

        self.inner.in_flight.remove_if(&guild_id, |_, f| f.generation == generation);

        // The head may have moved on while we worked; it never got a chance.
        if let Some(head) = self.inner.queue.peek_front(guild_id) {
            if !Arc::ptr_eq(&head, &item) {
                self.ensure_prefetch(guild_id);
            }
        }
    }

    async fn fetch(&self, item: &QueueItem, url: &str) -> PlaybackResult<Option<PathBuf>> {
        let info = self.inner.acquirer.resolve_info(url).await?;
        if info.is_live {
            tracing::debug!(%url, "live source, not prefetching");
            // Closing keeps later checks from resolving it again.
            item.claim_prefetched();
            return Ok(None);
        }
        if item.prefetch_closed() {
            return Ok(None);
        }
        // Prefetches are never interrupted; a stale result is discarded on attach.
        let token = CancellationToken::new();
        let path = self.inner.acquirer.download(url, self.inner.quality, &token).await?;
        Ok(Some(path))
    }
}

async fn remove_quietly(path: PathBuf) {
    if let Err(e) = tokio::fs::remove_file(&path).await {
        tracing::warn!(path = %path.display(), error = %e, "failed to delete temp file");
    }
}
