//! Per-guild playback state machine.
//!
//! A guild moves `Idle -> Acquiring -> Joining -> Playing` and leaves
//! `Playing` through `Finishing`, `Stopping` or `Failing`, always via the
//! same teardown. Each active guild has exactly one drive task running
//! [`PlaybackOrchestrator::drive`]; command handlers only touch state
//! under the guild's slot lock, so the control flow for a guild is never
//! entered twice at once.

use serenity::model::id::{ChannelId, GuildId};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancellationRegistry;
use crate::error::{PlaybackError, PlaybackResult};
use crate::guild_state::{ActiveChannel, GuildStateRegistry, GuildStatus, PlaybackPhase, StatusGuard};
use crate::media::{
    MediaAcquirer, MediaProbe, MediaSource, PlaybackNotifier, QualityConstraints, Requester, StreamOptions,
    TransportPipeline, TransportSource, VoiceGateway,
};
use crate::prefetch::PrefetchCoordinator;
use crate::queue::{PlaybackQueue, QueueItem};

pub struct Collaborators {
    pub gateway: Arc<dyn VoiceGateway>,
    pub notifier: Arc<dyn PlaybackNotifier>,
    pub acquirer: Arc<dyn MediaAcquirer>,
    pub transport: Arc<dyn TransportPipeline>,
    pub probe: Arc<dyn MediaProbe>,
}

#[derive(Clone, Debug, Default)]
pub struct PlaybackSettings {
    pub stream: StreamOptions,
    /// Probe local files and stream them with their own parameters.
    pub respect_video_params: bool,
}

impl PlaybackSettings {
    pub fn quality(&self) -> QualityConstraints {
        QualityConstraints { max_height: self.stream.height }
    }
}

#[derive(Clone, Debug)]
pub struct PlayRequest {
    pub guild_id: Option<GuildId>,
    pub requester: Requester,
    pub source: MediaSource,
    pub title: Option<String>,
    /// The requester's voice channel at the time of the request.
    pub voice_channel_id: Option<ChannelId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Started,
    Queued { position: usize },
}

enum Outcome {
    Finished,
    Cancelled,
    Failed(PlaybackError),
}

struct Attempt {
    outcome: Outcome,
    /// File created by download or prefetch for this attempt.
    temp_file: Option<PathBuf>,
}

#[derive(Clone)]
pub struct PlaybackOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    states: GuildStateRegistry,
    queue: Arc<PlaybackQueue>,
    cancels: CancellationRegistry,
    prefetch: PrefetchCoordinator,
    io: Collaborators,
    settings: PlaybackSettings,
}

fn cancelled() -> PlaybackError {
    PlaybackError::AcquisitionFailed("cancelled".into())
}

impl PlaybackOrchestrator {
    pub fn new(io: Collaborators, settings: PlaybackSettings) -> Self {
        let queue = Arc::new(PlaybackQueue::new());
        let prefetch = PrefetchCoordinator::new(queue.clone(), io.acquirer.clone(), settings.quality());
        Self {
            inner: Arc::new(Inner {
                states: GuildStateRegistry::new(),
                queue,
                cancels: CancellationRegistry::new(),
                prefetch,
                io,
                settings,
            }),
        }
    }

    /// Start the request right away if the guild is idle, otherwise queue it.
    pub async fn play(&self, request: PlayRequest) -> PlaybackResult<Admission> {
        let guild_id = request.guild_id.ok_or(PlaybackError::UnresolvableGuild)?;
        let voice_channel_id = request.voice_channel_id.ok_or(PlaybackError::MissingVoiceChannel)?;
        let item = Arc::new(QueueItem::new(request.requester, request.source, request.title, voice_channel_id));

        let slot = self.inner.states.slot(guild_id);
        let status = slot.lock().await;

        if !status.phase.is_idle() {
            let position = self.inner.queue.push(guild_id, item.clone());
            drop(status);
            tracing::info!(guild = %guild_id, title = %item.display_title(), position, "queued");
            if position == 1 {
                self.inner.prefetch.ensure_prefetch(guild_id);
            }
            return Ok(Admission::Queued { position });
        }

        tracing::info!(guild = %guild_id, title = %item.display_title(), "starting playback");
        self.launch(status, guild_id, item);
        Ok(Admission::Started)
    }

    /// Leave `Idle` and hand `item` to a new drive task. The token is
    /// installed before the lock is released.
    fn launch(&self, mut status: StatusGuard<'_>, guild_id: GuildId, item: Arc<QueueItem>) {
        status.manual_stop = false;
        status.halt_queue = false;
        status.phase = PlaybackPhase::Acquiring;
        let token = self.inner.cancels.start_new(guild_id);
        drop(status);
        tokio::spawn(self.clone().drive(guild_id, item, token));
    }

    /// Stop playback and leave the queue as it is.
    pub async fn stop(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.interrupt(guild_id, true).await
    }

    /// Stop the current item and move on to the next one, if any. On an
    /// idle guild with a stopped queue this resumes the queue.
    pub async fn skip(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.interrupt(guild_id, false).await
    }

    async fn interrupt(&self, guild_id: GuildId, halt_queue: bool) -> PlaybackResult<()> {
        let slot = self.inner.states.slot(guild_id);
        let mut status = slot.lock().await;
        if status.phase.is_idle() {
            if halt_queue {
                return Err(PlaybackError::NothingPlaying);
            }
            let next = self.inner.queue.pop_front(guild_id).ok_or(PlaybackError::NothingPlaying)?;
            tracing::info!(guild = %guild_id, title = %next.display_title(), "resuming queue");
            self.launch(status, guild_id, next);
            return Ok(());
        }
        status.manual_stop = true;
        status.halt_queue |= halt_queue;
        if matches!(status.phase, PlaybackPhase::Acquiring | PlaybackPhase::Joining | PlaybackPhase::Playing) {
            status.phase = PlaybackPhase::Stopping;
        }
        // Cancel under the lock so the drive task sees flag and token together.
        self.inner.cancels.cancel(guild_id);
        tracing::info!(guild = %guild_id, halt_queue, "playback interrupted");
        Ok(())
    }

    /// Remove a queued item by 1-based position.
    pub async fn remove(&self, guild_id: GuildId, index: usize) -> PlaybackResult<Arc<QueueItem>> {
        let slot = self.inner.states.slot(guild_id);
        let status = slot.lock().await;
        let item = self.inner.queue.remove_at(guild_id, index)?;
        let busy = !status.phase.is_idle();
        drop(status);

        if let Some(path) = item.claim_prefetched() {
            remove_temp_file(path).await;
        }
        if busy && index == 1 {
            self.inner.prefetch.ensure_prefetch(guild_id);
        }
        Ok(item)
    }

    pub fn queue(&self, guild_id: GuildId) -> Vec<Arc<QueueItem>> {
        self.inner.queue.list(guild_id)
    }

    pub async fn status(&self, guild_id: GuildId) -> GuildStatus {
        self.inner.states.get(guild_id).await
    }

    pub fn subscribe(&self, guild_id: GuildId) -> watch::Receiver<PlaybackPhase> {
        self.inner.states.subscribe(guild_id)
    }

    pub fn is_prefetching(&self, guild_id: GuildId) -> bool {
        self.inner.prefetch.is_in_flight(guild_id)
    }

    async fn drive(self, guild_id: GuildId, first: Arc<QueueItem>, first_token: CancellationToken) {
        let mut current = Some((first, first_token));
        while let Some((item, token)) = current.take() {
            let attempt = self.play_item(guild_id, &item, &token).await;
            current = self.teardown(guild_id, &item, attempt).await;
        }
        tracing::debug!(guild = %guild_id, "playback loop finished");
    }

    async fn play_item(&self, guild_id: GuildId, item: &Arc<QueueItem>, token: &CancellationToken) -> Attempt {
        let mut temp_file = None;
        let result = self.run_item(guild_id, item, token, &mut temp_file).await;
        let outcome = match result {
            _ if token.is_cancelled() => Outcome::Cancelled,
            Ok(()) => Outcome::Finished,
            Err(e) => Outcome::Failed(e),
        };
        Attempt { outcome, temp_file }
    }

    async fn run_item(
        &self,
        guild_id: GuildId,
        item: &Arc<QueueItem>,
        token: &CancellationToken,
        temp_file: &mut Option<PathBuf>,
    ) -> PlaybackResult<()> {
        let io = &self.inner.io;
        let title = item.display_title();
        let (source, options) = self.acquire(item, token, temp_file).await?;

        let slot = self.inner.states.slot(guild_id);
        {
            let mut status = slot.lock().await;
            if token.is_cancelled() {
                return Err(cancelled());
            }
            status.phase = PlaybackPhase::Joining;
        }

        io.gateway.join_voice(guild_id, item.voice_channel_id).await?;

        {
            let mut status = slot.lock().await;
            if token.is_cancelled() {
                return Err(cancelled());
            }
            status.mark_playing(ActiveChannel {
                guild_id,
                voice_channel_id: item.voice_channel_id,
                command_channel_id: item.requester.command_channel,
            });
        }

        if let Some(t) = &item.title {
            let text = format!("📽 {t}");
            if let Err(e) = io.gateway.set_voice_status(item.voice_channel_id, Some(&text)).await {
                tracing::warn!(guild = %guild_id, error = %e, "failed to set voice status");
            }
            if let Err(e) = io.gateway.set_presence(Some(t)).await {
                tracing::warn!(guild = %guild_id, error = %e, "failed to set presence");
            }
        }
        io.notifier.now_playing(&item.requester, &title).await;

        self.inner.prefetch.ensure_prefetch(guild_id);

        tracing::info!(guild = %guild_id, %title, input = %source.as_input(), "streaming");
        let session = io.transport.start(guild_id, source, &options, token.clone()).await?;

        match session.finished().await {
            Ok(()) => {
                tracing::info!(guild = %guild_id, %title, "finished playing");
                Ok(())
            }
            Err(e) if e.cancelled || token.is_cancelled() => {
                tracing::debug!(guild = %guild_id, reason = %e, "transport ended by cancellation");
                Err(PlaybackError::TransportFailed(e.reason))
            }
            Err(e) => {
                tracing::error!(guild = %guild_id, %title, reason = %e, "transport failed");
                Err(PlaybackError::TransportFailed(e.reason))
            }
        }
    }

    /// Turn the item's source into something the transport can read.
    async fn acquire(
        &self,
        item: &QueueItem,
        token: &CancellationToken,
        temp_file: &mut Option<PathBuf>,
    ) -> PlaybackResult<(TransportSource, StreamOptions)> {
        let io = &self.inner.io;
        let settings = &self.inner.settings;
        let mut options = settings.stream.clone();

        let url = match &item.source {
            MediaSource::LocalPath(path) => {
                if settings.respect_video_params {
                    match io.probe.probe(path).await {
                        Ok(params) => options = options.with_probed(&params),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "unable to probe, using configured stream options");
                        }
                    }
                }
                return Ok((TransportSource::File(path.clone()), options));
            }
            MediaSource::RemoteUrl(url) => url,
        };

        // A prefetch still running for this item is waited for, not repeated.
        let prefetched = tokio::select! {
            path = item.claim_prefetched_when_settled() => path,
            _ = token.cancelled() => {
                // The slot is closed now, so a late prefetch deletes its own file.
                if let Some(path) = item.claim_prefetched() {
                    remove_temp_file(path).await;
                }
                return Err(cancelled());
            }
        };

        if let Some(path) = prefetched {
            tracing::info!(%url, path = %path.display(), "using prefetched file");
            *temp_file = Some(path.clone());
            return Ok((TransportSource::File(path), options));
        }

        if !io.acquirer.is_downloadable(url) {
            if !io.acquirer.needs_stream_url(url) {
                return Ok((TransportSource::Url(url.clone()), options));
            }
            let stream = tokio::select! {
                stream = io.acquirer.resolve_stream_url(url) => stream?,
                _ = token.cancelled() => return Err(cancelled()),
            };
            return Ok((TransportSource::Url(stream), options));
        }

        let info = tokio::select! {
            info = io.acquirer.resolve_info(url) => info?,
            _ = token.cancelled() => return Err(cancelled()),
        };

        if info.is_live {
            tracing::info!(%url, "source is live, streaming directly");
            let live = tokio::select! {
                live = io.acquirer.resolve_stream_url(url) => live?,
                _ = token.cancelled() => return Err(cancelled()),
            };
            return Ok((TransportSource::Url(live), options));
        }

        io.notifier.acquiring(&item.requester, &item.display_title()).await;
        tracing::info!(%url, "downloading");
        let path = io.acquirer.download(url, settings.quality(), token).await?;
        *temp_file = Some(path.clone());
        Ok((TransportSource::File(path), options))
    }

    /// Release everything the attempt held, then hand back the next item
    /// to play unless the attempt was stopped outright.
    async fn teardown(
        &self,
        guild_id: GuildId,
        item: &QueueItem,
        attempt: Attempt,
    ) -> Option<(Arc<QueueItem>, CancellationToken)> {
        let io = &self.inner.io;
        let slot = self.inner.states.slot(guild_id);

        let (manual_stop, active) = {
            let mut status = slot.lock().await;
            status.phase = match attempt.outcome {
                Outcome::Finished => PlaybackPhase::Finishing,
                Outcome::Cancelled => PlaybackPhase::Stopping,
                Outcome::Failed(_) => PlaybackPhase::Failing,
            };
            (status.manual_stop, status.active_channel)
        };

        match &attempt.outcome {
            Outcome::Finished if !manual_stop => io.notifier.playback_ended(&item.requester).await,
            Outcome::Failed(e) if !manual_stop => {
                tracing::error!(guild = %guild_id, title = %item.display_title(), error = %e, "playback failed");
                io.notifier.playback_failed(&item.requester, e).await;
            }
            _ => tracing::debug!(guild = %guild_id, "playback stopped by request"),
        }

        self.inner.cancels.cancel(guild_id);
        if let Err(e) = io.gateway.stop_active_stream(guild_id).await {
            tracing::warn!(guild = %guild_id, error = %e, "failed to stop stream");
        }
        if let Err(e) = io.gateway.leave_voice(guild_id).await {
            tracing::warn!(guild = %guild_id, error = %e, "failed to leave voice");
        }
        let voice_channel = active.map(|c| c.voice_channel_id).unwrap_or(item.voice_channel_id);
        if let Err(e) = io.gateway.set_voice_status(voice_channel, None).await {
            tracing::warn!(guild = %guild_id, error = %e, "failed to clear voice status");
        }
        if let Err(e) = io.gateway.set_presence(None).await {
            tracing::warn!(guild = %guild_id, error = %e, "failed to reset presence");
        }
        if let Some(path) = attempt.temp_file {
            remove_temp_file(path).await;
        }

        let mut status = slot.lock().await;
        let advance = !status.halt_queue;
        status.reset();
        self.inner.cancels.clear(guild_id);
        self.inner.prefetch.release(guild_id);

        if !advance {
            tracing::info!(guild = %guild_id, remaining = self.inner.queue.len(guild_id), "stopped");
            return None;
        }

        let next = self.inner.queue.pop_front(guild_id)?;
        status.phase = PlaybackPhase::Acquiring;
        let token = self.inner.cancels.start_new(guild_id);
        tracing::info!(guild = %guild_id, title = %next.display_title(), "advancing queue");
        Some((next, token))
    }
}

async fn remove_temp_file(path: PathBuf) {
    if let Err(e) = tokio::fs::remove_file(&path).await {
        tracing::error!(path = %path.display(), error = %e, "failed to delete temp file");
    }
}
