#![allow(dead_code)]

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use voxcast::media::{
    MediaAcquirer, MediaInfo, MediaProbe, MediaSource, PlaybackNotifier, QualityConstraints, Requester,
    SearchResult, StreamOptions, TransportError, TransportPipeline, TransportSession, TransportSource,
    VideoParams, VoiceGateway,
};
use voxcast::{Collaborators, PlayRequest, PlaybackError, PlaybackOrchestrator, PlaybackResult, PlaybackSettings};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn guild() -> GuildId {
    GuildId::new(100)
}

pub fn voice() -> ChannelId {
    ChannelId::new(200)
}

pub fn text_channel() -> ChannelId {
    ChannelId::new(300)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayCall {
    Join(GuildId, ChannelId),
    Leave(GuildId),
    StopStream(GuildId),
    Status(ChannelId, Option<String>),
    Presence(Option<String>),
}

#[derive(Default)]
pub struct FakeGateway {
    pub calls: Mutex<Vec<GatewayCall>>,
    pub fail_join: AtomicBool,
}

impl FakeGateway {
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    async fn join_voice(&self, guild_id: GuildId, channel_id: ChannelId) -> PlaybackResult<()> {
        self.record(GatewayCall::Join(guild_id, channel_id));
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(PlaybackError::JoinFailed("no permission".into()));
        }
        Ok(())
    }

    async fn leave_voice(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.record(GatewayCall::Leave(guild_id));
        Ok(())
    }

    async fn stop_active_stream(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.record(GatewayCall::StopStream(guild_id));
        Ok(())
    }

    async fn set_voice_status(&self, channel_id: ChannelId, text: Option<&str>) -> PlaybackResult<()> {
        self.record(GatewayCall::Status(channel_id, text.map(str::to_string)));
        Ok(())
    }

    async fn set_presence(&self, watching: Option<&str>) -> PlaybackResult<()> {
        self.record(GatewayCall::Presence(watching.map(str::to_string)));
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Note {
    Acquiring(String),
    NowPlaying(String),
    Ended,
    Failed(String),
}

#[derive(Default)]
pub struct FakeNotifier {
    pub notes: Mutex<Vec<Note>>,
}

impl FakeNotifier {
    pub fn notes(&self) -> Vec<Note> {
        self.notes.lock().unwrap().clone()
    }

    pub fn failures(&self) -> usize {
        self.notes().iter().filter(|n| matches!(n, Note::Failed(_))).count()
    }

    pub fn endings(&self) -> usize {
        self.notes().iter().filter(|n| **n == Note::Ended).count()
    }
}

#[async_trait]
impl PlaybackNotifier for FakeNotifier {
    async fn acquiring(&self, _requester: &Requester, title: &str) {
        self.notes.lock().unwrap().push(Note::Acquiring(title.to_string()));
    }

    async fn now_playing(&self, _requester: &Requester, title: &str) {
        self.notes.lock().unwrap().push(Note::NowPlaying(title.to_string()));
    }

    async fn playback_ended(&self, _requester: &Requester) {
        self.notes.lock().unwrap().push(Note::Ended);
    }

    async fn playback_failed(&self, _requester: &Requester, error: &PlaybackError) {
        self.notes.lock().unwrap().push(Note::Failed(error.to_string()));
    }
}

/// Downloads write small files into a scratch directory. With a closed
/// gate, downloads block until `open_gate` or cancellation.
pub struct FakeAcquirer {
    dir: PathBuf,
    gate: Semaphore,
    live: Mutex<HashSet<String>>,
    failures_left: AtomicUsize,
    pub downloads: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub info_calls: AtomicUsize,
    pub created: Mutex<Vec<PathBuf>>,
}

impl FakeAcquirer {
    pub fn new(dir: &Path, gated: bool) -> Self {
        let permits = if gated { 0 } else { Semaphore::MAX_PERMITS };
        Self {
            dir: dir.to_path_buf(),
            gate: Semaphore::new(permits),
            live: Mutex::new(HashSet::new()),
            failures_left: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            info_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn mark_live(&self, url: &str) {
        self.live.lock().unwrap().insert(url.to_string());
    }

    /// The next `n` downloads fail once they get past the gate.
    pub fn fail_next_downloads(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn open_gate(&self, downloads: usize) {
        self.gate.add_permits(downloads);
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<PathBuf> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaAcquirer for FakeAcquirer {
    fn is_downloadable(&self, url: &str) -> bool {
        url.contains("youtube.com")
    }

    fn needs_stream_url(&self, url: &str) -> bool {
        url.contains("twitch.tv")
    }

    async fn resolve_info(&self, url: &str) -> PlaybackResult<MediaInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        Ok(MediaInfo { title: Some(url.to_string()), is_live: self.live.lock().unwrap().contains(url) })
    }

    async fn resolve_stream_url(&self, url: &str) -> PlaybackResult<String> {
        Ok(format!("{url}#live"))
    }

    async fn download(
        &self,
        url: &str,
        _quality: QualityConstraints,
        cancel: &CancellationToken,
    ) -> PlaybackResult<PathBuf> {
        let n = self.downloads.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let permitted = tokio::select! {
            permit = self.gate.acquire() => {
                if let Ok(p) = permit {
                    p.forget();
                }
                true
            }
            _ = cancel.cancelled() => false,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        if !permitted {
            return Err(PlaybackError::AcquisitionFailed("download cancelled".into()));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PlaybackError::AcquisitionFailed("HTTP Error 403: Forbidden".into()));
        }

        let path = self.dir.join(format!("dl-{n}.mp4"));
        tokio::fs::write(&path, url.as_bytes()).await?;
        self.created.lock().unwrap().push(path.clone());
        Ok(path)
    }

    async fn search(&self, query: &str, limit: usize) -> PlaybackResult<Vec<SearchResult>> {
        Ok((0..limit)
            .map(|i| SearchResult { title: format!("{query} {i}"), url: format!("https://www.youtube.com/watch?v={i}") })
            .collect())
    }
}

pub struct FakeProbe;

#[async_trait]
impl MediaProbe for FakeProbe {
    async fn probe(&self, _path: &Path) -> PlaybackResult<VideoParams> {
        Err(PlaybackError::AcquisitionFailed("no ffprobe in tests".into()))
    }
}

type Finisher = Arc<Mutex<Option<oneshot::Sender<Result<(), TransportError>>>>>;

/// Sessions stay open until the test calls `finish`/`fail` or the token
/// is cancelled, which resolves them with a cancellation error.
pub struct FakeTransport {
    started_tx: mpsc::UnboundedSender<TransportSource>,
    started_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportSource>>,
    sessions: Mutex<HashMap<GuildId, Finisher>>,
    pub starts: AtomicUsize,
}

impl Default for FakeTransport {
    fn default() -> Self {
        let (started_tx, started_rx) = mpsc::unbounded_channel();
        Self {
            started_tx,
            started_rx: tokio::sync::Mutex::new(started_rx),
            sessions: Mutex::new(HashMap::new()),
            starts: AtomicUsize::new(0),
        }
    }
}

impl FakeTransport {
    pub async fn next_start(&self) -> TransportSource {
        let mut rx = self.started_rx.lock().await;
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for transport start")
            .expect("transport channel closed")
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn finish(&self, guild_id: GuildId) {
        self.resolve(guild_id, Ok(()));
    }

    pub fn fail(&self, guild_id: GuildId, reason: &str) {
        self.resolve(guild_id, Err(TransportError { reason: reason.to_string(), cancelled: false }));
    }

    fn resolve(&self, guild_id: GuildId, result: Result<(), TransportError>) {
        let finisher = self.sessions.lock().unwrap().remove(&guild_id).expect("no session for guild");
        let sender = finisher.lock().unwrap().take();
        if let Some(tx) = sender {
            let _ = tx.send(result);
        }
    }
}

#[async_trait]
impl TransportPipeline for FakeTransport {
    async fn start(
        &self,
        guild_id: GuildId,
        source: TransportSource,
        _options: &StreamOptions,
        cancel: CancellationToken,
    ) -> PlaybackResult<TransportSession> {
        let (tx, session) = TransportSession::channel();
        let finisher: Finisher = Arc::new(Mutex::new(Some(tx)));
        self.sessions.lock().unwrap().insert(guild_id, finisher.clone());

        tokio::spawn(async move {
            cancel.cancelled().await;
            let sender = finisher.lock().unwrap().take();
            if let Some(tx) = sender {
                let _ = tx.send(Err(TransportError { reason: "aborted".into(), cancelled: true }));
            }
        });

        self.starts.fetch_add(1, Ordering::SeqCst);
        let _ = self.started_tx.send(source);
        Ok(session)
    }
}

pub struct Harness {
    pub orchestrator: PlaybackOrchestrator,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<FakeNotifier>,
    pub acquirer: Arc<FakeAcquirer>,
    pub transport: Arc<FakeTransport>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Downloads block until the test opens the gate.
    pub fn gated() -> Self {
        Self::build(true)
    }

    fn build(gated: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let gateway = Arc::new(FakeGateway::default());
        let notifier = Arc::new(FakeNotifier::default());
        let acquirer = Arc::new(FakeAcquirer::new(dir.path(), gated));
        let transport = Arc::new(FakeTransport::default());
        let orchestrator = PlaybackOrchestrator::new(
            Collaborators {
                gateway: gateway.clone(),
                notifier: notifier.clone(),
                acquirer: acquirer.clone(),
                transport: transport.clone(),
                probe: Arc::new(FakeProbe),
            },
            PlaybackSettings::default(),
        );
        Self { orchestrator, gateway, notifier, acquirer, transport, dir }
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.orchestrator.subscribe(guild());
        timeout(WAIT, rx.wait_for(|p| p.is_idle()))
            .await
            .expect("timed out waiting for idle")
            .expect("phase channel closed");
    }

    pub fn queued_titles(&self) -> Vec<String> {
        self.orchestrator.queue(guild()).iter().map(|i| i.display_title()).collect()
    }
}

pub fn requester() -> Requester {
    Requester { user_id: UserId::new(1), command_channel: text_channel(), message_id: Some(MessageId::new(9)) }
}

pub fn local(name: &str) -> PlayRequest {
    PlayRequest {
        guild_id: Some(guild()),
        requester: requester(),
        source: MediaSource::LocalPath(PathBuf::from(format!("/videos/{name}.mp4"))),
        title: Some(name.to_string()),
        voice_channel_id: Some(voice()),
    }
}

pub fn youtube(id: &str) -> PlayRequest {
    PlayRequest {
        guild_id: Some(guild()),
        requester: requester(),
        source: MediaSource::RemoteUrl(youtube_url(id)),
        title: Some(id.to_string()),
        voice_channel_id: Some(voice()),
    }
}

pub fn youtube_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

pub fn local_source(name: &str) -> TransportSource {
    TransportSource::File(PathBuf::from(format!("/videos/{name}.mp4")))
}

/// Poll until `cond` holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
