use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlaybackPhase {
    #[default]
    Idle,
    Acquiring,
    Joining,
    Playing,
    Finishing,
    Stopping,
    Failing,
}

impl PlaybackPhase {
    pub fn is_idle(self) -> bool {
        self == PlaybackPhase::Idle
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveChannel {
    pub guild_id: GuildId,
    pub voice_channel_id: ChannelId,
    pub command_channel_id: ChannelId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuildStatus {
    pub joined: bool,
    pub join_succeeded: bool,
    pub playing: bool,
    /// Set by stop/skip, read once by the teardown that follows.
    pub manual_stop: bool,
    /// Set by stop only: the teardown must not advance the queue.
    pub halt_queue: bool,
    pub active_channel: Option<ActiveChannel>,
    pub phase: PlaybackPhase,
}

impl GuildStatus {
    pub fn reset(&mut self) {
        *self = GuildStatus::default();
    }

    pub fn mark_playing(&mut self, channel: ActiveChannel) {
        self.joined = true;
        self.join_succeeded = true;
        self.playing = true;
        self.active_channel = Some(channel);
        self.phase = PlaybackPhase::Playing;
    }
}

pub struct GuildSlot {
    status: Mutex<GuildStatus>,
    phase: watch::Sender<PlaybackPhase>,
}

impl GuildSlot {
    fn new() -> Self {
        let (phase, _) = watch::channel(PlaybackPhase::Idle);
        Self { status: Mutex::new(GuildStatus::default()), phase }
    }

    /// Lock the record. The phase watch is updated when the guard drops.
    pub async fn lock(&self) -> StatusGuard<'_> {
        StatusGuard { guard: self.status.lock().await, phase: &self.phase }
    }
}

pub struct StatusGuard<'a> {
    guard: MutexGuard<'a, GuildStatus>,
    phase: &'a watch::Sender<PlaybackPhase>,
}

impl Deref for StatusGuard<'_> {
    type Target = GuildStatus;
    fn deref(&self) -> &GuildStatus {
        &self.guard
    }
}

impl DerefMut for StatusGuard<'_> {
    fn deref_mut(&mut self) -> &mut GuildStatus {
        &mut self.guard
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        let current = self.guard.phase;
        self.phase.send_if_modified(|p| {
            if *p != current {
                *p = current;
                true
            } else {
                false
            }
        });
    }
}

/// One status record per guild, created on first reference and kept for
/// the lifetime of the process.
#[derive(Default)]
pub struct GuildStateRegistry {
    slots: DashMap<GuildId, Arc<GuildSlot>>,
}

impl GuildStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, guild_id: GuildId) -> Arc<GuildSlot> {
        self.slots
            .entry(guild_id)
            .or_insert_with(|| Arc::new(GuildSlot::new()))
            .clone()
    }

    pub async fn get(&self, guild_id: GuildId) -> GuildStatus {
        self.slot(guild_id).lock().await.clone()
    }

    pub async fn reset(&self, guild_id: GuildId) {
        self.slot(guild_id).lock().await.reset();
    }

    pub fn subscribe(&self, guild_id: GuildId) -> watch::Receiver<PlaybackPhase> {
        self.slot(guild_id).phase.subscribe()
    }
}
