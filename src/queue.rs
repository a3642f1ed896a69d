use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{PlaybackError, PlaybackResult};
use crate::media::{MediaSource, Requester};

#[derive(Debug, Default)]
enum PrefetchSlot {
    #[default]
    Empty,
    /// A background download for this item is running.
    Pending,
    Ready(PathBuf),
    /// The item started playing, was removed or turned out to be live;
    /// late results are discarded.
    Closed,
}

#[derive(Debug)]
pub struct QueueItem {
    pub requester: Requester,
    pub source: MediaSource,
    pub title: Option<String>,
    pub voice_channel_id: ChannelId,
    prefetched: watch::Sender<PrefetchSlot>,
}

impl QueueItem {
    pub fn new(requester: Requester, source: MediaSource, title: Option<String>, voice_channel_id: ChannelId) -> Self {
        let (prefetched, _) = watch::channel(PrefetchSlot::Empty);
        Self { requester, source, title, voice_channel_id, prefetched }
    }

    pub fn display_title(&self) -> String {
        self.title.clone().unwrap_or_else(|| self.source.to_string())
    }

    pub fn prefetched_path(&self) -> Option<PathBuf> {
        match &*self.prefetched.borrow() {
            PrefetchSlot::Ready(p) => Some(p.clone()),
            _ => None,
        }
    }

    /// False only while nothing has been attempted for this item yet.
    pub fn prefetch_settled(&self) -> bool {
        !matches!(*self.prefetched.borrow(), PrefetchSlot::Empty)
    }

    pub fn prefetch_pending(&self) -> bool {
        matches!(*self.prefetched.borrow(), PrefetchSlot::Pending)
    }

    pub fn prefetch_closed(&self) -> bool {
        matches!(*self.prefetched.borrow(), PrefetchSlot::Closed)
    }

    /// Mark a background download as running. Fails unless the slot is empty.
    pub fn begin_prefetch(&self) -> bool {
        self.prefetched.send_if_modified(|slot| match *slot {
            PrefetchSlot::Empty => {
                *slot = PrefetchSlot::Pending;
                true
            }
            _ => false,
        })
    }

    /// A failed prefetch leaves the item to be downloaded on demand.
    pub fn abandon_prefetch(&self) {
        self.prefetched.send_if_modified(|slot| match *slot {
            PrefetchSlot::Pending => {
                *slot = PrefetchSlot::Empty;
                true
            }
            _ => false,
        });
    }

    /// Store a downloaded path. Hands the path back if the item was closed
    /// in the meantime so the caller can delete the file.
    pub fn attach_prefetched(&self, path: PathBuf) -> Result<(), PathBuf> {
        let mut rejected = None;
        self.prefetched.send_modify(|slot| match *slot {
            PrefetchSlot::Empty | PrefetchSlot::Pending => *slot = PrefetchSlot::Ready(path),
            _ => rejected = Some(path),
        });
        match rejected {
            Some(path) => Err(path),
            None => Ok(()),
        }
    }

    /// Close the slot and take whatever was prefetched. A running prefetch
    /// is not waited for; its result will be discarded.
    pub fn claim_prefetched(&self) -> Option<PathBuf> {
        match self.prefetched.send_replace(PrefetchSlot::Closed) {
            PrefetchSlot::Ready(p) => Some(p),
            _ => None,
        }
    }

    /// Like [`claim_prefetched`](Self::claim_prefetched), but lets a running
    /// prefetch finish first. Returns `None` if it failed.
    pub async fn claim_prefetched_when_settled(&self) -> Option<PathBuf> {
        let mut rx = self.prefetched.subscribe();
        let _ = rx.wait_for(|slot| !matches!(slot, PrefetchSlot::Pending)).await;
        self.claim_prefetched()
    }
}

/// Per-guild FIFO of pending items. Items are shared handles so that a
/// background task can keep writing to an item after it left the head.
#[derive(Default)]
pub struct PlaybackQueue {
    queues: DashMap<GuildId, VecDeque<Arc<QueueItem>>>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and return the new length, which is the item's position.
    pub fn push(&self, guild_id: GuildId, item: Arc<QueueItem>) -> usize {
        let mut q = self.queues.entry(guild_id).or_default();
        q.push_back(item);
        q.len()
    }

    pub fn pop_front(&self, guild_id: GuildId) -> Option<Arc<QueueItem>> {
        self.queues.get_mut(&guild_id).and_then(|mut q| q.pop_front())
    }

    pub fn peek_front(&self, guild_id: GuildId) -> Option<Arc<QueueItem>> {
        self.queues.get(&guild_id).and_then(|q| q.front().cloned())
    }

    /// Remove by 1-based position.
    pub fn remove_at(&self, guild_id: GuildId, index: usize) -> PlaybackResult<Arc<QueueItem>> {
        let mut q = self.queues.entry(guild_id).or_default();
        let len = q.len();
        if index == 0 || index > len {
            return Err(PlaybackError::IndexOutOfRange { index, len });
        }
        q.remove(index - 1).ok_or(PlaybackError::IndexOutOfRange { index, len })
    }

    pub fn list(&self, guild_id: GuildId) -> Vec<Arc<QueueItem>> {
        self.queues
            .get(&guild_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, guild_id: GuildId) -> usize {
        self.queues.get(&guild_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, guild_id: GuildId) -> bool {
        self.len(guild_id) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serenity::model::id::UserId;

    fn item(name: &str) -> Arc<QueueItem> {
        let requester = Requester { user_id: UserId::new(1), command_channel: ChannelId::new(2), message_id: None };
        Arc::new(QueueItem::new(
            requester,
            MediaSource::RemoteUrl(format!("https://www.youtube.com/watch?v={name}")),
            Some(name.to_string()),
            ChannelId::new(3),
        ))
    }

    fn titles(q: &PlaybackQueue, gid: GuildId) -> Vec<String> {
        q.list(gid).iter().map(|i| i.display_title()).collect()
    }

    #[test]
    fn push_reports_position_and_keeps_order() {
        let q = PlaybackQueue::new();
        let gid = GuildId::new(1);
        assert_eq!(q.push(gid, item("a")), 1);
        assert_eq!(q.push(gid, item("b")), 2);
        assert_eq!(q.push(gid, item("c")), 3);
        assert_eq!(titles(&q, gid), ["a", "b", "c"]);
        assert_eq!(q.pop_front(gid).unwrap().display_title(), "a");
        assert_eq!(q.peek_front(gid).unwrap().display_title(), "b");
        assert_eq!(q.len(gid), 2);
    }

    #[test]
    fn guilds_do_not_share_queues() {
        let q = PlaybackQueue::new();
        q.push(GuildId::new(1), item("a"));
        assert!(q.is_empty(GuildId::new(2)));
        assert!(q.pop_front(GuildId::new(2)).is_none());
    }

    #[test]
    fn remove_at_out_of_range_leaves_queue_untouched() {
        let q = PlaybackQueue::new();
        let gid = GuildId::new(1);

        assert!(matches!(q.remove_at(gid, 1), Err(PlaybackError::IndexOutOfRange { index: 1, len: 0 })));

        q.push(gid, item("a"));
        q.push(gid, item("b"));
        assert!(matches!(q.remove_at(gid, 0), Err(PlaybackError::IndexOutOfRange { .. })));
        assert!(matches!(q.remove_at(gid, 3), Err(PlaybackError::IndexOutOfRange { index: 3, len: 2 })));
        assert_eq!(titles(&q, gid), ["a", "b"]);

        let removed = q.remove_at(gid, 2).unwrap();
        assert_eq!(removed.display_title(), "b");
        assert_eq!(titles(&q, gid), ["a"]);
    }

    #[test]
    fn prefetch_slot_survives_queue_mutation() {
        let q = PlaybackQueue::new();
        let gid = GuildId::new(1);
        let a = item("a");
        q.push(gid, a.clone());
        q.push(gid, item("b"));

        let head = q.peek_front(gid).unwrap();
        q.remove_at(gid, 1).unwrap();
        head.attach_prefetched(PathBuf::from("/tmp/a.mp4")).unwrap();

        assert_eq!(a.prefetched_path(), Some(PathBuf::from("/tmp/a.mp4")));
        assert!(q.peek_front(gid).unwrap().prefetched_path().is_none());
    }

    #[test]
    fn closed_slot_rejects_late_results() {
        let a = item("a");
        assert!(a.claim_prefetched().is_none());
        assert!(a.prefetch_settled());
        let back = a.attach_prefetched(PathBuf::from("/tmp/late.mp4")).unwrap_err();
        assert_eq!(back, PathBuf::from("/tmp/late.mp4"));
    }

    #[tokio::test]
    async fn settled_claim_waits_for_running_prefetch() {
        let a = item("a");
        assert!(a.begin_prefetch());
        assert!(!a.begin_prefetch());

        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.claim_prefetched_when_settled().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        a.attach_prefetched(PathBuf::from("/tmp/a.mp4")).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(PathBuf::from("/tmp/a.mp4")));
        assert!(a.prefetch_closed());
    }

    #[tokio::test]
    async fn abandoned_prefetch_settles_empty_handed() {
        let a = item("a");
        a.begin_prefetch();
        a.abandon_prefetch();
        assert!(!a.prefetch_settled());
        assert_eq!(a.claim_prefetched_when_settled().await, None);
    }
}
