//! The in-memory store entry surface.
//!
//! The cache storage engine itself is a collaborator; this module is
//! the shared artifact both sides agree on: a reply plus a
//! monotonically growing body, written by exactly one producer and
//! observed by any number of readers until the entry is marked whole
//! or aborted.

use crate::http::HttpReply;
use crate::select::PingStatus;
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default buffering allowance before the entry pushes back on its
/// producer.
pub const DEFAULT_MAX_BUFFERED: usize = 16 * 1024 * 1024;

/// What an entry reader wakes up to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// New body bytes past the reader's offset.
    Data(Bytes),
    /// The entry holds the whole response.
    Completed,
    /// The entry was aborted; its content is not to be trusted.
    Aborted,
}

#[derive(Debug)]
struct Inner {
    reply: Option<Arc<HttpReply>>,
    body: BytesMut,
    accepting: bool,
    aborted: bool,
    release_requested: bool,
    private_key: bool,
    writing_started: bool,
    completed: bool,
    whole_reason: Option<&'static str>,
    ping_status: PingStatus,
    max_buffered: usize,
    credited: usize,
}

/// One cached-or-in-flight response.
#[derive(Debug)]
pub struct StoreEntry {
    inner: Mutex<Inner>,
    change: Notify,
    producer_kick: Notify,
}

impl StoreEntry {
    /// Create an empty, accepting entry.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_MAX_BUFFERED)
    }

    /// Create an entry with a custom buffering allowance.
    pub fn with_capacity(max_buffered: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                reply: None,
                body: BytesMut::new(),
                accepting: true,
                aborted: false,
                release_requested: false,
                private_key: false,
                writing_started: false,
                completed: false,
                whole_reason: None,
                ping_status: PingStatus::None,
                max_buffered,
                credited: 0,
            }),
            change: Notify::new(),
            producer_kick: Notify::new(),
        })
    }

    /// Install the reply headers without writing them out yet.
    pub fn replace_reply(&self, reply: Arc<HttpReply>) {
        self.inner.lock().unwrap().reply = Some(reply);
    }

    /// The installed reply, if any.
    pub fn reply(&self) -> Option<Arc<HttpReply>> {
        self.inner.lock().unwrap().reply.clone()
    }

    /// Begin streaming the installed reply to readers.
    pub fn start_writing(&self) {
        self.inner.lock().unwrap().writing_started = true;
        self.change.notify_waiters();
    }

    /// Whether [Self::start_writing] has been called.
    pub fn writing_started(&self) -> bool {
        self.inner.lock().unwrap().writing_started
    }

    /// How many of up to `max` bytes the entry will accept right now.
    /// Zero means the producer must defer and wait for a kick.
    pub fn bytes_wanted(&self, max: usize) -> usize {
        let inner = self.inner.lock().unwrap();
        if !inner.accepting {
            return 0;
        }
        let ceiling = inner.max_buffered + inner.credited;
        max.min(ceiling.saturating_sub(inner.body.len()))
    }

    /// Append body bytes at `offset`. The producer must write
    /// contiguously; a non-contiguous write is a producer bug.
    pub fn write(&self, offset: u64, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accepting {
            tracing::debug!("dropping write to a non-accepting entry");
            return;
        }
        debug_assert_eq!(offset, inner.body.len() as u64);
        inner.body.extend_from_slice(data);
        drop(inner);
        self.change.notify_waiters();
    }

    /// Readers report consumed bytes here, raising the buffering
    /// allowance and kicking a deferred producer.
    pub fn note_reader_progress(&self, n: usize) {
        self.inner.lock().unwrap().credited += n;
        self.producer_kick.notify_waiters();
    }

    /// Park until a deferred producer is kicked.
    pub async fn deferred_producer_kick(&self) {
        self.producer_kick.notified().await;
    }

    /// Copy the body bytes currently stored.
    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().unwrap().body)
    }

    /// Total body bytes stored.
    pub fn body_len(&self) -> u64 {
        self.inner.lock().unwrap().body.len() as u64
    }

    /// Whether the entry has stored any body bytes.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().body.is_empty()
    }

    /// Whether the entry still accepts producer writes.
    pub fn is_accepting(&self) -> bool {
        self.inner.lock().unwrap().accepting
    }

    /// Record the reason we are certain the stored reply is whole.
    pub fn mark_whole(&self, reason: &'static str) {
        tracing::debug!(reason, "stored reply is whole");
        self.inner.lock().unwrap().whole_reason = Some(reason);
    }

    /// The whole-reply marker, if one was recorded.
    pub fn whole_reason(&self) -> Option<&'static str> {
        self.inner.lock().unwrap().whole_reason
    }

    /// Terminate the entry normally. Readers observe
    /// [ReaderEvent::Completed] once they drain the body.
    pub fn complete(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.completed = true;
            inner.accepting = false;
        }
        self.change.notify_waiters();
        self.producer_kick.notify_waiters();
    }

    /// Whether the entry terminated normally.
    pub fn completed(&self) -> bool {
        self.inner.lock().unwrap().completed
    }

    /// Terminate the entry abnormally.
    pub fn abort(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.aborted = true;
            inner.accepting = false;
        }
        self.change.notify_waiters();
        self.producer_kick.notify_waiters();
    }

    /// Whether the entry was aborted.
    pub fn aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }

    /// Ask the store to drop this entry once the last reference goes.
    pub fn release(&self) {
        self.inner.lock().unwrap().release_requested = true;
    }

    /// Whether a release was requested.
    pub fn release_requested(&self) -> bool {
        self.inner.lock().unwrap().release_requested
    }

    /// Key this entry privately so it is never shared between clients.
    pub fn mark_private(&self) {
        self.inner.lock().unwrap().private_key = true;
    }

    /// Whether the entry is privately keyed.
    pub fn is_private(&self) -> bool {
        self.inner.lock().unwrap().private_key
    }

    /// The probe state of this entry.
    pub fn ping_status(&self) -> PingStatus {
        self.inner.lock().unwrap().ping_status
    }

    /// Update the probe state of this entry.
    pub fn set_ping_status(&self, status: PingStatus) {
        self.inner.lock().unwrap().ping_status = status;
    }

    /// Park a reader at `offset` until there is something new to see.
    pub async fn next_reader_event(&self, offset: u64) -> ReaderEvent {
        loop {
            let notified = self.change.notified();
            {
                let inner = self.inner.lock().unwrap();
                if (inner.body.len() as u64) > offset {
                    return ReaderEvent::Data(Bytes::copy_from_slice(
                        &inner.body[offset as usize..],
                    ));
                }
                if inner.aborted {
                    return ReaderEvent::Aborted;
                }
                if inner.completed {
                    return ReaderEvent::Completed;
                }
            }
            notified.await;
        }
    }
}

/// Cache-index invalidation seam for purge-others.
pub trait Purger: 'static + Send + Sync + std::fmt::Debug {
    /// Invalidate any cached entries for the given absolute URL.
    fn purge(&self, url: &str);
}

/// Trait-object [Purger].
pub type DynPurger = Arc<dyn Purger>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_grow_monotonically() {
        let entry = StoreEntry::new();
        entry.write(0, b"hel");
        entry.write(3, b"lo");
        assert_eq!(Bytes::from_static(b"hello"), entry.body());
        assert!(!entry.is_empty());
    }

    #[test]
    fn aborted_entries_refuse_writes() {
        let entry = StoreEntry::new();
        entry.write(0, b"x");
        entry.abort();
        assert!(!entry.is_accepting());
        entry.write(1, b"y");
        assert_eq!(1, entry.body_len());
    }

    #[test]
    fn backpressure_counts_reader_progress() {
        let entry = StoreEntry::with_capacity(8);
        assert_eq!(8, entry.bytes_wanted(100));
        entry.write(0, b"12345678");
        assert_eq!(0, entry.bytes_wanted(100));
        entry.note_reader_progress(4);
        assert_eq!(4, entry.bytes_wanted(100));
    }

    #[tokio::test]
    async fn readers_observe_growth_then_completion() {
        let entry = StoreEntry::new();
        entry.write(0, b"abc");

        match entry.next_reader_event(0).await {
            ReaderEvent::Data(data) => {
                assert_eq!(Bytes::from_static(b"abc"), data)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let waiter = {
            let entry = entry.clone();
            tokio::spawn(async move { entry.next_reader_event(3).await })
        };
        entry.complete();
        assert_eq!(ReaderEvent::Completed, waiter.await.unwrap());
    }

    #[tokio::test]
    async fn deferred_producer_wakes_on_kick() {
        let entry = StoreEntry::with_capacity(1);
        entry.write(0, b"x");
        assert_eq!(0, entry.bytes_wanted(10));

        let waiter = {
            let entry = entry.clone();
            tokio::spawn(async move {
                entry.deferred_producer_kick().await;
                entry.bytes_wanted(10)
            })
        };
        // let the waiter park first
        tokio::task::yield_now().await;
        entry.note_reader_progress(2);
        assert_eq!(2, waiter.await.unwrap());
    }
}
