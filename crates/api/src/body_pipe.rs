//! A bounded byte channel between one body producer and one consumer.
//!
//! Request bodies flow client-to-upstream through one of these, and
//! while response adaptation is active the virgin and adapted reply
//! bodies each flow through their own. The buffer is bounded: a full
//! pipe pushes back on the producer, an empty one parks the consumer,
//! and both sides learn about termination through the same wakeups as
//! data and space.

use bytes::{Buf, Bytes, BytesMut};
use std::sync::Mutex;
use tokio::sync::Notify;

/// The fixed buffer bound of every pipe.
pub const MAX_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerState {
    Producing,
    Ended,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerState {
    Absent,
    Attached,
    Aborted,
}

/// What a parked consumer wakes up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// Buffered bytes are available.
    Data,
    /// The whole body was produced and consumed.
    Ended,
    /// The producer gave up mid-body.
    ProducerAborted,
}

/// What a parked producer wakes up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerEvent {
    /// Buffer space is available.
    Space,
    /// The consumer gave up; produced bytes go nowhere.
    ConsumerAborted,
}

#[derive(Debug)]
struct Inner {
    buf: BytesMut,
    body_size: Option<u64>,
    put_size: u64,
    consumed_size: u64,
    producer: ProducerState,
    consumer: ConsumerState,
    no_consumption: bool,
}

/// A bounded single-producer, single-consumer body channel.
#[derive(Debug)]
pub struct BodyPipe {
    inner: Mutex<Inner>,
    space_available: Notify,
    data_available: Notify,
}

impl Default for BodyPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyPipe {
    /// Construct an empty pipe with an active producer and no consumer.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: BytesMut::new(),
                body_size: None,
                put_size: 0,
                consumed_size: 0,
                producer: ProducerState::Producing,
                consumer: ConsumerState::Absent,
                no_consumption: false,
            }),
            space_available: Notify::new(),
            data_available: Notify::new(),
        }
    }

    /// Declare the total body size, enabling exact end-of-body
    /// detection without an explicit production stop.
    pub fn set_body_size(&self, size: u64) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.body_size.is_none());
        inner.body_size = Some(size);
    }

    /// The declared total body size, if known.
    pub fn body_size(&self) -> Option<u64> {
        self.inner.lock().unwrap().body_size
    }

    /// Append bytes, returning how many were accepted. Returns zero
    /// exactly when the buffer is full.
    pub fn put_more_data(&self, data: &[u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(ProducerState::Producing, inner.producer);

        if inner.no_consumption {
            // nobody will read these bytes; accept and drop them so the
            // producer can finish
            inner.put_size += data.len() as u64;
            return data.len();
        }

        let space = MAX_CAPACITY - inner.buf.len();
        let take = space.min(data.len());
        if take > 0 {
            inner.buf.extend_from_slice(&data[..take]);
            inner.put_size += take as u64;
            drop(inner);
            self.data_available.notify_waiters();
        }
        take
    }

    /// Remove `n` bytes from the front of the buffer.
    pub fn consume(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        assert!(n <= inner.buf.len());
        inner.buf.advance(n);
        inner.consumed_size += n as u64;
        drop(inner);
        self.space_available.notify_waiters();
    }

    /// A copy of the currently buffered bytes.
    pub fn content(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().unwrap().buf)
    }

    /// Bytes currently buffered.
    pub fn data_size(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    /// Total bytes consumed so far.
    pub fn consumed_size(&self) -> u64 {
        self.inner.lock().unwrap().consumed_size
    }

    /// Buffer headroom a producer could fill right now.
    pub fn potential_space_size(&self) -> usize {
        MAX_CAPACITY - self.inner.lock().unwrap().buf.len()
    }

    /// True once the producer finished successfully.
    pub fn production_ended(&self) -> bool {
        self.inner.lock().unwrap().producer == ProducerState::Ended
    }

    /// True once the producer gave up mid-body.
    pub fn producer_aborted(&self) -> bool {
        self.inner.lock().unwrap().producer == ProducerState::Aborted
    }

    /// True when no more bytes will ever come out of this pipe.
    pub fn exhausted(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.buf.is_empty() && !Self::may_produce_more(&inner)
    }

    /// True once the whole body has been produced, either by an
    /// explicit production stop or by reaching the declared size.
    pub fn produced_whole(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.producer {
            ProducerState::Ended => true,
            ProducerState::Aborted => false,
            ProducerState::Producing => match inner.body_size {
                Some(size) => inner.put_size >= size,
                None => false,
            },
        }
    }

    fn may_produce_more(inner: &Inner) -> bool {
        match inner.producer {
            ProducerState::Producing => match inner.body_size {
                Some(size) => inner.put_size < size,
                None => true,
            },
            ProducerState::Ended | ProducerState::Aborted => false,
        }
    }

    /// End production. With `at_eof` the body is complete (an unknown
    /// size becomes the byte count produced); otherwise the production
    /// is aborted. Wakes both sides.
    pub fn stop_producing(&self, at_eof: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.producer != ProducerState::Producing {
                return;
            }
            if at_eof {
                if inner.body_size.is_none() {
                    inner.body_size = Some(inner.put_size);
                }
                inner.producer = ProducerState::Ended;
            } else {
                inner.producer = ProducerState::Aborted;
            }
        }
        self.data_available.notify_waiters();
        self.space_available.notify_waiters();
    }

    /// End production mid-body.
    pub fn abort_production(&self) {
        self.stop_producing(false);
    }

    /// Attach the consumer, unless bytes were already dropped or
    /// consumed so the newcomer would see a hole.
    pub fn attach_consumer_if_not_late(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.consumer != ConsumerState::Absent {
            return false;
        }
        let missed =
            inner.consumed_size + inner.buf.len() as u64 != inner.put_size;
        if missed || inner.no_consumption {
            // some produced bytes are already gone; a consumer attached
            // now would see a hole
            return false;
        }
        inner.consumer = ConsumerState::Attached;
        true
    }

    /// Announce that produced bytes will never be consumed. Buffered
    /// and future bytes are dropped so the producer can finish.
    pub fn expect_no_consumption(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.no_consumption = true;
            inner.buf.clear();
        }
        self.space_available.notify_waiters();
    }

    /// Detach the consumer mid-body; the producer observes
    /// [ProducerEvent::ConsumerAborted] at its next wakeup.
    pub fn abort_consumption(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.consumer = ConsumerState::Aborted;
        }
        self.space_available.notify_waiters();
    }

    /// True once the consumer gave up.
    pub fn consumer_aborted(&self) -> bool {
        self.inner.lock().unwrap().consumer == ConsumerState::Aborted
    }

    /// Park until data or a termination event is observable.
    pub async fn next_data_event(&self) -> ConsumerEvent {
        loop {
            let notified = self.data_available.notified();
            {
                let inner = self.inner.lock().unwrap();
                if !inner.buf.is_empty() {
                    return ConsumerEvent::Data;
                }
                if inner.producer == ProducerState::Aborted {
                    return ConsumerEvent::ProducerAborted;
                }
                if !Self::may_produce_more(&inner) {
                    return ConsumerEvent::Ended;
                }
            }
            notified.await;
        }
    }

    /// Park until buffer space or a consumer abort is observable.
    pub async fn next_space_event(&self) -> ProducerEvent {
        loop {
            let notified = self.space_available.notified();
            {
                let inner = self.inner.lock().unwrap();
                if inner.consumer == ConsumerState::Aborted {
                    return ProducerEvent::ConsumerAborted;
                }
                if inner.no_consumption
                    || inner.buf.len() < MAX_CAPACITY
                {
                    return ProducerEvent::Space;
                }
            }
            notified.await;
        }
    }

    /// One-line state summary for logging.
    pub fn status(&self) -> String {
        let inner = self.inner.lock().unwrap();
        format!(
            "[{}+{}/{} {:?}/{:?}]",
            inner.consumed_size,
            inner.buf.len(),
            inner
                .body_size
                .map(|s| s.to_string())
                .unwrap_or_else(|| "?".into()),
            inner.producer,
            inner.consumer,
        )
    }
}
