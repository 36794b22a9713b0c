//! In-process mutation notifications.
//!
//! Every write operation records a `(kind, issue_id)` event in a bounded
//! ring buffer. Long-polling clients fetch events newer than a timestamp;
//! when the buffer has rolled past their cursor they are told to resync
//! with a full listing.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// What kind of write produced a mutation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
}

/// One recorded mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    /// Monotone sequence number.
    pub seq: u64,
    /// Logical timestamp in milliseconds.
    pub timestamp_ms: i64,
    pub kind: MutationKind,
    pub issue_id: String,
}

/// Result of a `get_mutations` poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationPage {
    /// Events newer than the requested cursor, oldest first.
    pub mutations: Vec<Mutation>,
    /// Set when the buffer rolled past the cursor; the client should run
    /// a full listing instead of trusting the stream.
    pub resync: bool,
}

/// Bounded ring buffer of mutation events.
pub struct MutationBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    events: VecDeque<Mutation>,
    next_seq: u64,
    /// Timestamp of the newest event ever evicted.
    evicted_through_ms: i64,
}

impl MutationBuffer {
    /// Creates a buffer holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(capacity),
                next_seq: 1,
                evicted_through_ms: -1,
            }),
            capacity,
        }
    }

    /// Records a mutation event.
    pub fn record(&self, kind: MutationKind, issue_id: &str) {
        let mut inner = self.inner.lock().expect("mutation buffer lock");
        let seq = inner.next_seq;
        inner.next_seq += 1;

        // Never earlier than the previous event: the stream is monotone
        // even if the wall clock steps backwards.
        let now = Utc::now().timestamp_millis();
        let timestamp_ms = inner
            .events
            .back()
            .map_or(now, |last| now.max(last.timestamp_ms));

        if inner.events.len() == self.capacity {
            if let Some(evicted) = inner.events.pop_front() {
                inner.evicted_through_ms = inner.evicted_through_ms.max(evicted.timestamp_ms);
            }
        }
        inner.events.push_back(Mutation {
            seq,
            timestamp_ms,
            kind,
            issue_id: issue_id.to_string(),
        });
    }

    /// Returns events strictly newer than `since_ms`.
    ///
    /// When events at or after `since_ms` have already been evicted, the
    /// page is flagged for resync.
    pub fn since(&self, since_ms: i64) -> MutationPage {
        let inner = self.inner.lock().expect("mutation buffer lock");
        let resync = since_ms < inner.evicted_through_ms;
        let mutations = inner
            .events
            .iter()
            .filter(|m| m.timestamp_ms > since_ms)
            .cloned()
            .collect();
        MutationPage { mutations, resync }
    }

    /// Number of events currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("mutation buffer lock").events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let buf = MutationBuffer::new(8);
        buf.record(MutationKind::Create, "bd-a");
        buf.record(MutationKind::Update, "bd-a");
        buf.record(MutationKind::Create, "bd-b");

        let page = buf.since(-1);
        assert!(!page.resync);
        assert_eq!(page.mutations.len(), 3);
        assert_eq!(page.mutations[0].seq, 1);
        assert_eq!(page.mutations[2].issue_id, "bd-b");
        // Sequence and timestamps are monotone.
        for pair in page.mutations.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
            assert!(pair[0].timestamp_ms <= pair[1].timestamp_ms);
        }
    }

    #[test]
    fn since_filters_by_timestamp() {
        let buf = MutationBuffer::new(8);
        buf.record(MutationKind::Create, "bd-a");
        let cut = buf.since(-1).mutations[0].timestamp_ms;
        let page = buf.since(cut);
        assert!(page.mutations.is_empty());
    }

    #[test]
    fn rollover_signals_resync() {
        let buf = MutationBuffer::new(2);
        buf.record(MutationKind::Create, "bd-1");
        let first_ts = buf.since(-1).mutations[0].timestamp_ms;
        buf.record(MutationKind::Create, "bd-2");
        buf.record(MutationKind::Create, "bd-3"); // evicts bd-1

        assert_eq!(buf.len(), 2);
        // A cursor from before the evicted event must resync.
        let page = buf.since(first_ts - 1);
        assert!(page.resync);
    }
}
