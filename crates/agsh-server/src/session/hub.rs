//! Output fan-out for one session.
//!
//! A single hub sits between a session's PTY reader and its attached
//! viewers. Publishing appends to the replay ring and pushes the chunk into
//! every subscriber's bounded queue; snapshot capture and subscriber
//! insertion share one lock with publishing, so a new subscriber sees the
//! ring contents followed by exactly the bytes published after its attach —
//! no duplication, no gap. A subscriber whose queue fills up is dropped so
//! it can never stall the others.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ring_buffer::RingBuffer;

pub type SubscriberId = u64;

/// One delivery on a subscriber feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Raw terminal bytes, in PTY production order.
    Output(Vec<u8>),
    /// The child process terminated; no more output will follow.
    Exited { code: Option<i32> },
}

/// Handle returned by [`BroadcastHub::subscribe`].
///
/// `snapshot` holds the replay bytes captured atomically at attach;
/// `feed` yields everything published afterwards. Dropping the feed (or
/// calling `unsubscribe`) detaches the viewer.
pub struct Subscription {
    pub id: SubscriberId,
    pub snapshot: Vec<u8>,
    pub feed: mpsc::Receiver<SessionEvent>,
}

struct HubState {
    ring: RingBuffer,
    subscribers: HashMap<SubscriberId, mpsc::Sender<SessionEvent>>,
    next_id: SubscriberId,
    /// Set once the session's process has exited or been killed.
    closed: Option<Option<i32>>,
}

pub struct BroadcastHub {
    state: Mutex<HubState>,
    queue_depth: usize,
}

impl BroadcastHub {
    pub fn new(ring_capacity: usize, queue_depth: usize) -> Self {
        Self {
            state: Mutex::new(HubState {
                ring: RingBuffer::new(ring_capacity),
                subscribers: HashMap::new(),
                next_id: 0,
                closed: None,
            }),
            queue_depth,
        }
    }

    /// Attach a new subscriber, capturing the replay snapshot atomically.
    ///
    /// Subscribing to a closed hub yields an empty-queue feed that reports
    /// the exit immediately.
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let snapshot = state.ring.snapshot();
        if let Some(code) = state.closed {
            // Sender dropped after the exit event: the feed yields it, then ends.
            let _ = tx.try_send(SessionEvent::Exited { code });
        } else {
            state.subscribers.insert(id, tx);
        }
        Subscription {
            id,
            snapshot,
            feed: rx,
        }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock().subscribers.remove(&id);
    }

    /// Append to the ring and fan out to every subscriber.
    ///
    /// Synchronous and lock-bounded so the blocking PTY reader can call it
    /// directly. A subscriber with a full queue is removed rather than
    /// awaited.
    pub fn publish(&self, data: &[u8]) {
        let mut state = self.lock();
        if state.closed.is_some() {
            return;
        }
        state.ring.append(data);
        let mut dropped = Vec::new();
        for (&id, tx) in &state.subscribers {
            if tx.try_send(SessionEvent::Output(data.to_vec())).is_err() {
                dropped.push(id);
            }
        }
        for id in dropped {
            warn!(subscriber = id, "subscriber queue overflow, dropping");
            state.subscribers.remove(&id);
        }
    }

    /// Deliver the exit event to every subscriber and seal the hub.
    ///
    /// Idempotent: only the first close notifies.
    pub fn close(&self, code: Option<i32>) {
        let mut state = self.lock();
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(code);
        let subscribers = std::mem::take(&mut state.subscribers);
        debug!(notified = subscribers.len(), "hub closed");
        for tx in subscribers.into_values() {
            let _ = tx.try_send(SessionEvent::Exited { code });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        // A poisoned hub lock means a panic mid-publish; the data is plain
        // bytes, safe to keep serving.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(feed: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = feed.try_recv() {
            out.push(ev);
        }
        out
    }

    fn output_bytes(events: &[SessionEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|ev| match ev {
                SessionEvent::Output(data) => Some(data.as_slice()),
                SessionEvent::Exited { .. } => None,
            })
            .collect::<Vec<_>>()
            .concat()
    }

    #[test]
    fn subscribers_observe_identical_order() {
        let hub = BroadcastHub::new(1024, 16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.publish(b"one ");
        hub.publish(b"two ");
        hub.publish(b"three");
        let seen_a = output_bytes(&drain(&mut a.feed));
        let seen_b = output_bytes(&drain(&mut b.feed));
        assert_eq!(seen_a, b"one two three");
        assert_eq!(seen_a, seen_b);
    }

    #[test]
    fn snapshot_then_live_has_no_seam() {
        let hub = BroadcastHub::new(1024, 16);
        hub.publish(b"before ");
        let mut sub = hub.subscribe();
        hub.publish(b"after");
        let mut seen = sub.snapshot.clone();
        seen.extend(output_bytes(&drain(&mut sub.feed)));
        assert_eq!(seen, b"before after");
    }

    #[test]
    fn late_subscriber_snapshot_is_newest_capacity_bytes() {
        let capacity = 200 * 1024;
        let hub = BroadcastHub::new(capacity, 16);
        let chunk = vec![b'x'; 50 * 1024];
        for _ in 0..5 {
            hub.publish(&chunk); // 250 KiB total
        }
        let sub = hub.subscribe();
        assert_eq!(sub.snapshot.len(), capacity);
    }

    #[test]
    fn slow_subscriber_is_dropped_not_awaited() {
        let hub = BroadcastHub::new(1024, 2);
        let mut slow = hub.subscribe();
        hub.publish(b"a");
        hub.publish(b"b");
        hub.publish(b"c"); // queue full: slow is detached
        assert_eq!(hub.subscriber_count(), 0);

        // The first two events are still readable, then the feed ends.
        assert_eq!(output_bytes(&drain(&mut slow.feed)), b"ab");
        assert!(slow.feed.try_recv().is_err());

        // Later subscribers are unaffected.
        let mut fresh = hub.subscribe();
        hub.publish(b"d");
        assert_eq!(output_bytes(&drain(&mut fresh.feed)), b"d");
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn close_notifies_all_then_seals() {
        let hub = BroadcastHub::new(64, 4);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.close(Some(0));
        hub.close(Some(99)); // second close is a no-op
        assert!(matches!(
            a.feed.try_recv(),
            Ok(SessionEvent::Exited { code: Some(0) })
        ));
        assert!(matches!(
            b.feed.try_recv(),
            Ok(SessionEvent::Exited { code: Some(0) })
        ));
        assert_eq!(hub.subscriber_count(), 0);

        // Publishing after close is discarded; a late subscriber learns of
        // the exit straight away.
        hub.publish(b"ignored");
        let mut late = hub.subscribe();
        assert!(matches!(
            late.feed.try_recv(),
            Ok(SessionEvent::Exited { code: Some(0) })
        ));
    }
}
