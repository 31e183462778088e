//! Scan-and-evict outbound mailbox for a session, per spec §4.4's
//! back-pressure policy: on overflow, drop the oldest coalescible
//! `participant_progress`, then the oldest `heartbeat`, before closing the
//! session as a slow consumer. Terminal frames are never dropped.
//!
//! `tokio::sync::mpsc` can't implement this: a bounded channel's buffered
//! items aren't visible to the sender, only counted. This mirrors
//! `agent/queue.rs`'s `Mutex<Inner>` + `Arc<Notify>` idiom instead, scanning
//! the buffered queue directly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use super::frame::Envelope;

/// Bounded wait between notify-driven wakeups, matching the Agent
/// Coordinator's dispatch-loop poll interval.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Inner {
    queue: VecDeque<Envelope>,
    closed: bool,
}

/// Outcome of offering a frame to the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Appended without needing to evict anything.
    Delivered,
    /// Appended after evicting an older buffered frame of this kind.
    Evicted { evicted_kind: &'static str },
    /// Nothing was evictable and the frame was non-terminal: the caller
    /// must close the session as a slow consumer.
    RejectSlowConsumer,
    /// The mailbox was already closed; the frame was dropped.
    MailboxClosed,
}

/// The kinds eligible for eviction, in drop order (spec §4.4).
const EVICTABLE_KINDS: [&str; 2] = ["participant_progress", "heartbeat"];

/// The write side of a session's outbound queue.
pub struct Mailbox {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl Mailbox {
    pub fn new(capacity: usize) -> (Arc<Self>, MailboxReceiver) {
        let mailbox = Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Arc::new(Notify::new()),
            capacity,
        });
        let receiver = MailboxReceiver {
            mailbox: Arc::clone(&mailbox),
        };
        (mailbox, receiver)
    }

    /// Offer `envelope` for delivery. At capacity, evicts the oldest
    /// `participant_progress` frame, then the oldest `heartbeat`, to make
    /// room. A terminal frame that finds nothing evictable is appended past
    /// capacity rather than dropped; a non-terminal one is rejected so the
    /// caller can close the session.
    pub async fn offer(&self, envelope: Envelope, is_terminal: bool) -> OfferOutcome {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return OfferOutcome::MailboxClosed;
        }

        if inner.queue.len() < self.capacity {
            inner.queue.push_back(envelope);
            drop(inner);
            self.notify.notify_waiters();
            return OfferOutcome::Delivered;
        }

        if let Some(evicted_kind) = evict_oldest(&mut inner.queue) {
            inner.queue.push_back(envelope);
            drop(inner);
            self.notify.notify_waiters();
            return OfferOutcome::Evicted { evicted_kind };
        }

        if is_terminal {
            inner.queue.push_back(envelope);
            drop(inner);
            self.notify.notify_waiters();
            return OfferOutcome::Delivered;
        }

        OfferOutcome::RejectSlowConsumer
    }

    /// Mark the mailbox closed. Buffered frames remain available to drain;
    /// the receiver reports `None` once they're exhausted.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }
}

fn evict_oldest(queue: &mut VecDeque<Envelope>) -> Option<&'static str> {
    for kind in EVICTABLE_KINDS {
        if let Some(pos) = queue.iter().position(|e| e.kind == kind) {
            queue.remove(pos);
            return Some(kind);
        }
    }
    None
}

/// Error returned by `MailboxReceiver::try_recv`, mirroring
/// `mpsc::error::TryRecvError`'s two cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

/// The read side of a session's outbound queue, drained by its writer task.
pub struct MailboxReceiver {
    mailbox: Arc<Mailbox>,
}

impl MailboxReceiver {
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            {
                let mut inner = self.mailbox.inner.lock().await;
                if let Some(envelope) = inner.queue.pop_front() {
                    return Some(envelope);
                }
                if inner.closed {
                    return None;
                }
            }
            tokio::select! {
                _ = self.mailbox.notify.notified() => {}
                _ = tokio::time::sleep(RECV_POLL_INTERVAL) => {}
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Envelope, TryRecvError> {
        match self.mailbox.inner.try_lock() {
            Ok(mut inner) => match inner.queue.pop_front() {
                Some(envelope) => Ok(envelope),
                None if inner.closed => Err(TryRecvError::Disconnected),
                None => Err(TryRecvError::Empty),
            },
            Err(_) => Err(TryRecvError::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(kind: &str) -> Envelope {
        Envelope {
            v: 1,
            kind: kind.to_string(),
            id: "corr".to_string(),
            ts: 0,
            body: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn delivers_under_capacity_without_eviction() {
        let (mailbox, mut rx) = Mailbox::new(4);
        let outcome = mailbox.offer(envelope("heartbeat"), false).await;
        assert_eq!(outcome, OfferOutcome::Delivered);
        assert_eq!(rx.recv().await.unwrap().kind, "heartbeat");
    }

    #[tokio::test]
    async fn evicts_oldest_participant_progress_before_heartbeat() {
        let (mailbox, mut rx) = Mailbox::new(2);
        mailbox.offer(envelope("participant_progress"), false).await;
        mailbox.offer(envelope("heartbeat"), false).await;

        let outcome = mailbox.offer(envelope("task_completed"), true).await;
        assert_eq!(
            outcome,
            OfferOutcome::Evicted {
                evicted_kind: "participant_progress"
            }
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, "heartbeat");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, "task_completed");
    }

    #[tokio::test]
    async fn non_terminal_with_nothing_evictable_is_rejected() {
        let (mailbox, _rx) = Mailbox::new(1);
        // An `ack` frame is neither evictable nor terminal.
        mailbox.offer(envelope("ack"), false).await;
        let outcome = mailbox.offer(envelope("heartbeat"), false).await;
        assert_eq!(outcome, OfferOutcome::RejectSlowConsumer);
    }

    #[tokio::test]
    async fn terminal_with_nothing_evictable_is_appended_past_capacity() {
        let (mailbox, mut rx) = Mailbox::new(1);
        mailbox.offer(envelope("ack"), false).await;
        let outcome = mailbox.offer(envelope("task_completed"), true).await;
        assert_eq!(outcome, OfferOutcome::Delivered);

        assert_eq!(rx.recv().await.unwrap().kind, "ack");
        assert_eq!(rx.recv().await.unwrap().kind, "task_completed");
    }

    #[tokio::test]
    async fn closed_mailbox_drains_buffered_frames_then_reports_none() {
        let (mailbox, mut rx) = Mailbox::new(4);
        mailbox.offer(envelope("heartbeat"), false).await;
        mailbox.close().await;

        assert_eq!(rx.recv().await.unwrap().kind, "heartbeat");
        assert!(rx.recv().await.is_none());

        let outcome = mailbox.offer(envelope("heartbeat"), false).await;
        assert_eq!(outcome, OfferOutcome::MailboxClosed);
    }
}
