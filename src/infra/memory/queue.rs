use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use uuid::Uuid;

use crate::application::ports::{QueueError, QueueMessage, ReceivedMessage, WorkQueue};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "infra::memory::queue";

struct Slot {
    id: String,
    body: String,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<String>,
}

/// At-least-once queue with a visibility timeout, on `tokio::time` so tests can pause the clock.
pub struct MemoryQueue {
    slots: Mutex<VecDeque<Slot>>,
    visibility_timeout: Duration,
    arrivals: Notify,
    sent: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            visibility_timeout,
            arrivals: Notify::new(),
            sent: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Messages not yet deleted, visible or not.
    pub fn len(&self) -> usize {
        mutex_lock(&self.slots, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Make subsequent `send` calls fail until switched back.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Put a raw body on the queue, bypassing encoding.
    pub fn push_raw(&self, body: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        mutex_lock(&self.slots, SOURCE, "push_raw").push_back(Slot {
            id: id.clone(),
            body: body.into(),
            visible_at: Instant::now(),
            receive_count: 0,
            receipt: None,
        });
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.arrivals.notify_waiters();
        id
    }

    /// Take up to `max` visible messages, or report when the next hidden one reappears.
    fn take_visible(&self, max: usize) -> (Vec<ReceivedMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut slots = mutex_lock(&self.slots, SOURCE, "take_visible");
        let mut taken = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for slot in slots.iter_mut() {
            if slot.visible_at > now {
                next_visible = Some(next_visible.map_or(slot.visible_at, |at| at.min(slot.visible_at)));
                continue;
            }
            if taken.len() >= max {
                break;
            }
            let receipt = Uuid::new_v4().to_string();
            slot.receive_count += 1;
            slot.visible_at = now + self.visibility_timeout;
            slot.receipt = Some(receipt.clone());
            taken.push(ReceivedMessage {
                message_id: slot.id.clone(),
                receipt_handle: receipt,
                body: slot.body.clone(),
                receive_count: slot.receive_count,
            });
        }
        (taken, next_visible)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, message: &QueueMessage) -> Result<String, QueueError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(QueueError::Backend("injected send failure".to_string()));
        }
        let body = serde_json::to_string(message)?;
        Ok(self.push_raw(body))
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.arrivals.notified();
            let (batch, next_visible) = self.take_visible(max_messages.max(1));
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut slots = mutex_lock(&self.slots, SOURCE, "delete");
        slots.retain(|slot| slot.receipt.as_deref() != Some(receipt_handle));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Requester;
    use crate::domain::fingerprint::Fingerprint;
    use crate::domain::request::RenderRequest;
    use crate::domain::types::Role;

    fn message() -> QueueMessage {
        let request = RenderRequest::default();
        QueueMessage {
            request,
            fingerprint: Fingerprint::of(&request),
            requester: Requester::new("u-1", "alice", Role::User),
            job_id: Uuid::new_v4(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_message_is_redelivered_after_visibility_timeout() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.send(&message()).await.unwrap();

        let first = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].receive_count, 2);
        assert_eq!(second[0].decode().unwrap(), first[0].decode().unwrap());
    }

    #[tokio::test]
    async fn delete_by_receipt_removes_message() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.send(&message()).await.unwrap();
        let batch = queue.receive(10, Duration::ZERO).await.unwrap();

        queue.delete(&batch[0].receipt_handle).await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.sent_count(), 1);
    }

    #[tokio::test]
    async fn stale_receipt_does_not_delete_redelivered_message() {
        let queue = MemoryQueue::new(Duration::ZERO);
        queue.send(&message()).await.unwrap();
        let first = queue.receive(1, Duration::ZERO).await.unwrap();
        let _second = queue.receive(1, Duration::ZERO).await.unwrap();

        queue.delete(&first[0].receipt_handle).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_waits_for_a_send() {
        let queue = std::sync::Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(1, Duration::from_secs(20)).await })
        };
        tokio::task::yield_now().await;
        queue.send(&message()).await.unwrap();

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }
}
