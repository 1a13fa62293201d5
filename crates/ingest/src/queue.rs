use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;
use tracepulse_core::error::{Result, TracepulseError};
use tracepulse_core::model::request::RequestEvent;
use tracepulse_core::model::span::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Span(Span),
    Request(RequestEvent),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReceipt {
    /// The queue was full and its oldest event was discarded to make room.
    pub dropped_oldest: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<IngestEvent>,
    closed: bool,
}

/// Bounded per-tenant queue between the ingest endpoints and the tenant
/// worker. Pushing never waits: when full, the oldest event is dropped and
/// counted.
#[derive(Debug)]
pub struct TenantQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl TenantQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue mutex poisoned")
    }

    pub fn push(&self, event: IngestEvent) -> Result<PushReceipt> {
        let mut receipt = PushReceipt::default();
        {
            let mut state = self.state();
            if state.closed {
                return Err(TracepulseError::TenantInactive(
                    "tenant queue is closed".to_string(),
                ));
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                receipt.dropped_oldest = true;
            }
            state.items.push_back(event);
        }
        self.notify.notify_one();
        Ok(receipt)
    }

    /// Waits for the next event. Returns `None` once the queue is closed;
    /// events still buffered at close time are discarded.
    pub async fn pop(&self) -> Option<IngestEvent> {
        loop {
            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.items.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn depth(&self) -> usize {
        self.state().items.len()
    }

    /// Monotonic count of events discarded by the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tracepulse_core::ErrorKind;
    use tracepulse_testkit::{base_time, request};

    use super::*;

    fn event(code: u16) -> IngestEvent {
        IngestEvent::Request(request(base_time(), "/a", code, 1.0))
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let queue = TenantQueue::new(2);
        assert!(!queue.push(event(200)).unwrap().dropped_oldest);
        assert!(!queue.push(event(201)).unwrap().dropped_oldest);
        assert!(queue.push(event(202)).unwrap().dropped_oldest);

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.pop().await, Some(event(201)));
        assert_eq!(queue.pop().await, Some(event(202)));
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(TenantQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(event(200)).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(event(200)));
    }

    #[tokio::test]
    async fn closed_queue_rejects_and_wakes_consumer() {
        let queue = Arc::new(TenantQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);
        let err = queue.push(event(200)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TenantInactive);
    }
}
