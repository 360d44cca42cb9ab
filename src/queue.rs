// Bounded hand-off between the serial receive thread and the estimator task
//
// Producer side is synchronous (plain OS thread), consumer side is async.
// When full, the oldest item is dropped so the estimator always sees the
// freshest telemetry.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::trace;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    overflows: u64,
}

pub struct SampleQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> SampleQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                overflows: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items dropped to make room for newer ones
    pub fn overflows(&self) -> u64 {
        self.inner.lock().overflows
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Enqueue, evicting the oldest item when full.
    /// Returns false (and drops `item`) once the queue is closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.overflows += 1;
                trace!("Sample queue full, dropped oldest");
            }
            inner.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Wait for the next item. `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// End the stream; items already queued can still be popped
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_drop_oldest_on_overflow() {
        let queue = SampleQueue::new(3);
        for i in 0..5 {
            assert!(queue.push(i));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.overflows(), 2);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), Some(4));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_push_after_close_rejected() {
        let queue = SampleQueue::new(2);
        queue.push(1);
        queue.close();
        assert!(!queue.push(2));
        assert_eq!(queue.try_pop(), Some(1));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_producer_thread() {
        let queue = Arc::new(SampleQueue::new(4));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.push(7u32);
            })
        };
        let item = tokio::time::timeout(Duration::from_secs(2), queue.pop()).await;
        assert_eq!(item, Ok(Some(7)));
        producer.join().unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = Arc::new(SampleQueue::new(4));
        queue.push(1u8);
        queue.push(2u8);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = queue.pop().await {
                    seen.push(item);
                }
                seen
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let seen = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }
}
