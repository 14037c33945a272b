//! In-memory FIFO with completion tracking.

use std::collections::VecDeque;

use tokio::sync::{watch, Mutex, Notify};

/// Unbounded FIFO queue for a single consumer. Every item handed out by
/// [`LocalQueue::get`] must be acknowledged with [`LocalQueue::commit`];
/// [`LocalQueue::teardown`] waits for that.
#[derive(Debug)]
pub struct LocalQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
    unfinished: watch::Sender<usize>,
}

impl<T> Default for LocalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LocalQueue<T> {
    pub fn new() -> Self {
        let (unfinished, _) = watch::channel(0);
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            unfinished,
        }
    }

    pub async fn put(&self, item: T) {
        self.items.lock().await.push_back(item);
        self.unfinished.send_modify(|n| *n += 1);
        self.available.notify_one();
    }

    /// Waits for the next item.
    pub async fn get(&self) -> T {
        loop {
            if let Some(item) = self.items.lock().await.pop_front() {
                return item;
            }
            self.available.notified().await;
        }
    }

    /// Marks one dequeued item as fully processed.
    pub async fn commit(&self) {
        self.unfinished.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Resolves once every item put so far has been committed.
    pub async fn teardown(&self) {
        let mut rx = self.unfinished.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Items waiting to be dequeued.
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Items put but not yet committed, including the one in flight.
    pub fn unfinished(&self) -> usize {
        *self.unfinished.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn items_come_out_in_put_order() {
        let queue = LocalQueue::new();
        for i in 0..5 {
            queue.put(i).await;
        }
        assert_eq!(queue.len().await, 5);
        let mut out = Vec::new();
        for _ in 0..5 {
            out.push(queue.get().await);
            queue.commit().await;
        }
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn get_waits_for_a_put() {
        let queue = Arc::new(LocalQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.put("late").await;
        assert_eq!(consumer.await.unwrap(), "late");
    }

    #[tokio::test]
    async fn teardown_waits_for_commit_not_dequeue() {
        let queue = Arc::new(LocalQueue::new());
        queue.put(1).await;
        let _ = queue.get().await;
        assert_eq!(queue.unfinished(), 1);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.teardown().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        queue.commit().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("teardown resolves")
            .unwrap();
    }

    #[tokio::test]
    async fn teardown_on_idle_queue_returns_at_once() {
        let queue: LocalQueue<u8> = LocalQueue::new();
        tokio::time::timeout(Duration::from_millis(100), queue.teardown())
            .await
            .expect("idle queue drains immediately");
    }
}
