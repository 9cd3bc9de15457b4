//! A bounded non-blocking queue that drops the oldest element on overflow.
//!
//! Event emission must never stall the dispatcher, so senders always succeed
//! immediately; a slow consumer loses the oldest queued items and the drops
//! are counted for the metrics endpoint.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::Notify;

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicU64,
}

pub struct Sender<T>(Arc<Inner<T>>);

pub struct Receiver<T>(Arc<Inner<T>>);

pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        queue: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        capacity: capacity.max(1),
        dropped: AtomicU64::new(0),
        closed: AtomicU64::new(0),
    });
    (Sender(inner.clone()), Receiver(inner))
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Sender<T> {
    /// Enqueues immediately. Returns the element displaced by the capacity
    /// bound, if any.
    pub fn send(&self, value: T) -> Option<T> {
        let mut queue = self.0.queue.lock().unwrap();
        let displaced = if queue.len() >= self.0.capacity {
            self.0.dropped.fetch_add(1, Ordering::Relaxed);
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(value);
        drop(queue);
        self.0.notify.notify_one();
        displaced
    }

    /// How many elements overflow has discarded so far.
    pub fn dropped(&self) -> u64 {
        self.0.dropped.load(Ordering::Relaxed)
    }

    /// Marks the channel closed; the receiver drains what is queued and then
    /// observes the end of the stream.
    pub fn close(&self) {
        self.0.closed.store(1, Ordering::Release);
        self.0.notify.notify_waiters();
        self.0.notify.notify_one();
    }
}

impl<T> Receiver<T> {
    /// Awaits the next element; `None` after close once drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.0.notify.notified();
            if let Some(value) = self.0.queue.lock().unwrap().pop_front() {
                return Some(value);
            }
            if self.0.closed.load(Ordering::Acquire) == 1 {
                // Racing sends publish before notifying, so check once more.
                return self.0.queue.lock().unwrap().pop_front();
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.0.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
