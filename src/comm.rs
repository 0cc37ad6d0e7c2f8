//! Communication Channel
//!
//! The only objects shared between the foreground thread and a worker:
//! - [`LockedQueue`]: a bounded FIFO with blocking and non-blocking access
//! - [`CommChannel`]: one queue of [`Message`]s plus the atomic
//!   immediate-termination flag

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::message::Message;

/// Number of messages the default communication channel can buffer before
/// the producer blocks.
pub const DEFAULT_QUEUE_CAPACITY: u32 = 32;

/// A thread-safe bounded FIFO queue.
///
/// `push` and `pop` block until the queue has room or an element,
/// respectively; `try_push` and `try_pop` return immediately. Elements are
/// delivered in production order.
#[derive(Debug)]
pub struct LockedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: u32,
}

impl<T> LockedQueue<T> {
    /// Create a queue that can hold up to `capacity` elements.
    pub fn new(capacity: u32) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity as usize)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the maximum number of elements the queue can hold.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Return the number of elements currently in the queue.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Determine whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Insert an element at the end of the queue, blocking while it is full.
    pub fn push(&self, value: T) {
        let mut queue = self.lock();
        while queue.len() >= self.capacity as usize {
            queue = self
                .not_full
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
        queue.push_back(value);
        drop(queue);
        self.not_empty.notify_one();
    }

    /// Insert an element at the end of the queue if there is room.
    ///
    /// Returns the element back to the caller if the queue is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut queue = self.lock();
        if queue.len() >= self.capacity as usize {
            return Err(value);
        }
        queue.push_back(value);
        drop(queue);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove and return the element at the front of the queue, blocking
    /// while it is empty.
    pub fn pop(&self) -> T {
        let mut queue = self.lock();
        loop {
            if let Some(value) = queue.pop_front() {
                drop(queue);
                self.not_full.notify_one();
                return value;
            }
            queue = self
                .not_empty
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Remove and return the element at the front of the queue, or None if
    /// the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        let value = self.lock().pop_front();
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }
}

impl<T: Clone> LockedQueue<T> {
    /// Return a copy of the newest element without removing it, or None if
    /// the queue is empty.
    pub fn back(&self) -> Option<T> {
        self.lock().back().cloned()
    }
}

/// The communication channel shared by the foreground caller and a worker.
///
/// It consists of a bounded message queue (worker writes, foreground reads)
/// and an atomic flag with which the foreground requests the immediate
/// termination of the worker. The flag uses acquire/release ordering: a
/// request becomes visible to the worker's interrupt hook within at most one
/// hook tick.
#[derive(Debug)]
pub struct CommChannel {
    /// Message queue from the worker to the foreground
    pub queue: LockedQueue<Message>,
    immediate_termination_requested: AtomicBool,
}

impl CommChannel {
    /// Create a channel with the default queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a channel whose queue holds up to `capacity` messages.
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            queue: LockedQueue::new(capacity),
            immediate_termination_requested: AtomicBool::new(false),
        }
    }

    /// Request the immediate termination of the running sequence.
    pub fn request_termination(&self) {
        self.immediate_termination_requested.store(true, Ordering::Release);
    }

    /// Withdraw a termination request, rearming the channel.
    pub fn clear_termination_request(&self) {
        self.immediate_termination_requested.store(false, Ordering::Release);
    }

    /// Determine whether immediate termination has been requested.
    pub fn is_termination_requested(&self) -> bool {
        self.immediate_termination_requested.load(Ordering::Acquire)
    }
}

impl Default for CommChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_capacity() {
        let queue = LockedQueue::<i32>::new(42);
        assert_eq!(queue.capacity(), 42);
    }

    #[test]
    fn test_empty() {
        let queue = LockedQueue::<String>::new(10);
        assert!(queue.is_empty());

        queue.push(String::new());
        assert!(!queue.is_empty());

        queue.pop();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_pop_single_threaded() {
        let queue = LockedQueue::new(10);
        assert_eq!(queue.len(), 0);

        queue.push(42);
        queue.push(43);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), 42);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(), 43);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_push_pop_across_threads() {
        let queue = std::sync::Arc::new(LockedQueue::new(4));

        let sender_queue = std::sync::Arc::clone(&queue);
        let sender = thread::spawn(move || {
            for i in 1..=100 {
                sender_queue.push(i);
            }
        });

        thread::sleep(Duration::from_millis(5));
        for i in 1..=100 {
            assert_eq!(queue.pop(), i);
        }

        sender.join().unwrap();
    }

    #[test]
    fn test_try_pop_single_threaded() {
        let queue = LockedQueue::new(2);
        assert_eq!(queue.try_pop(), None);

        queue.push(1);
        queue.push(2);

        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_try_push_single_threaded() {
        let queue = LockedQueue::new(2);

        assert!(queue.try_push(1).is_ok());
        assert!(queue.try_push(2).is_ok());
        assert_eq!(queue.try_push(3), Err(3)); // queue full
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), 1);
        assert!(queue.try_push(3).is_ok());

        assert_eq!(queue.pop(), 2);
        assert_eq!(queue.pop(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_try_push_try_pop_across_threads() {
        let queue = std::sync::Arc::new(LockedQueue::new(4));

        let sender_queue = std::sync::Arc::clone(&queue);
        let sender = thread::spawn(move || {
            for i in 1..=100 {
                let mut value = i;
                while let Err(v) = sender_queue.try_push(value) {
                    value = v;
                    thread::yield_now();
                }
            }
        });

        for i in 1..=100 {
            let value = loop {
                if let Some(v) = queue.try_pop() {
                    break v;
                }
                thread::yield_now();
            };
            assert_eq!(value, i);
        }

        sender.join().unwrap();
    }

    #[test]
    fn test_back() {
        let queue = LockedQueue::new(2);

        queue.push(1);
        assert_eq!(queue.back(), Some(1));
        assert_eq!(queue.len(), 1);

        queue.push(2);
        assert_eq!(queue.back(), Some(2));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.back(), Some(2));
    }

    #[test]
    fn test_termination_flag() {
        let comm = CommChannel::new();
        assert!(!comm.is_termination_requested());

        comm.request_termination();
        assert!(comm.is_termination_requested());

        comm.clear_termination_request();
        assert!(!comm.is_termination_requested());
    }

    #[test]
    fn test_default_capacity() {
        let comm = CommChannel::new();
        assert_eq!(comm.queue.capacity(), DEFAULT_QUEUE_CAPACITY);
    }
}
