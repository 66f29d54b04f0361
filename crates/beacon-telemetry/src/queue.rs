//! Bounded in-memory staging queue
//!
//! FIFO by insertion order, with explicit front-reinsertion reserved for
//! failed-batch rollback. Overflow policy is reject-newest: existing entries
//! are never evicted, and every rejected event fires the drop hook exactly
//! once. All operations complete immediately, which is what makes the queue
//! safe to touch from the synchronous `track()` path.

use std::collections::VecDeque;
use tracing::warn;

use crate::event::{Event, EventHook};

/// Bounded FIFO staging buffer for events awaiting delivery.
pub struct BoundedQueue {
    items: VecDeque<Event>,
    capacity: usize,
    on_drop: Option<EventHook>,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            on_drop: None,
        }
    }

    pub fn with_drop_hook(capacity: usize, on_drop: EventHook) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            on_drop: Some(on_drop),
        }
    }

    /// Append an event. Returns `false` (after firing the drop hook) when the
    /// queue is at capacity; never blocks, never evicts.
    pub fn enqueue(&mut self, event: Event) -> bool {
        if self.is_full() {
            self.reject(event);
            return false;
        }
        self.items.push_back(event);
        true
    }

    /// Append several events, accepting in input order until capacity is
    /// reached. Returns the number accepted.
    pub fn enqueue_many(&mut self, events: Vec<Event>) -> usize {
        let mut accepted = 0;
        for event in events {
            if self.enqueue(event) {
                accepted += 1;
            }
        }
        accepted
    }

    pub fn dequeue_one(&mut self) -> Option<Event> {
        self.items.pop_front()
    }

    /// Remove and return up to `n` events from the front, in FIFO order.
    /// Never blocks; returns whatever is immediately available.
    pub fn dequeue_batch(&mut self, n: usize) -> Vec<Event> {
        let take = n.min(self.items.len());
        self.items.drain(..take).collect()
    }

    pub fn peek(&self) -> Option<&Event> {
        self.items.front()
    }

    pub fn peek_batch(&self, n: usize) -> Vec<&Event> {
        self.items.iter().take(n).collect()
    }

    /// Reinsert a single event at the head. Used only for failed-batch
    /// rollback; same capacity-rejection semantics as [`enqueue`](Self::enqueue).
    pub fn requeue_front(&mut self, event: Event) -> bool {
        if self.is_full() {
            self.reject(event);
            return false;
        }
        self.items.push_front(event);
        true
    }

    /// Reinsert events at the head, preserving their relative order:
    /// requeueing `[a, b, c]` yields a queue starting `a, b, c, <previous
    /// front>...`. Events that do not fit are rejected in input order.
    pub fn requeue_many_front(&mut self, events: Vec<Event>) -> usize {
        let room = self.remaining_capacity();
        let mut accepted = 0;
        let mut front = Vec::new();
        for event in events {
            if accepted < room {
                front.push(event);
                accepted += 1;
            } else {
                self.reject(event);
            }
        }
        for event in front.into_iter().rev() {
            self.items.push_front(event);
        }
        accepted
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|event| event.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Release all held entries.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    fn reject(&self, event: Event) {
        warn!(event_id = %event.id, event_name = %event.name, "queue full, dropping event");
        if let Some(hook) = &self.on_drop {
            hook(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(name: &str) -> Event {
        Event::new(name.to_string(), Map::new(), None)
    }

    fn names(queue: &mut BoundedQueue) -> Vec<String> {
        queue
            .dequeue_batch(queue.len())
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    #[test]
    fn test_fifo_order_preserved() {
        let mut queue = BoundedQueue::new(10);
        for name in ["a", "b", "c", "d"] {
            assert!(queue.enqueue(event(name)));
        }
        assert_eq!(names(&mut queue), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_enqueue_beyond_capacity_rejects_newest() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = dropped.clone();
        let mut queue = BoundedQueue::with_drop_hook(
            2,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(queue.enqueue(event("a")));
        assert!(queue.enqueue(event("b")));
        assert!(!queue.enqueue(event("c")));
        assert_eq!(queue.len(), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(names(&mut queue), vec!["a", "b"]);
    }

    #[test]
    fn test_enqueue_many_partial_acceptance() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = dropped.clone();
        let mut queue = BoundedQueue::with_drop_hook(
            3,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let accepted =
            queue.enqueue_many(vec![event("a"), event("b"), event("c"), event("d"), event("e")]);
        assert_eq!(accepted, 3);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert_eq!(names(&mut queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_requeue_many_front_preserves_relative_order() {
        let mut queue = BoundedQueue::new(10);
        queue.enqueue(event("x"));
        queue.enqueue(event("y"));

        queue.requeue_many_front(vec![event("a"), event("b"), event("c")]);
        assert_eq!(names(&mut queue), vec!["a", "b", "c", "x", "y"]);
    }

    #[test]
    fn test_requeue_front_single() {
        let mut queue = BoundedQueue::new(10);
        queue.enqueue(event("x"));
        queue.requeue_front(event("a"));
        assert_eq!(names(&mut queue), vec!["a", "x"]);
    }

    #[test]
    fn test_requeue_respects_capacity() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = dropped.clone();
        let mut queue = BoundedQueue::with_drop_hook(
            3,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        queue.enqueue(event("x"));
        queue.enqueue(event("y"));

        let accepted = queue.requeue_many_front(vec![event("a"), event("b")]);
        assert_eq!(accepted, 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(names(&mut queue), vec!["a", "x", "y"]);
    }

    #[test]
    fn test_dequeue_batch_never_blocks() {
        let mut queue = BoundedQueue::new(5);
        assert!(queue.dequeue_batch(3).is_empty());

        queue.enqueue(event("a"));
        queue.enqueue(event("b"));
        let batch = queue.dequeue_batch(10);
        assert_eq!(batch.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_peek_is_non_destructive() {
        let mut queue = BoundedQueue::new(5);
        queue.enqueue(event("a"));
        queue.enqueue(event("b"));

        assert_eq!(queue.peek().unwrap().name, "a");
        assert_eq!(queue.peek_batch(2).len(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_size_queries() {
        let mut queue = BoundedQueue::new(2);
        assert!(queue.is_empty());
        assert_eq!(queue.remaining_capacity(), 2);

        queue.enqueue(event("a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.remaining_capacity(), 1);
        assert!(!queue.is_full());

        queue.enqueue(event("b"));
        assert!(queue.is_full());
        assert_eq!(queue.remaining_capacity(), 0);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    fn test_reject_then_retry_after_drain() {
        // Capacity 2: A, B accepted; C rejected; drain; C accepted afterwards.
        let dropped = Arc::new(AtomicUsize::new(0));
        let counter = dropped.clone();
        let mut queue = BoundedQueue::with_drop_hook(
            2,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(queue.enqueue(event("a")));
        assert!(queue.enqueue(event("b")));
        assert!(!queue.enqueue(event("c")));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        let batch = queue.dequeue_batch(2);
        assert_eq!(batch.len(), 2);
        assert!(queue.is_empty());

        assert!(queue.enqueue(event("c")));
        assert_eq!(queue.len(), 1);
    }
}
