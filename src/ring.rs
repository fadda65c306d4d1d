// ===============================
// src/ring.rs
// ===============================
use std::collections::VecDeque;

/// Fixed-capacity buffer of the most recent items; the oldest is evicted on push.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: VecDeque<T>,
    cap: usize,
    total_pushed: u64,
}

impl<T> RingBuffer<T> {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { buf: VecDeque::with_capacity(cap), cap, total_pushed: 0 }
    }

    /// Push, returning the evicted item when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.buf.len() == self.cap { self.buf.pop_front() } else { None };
        self.buf.push_back(item);
        self.total_pushed += 1;
        evicted
    }

    pub fn len(&self) -> usize { self.buf.len() }
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }
    pub fn is_full(&self) -> bool { self.buf.len() == self.cap }
    pub fn capacity(&self) -> usize { self.cap }

    /// Monotonic count of everything ever pushed; unaffected by eviction.
    pub fn total_pushed(&self) -> u64 { self.total_pushed }

    pub fn latest(&self) -> Option<&T> { self.buf.back() }
    pub fn oldest(&self) -> Option<&T> { self.buf.front() }

    pub fn iter(&self) -> impl Iterator<Item = &T> { self.buf.iter() }

    pub fn clear(&mut self) { self.buf.clear(); }
}

impl<T: Clone> RingBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> { self.buf.iter().cloned().collect() }

    /// Last `n` items, oldest first.
    pub fn tail(&self, n: usize) -> Vec<T> {
        let skip = self.buf.len().saturating_sub(n);
        self.buf.iter().skip(skip).cloned().collect()
    }
}
