//! In-memory buffering for log entries and spans awaiting the next flush

use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Bounded buffer that drops its oldest entry on overflow
#[derive(Debug)]
pub struct BoundedBuffer<T> {
    items: RwLock<VecDeque<T>>,
    max_size: usize,
    label: &'static str,
}

impl<T> BoundedBuffer<T> {
    pub fn new(label: &'static str, max_size: usize) -> Self {
        Self {
            items: RwLock::new(VecDeque::new()),
            max_size: max_size.max(1),
            label,
        }
    }

    /// Add an item; returns `true` when an older item was dropped to make room
    pub async fn push(&self, item: T) -> bool {
        let mut items = self.items.write().await;

        let overflowed = if items.len() >= self.max_size {
            items.pop_front();
            warn!("{} buffer overflow, dropping oldest entry", self.label);
            true
        } else {
            false
        };

        items.push_back(item);
        overflowed
    }

    /// Take everything currently buffered
    pub async fn drain(&self) -> Vec<T> {
        let mut items = self.items.write().await;
        let drained: Vec<T> = items.drain(..).collect();
        if !drained.is_empty() {
            debug!("Drained {} {} entries", drained.len(), self.label);
        }
        drained
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

/// Split `items` into chunks of at most `size`
pub fn chunked<T>(mut items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    while items.len() > size {
        let rest = items.split_off(size);
        chunks.push(items);
        items = rest;
    }
    if !items.is_empty() {
        chunks.push(items);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_buffer_operations() {
        let buffer = BoundedBuffer::new("test", 10);
        assert!(!buffer.push(1).await);
        assert!(!buffer.push(2).await);
        assert_eq!(buffer.len().await, 2);

        assert_eq!(buffer.drain().await, vec![1, 2]);
        assert!(buffer.is_empty().await);
        assert!(buffer.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_buffer_overflow() {
        let buffer = BoundedBuffer::new("test", 2);
        let mut dropped = 0;
        for i in 0..5 {
            if buffer.push(i).await {
                dropped += 1;
            }
        }

        assert_eq!(dropped, 3);
        assert_eq!(buffer.drain().await, vec![3, 4]);
    }

    #[test]
    fn test_chunked() {
        assert_eq!(chunked(vec![1, 2, 3, 4, 5], 2), vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(chunked(vec![1, 2], 2), vec![vec![1, 2]]);
        assert!(chunked(Vec::<u8>::new(), 3).is_empty());
    }
}
