use std::collections::VecDeque;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("wait queue is empty")]
    Empty,
}

/// FIFO of commands waiting for a free worker slot.
#[derive(Debug)]
pub struct WaitQueue<T> {
    inner: VecDeque<T>,
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }
}

impl<T> WaitQueue<T> {
    pub fn enqueue(&mut self, item: T) {
        self.inner.push_back(item);
    }

    pub fn dequeue(&mut self) -> Result<T, QueueError> {
        self.inner.pop_front().ok_or(QueueError::Empty)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.inner.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let mut queue = WaitQueue::default();
        queue.enqueue("/A");
        queue.enqueue("/B");
        queue.enqueue("/C");

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap(), "/A");
        assert_eq!(queue.dequeue().unwrap(), "/B");
        assert_eq!(queue.dequeue().unwrap(), "/C");
        assert!(queue.is_empty());
    }

    #[test]
    fn dequeue_on_empty_returns_error() {
        let mut queue: WaitQueue<u32> = WaitQueue::default();
        assert!(matches!(queue.dequeue(), Err(QueueError::Empty)));
    }
}
