//! Bounded FIFO of payloads waiting for the TCP connection.

use std::collections::VecDeque;

/// Ordered buffer of normalized lines with a hard capacity.
///
/// A full queue hands the rejected line back to the caller instead of
/// dropping it, so overflow is always visible to the owning connection.
#[derive(Debug)]
pub struct PendingQueue {
    items: VecDeque<String>,
    capacity: usize,
}

impl PendingQueue {
    /// Create an empty queue holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            // Most sessions queue a handful of lines at most
            items: VecDeque::with_capacity(capacity.min(16)),
            capacity,
        }
    }

    /// Append `line` at the back.
    ///
    /// # Errors
    ///
    /// Returns the line unchanged if the queue already holds `capacity` lines.
    pub fn push(&mut self, line: String) -> Result<(), String> {
        if self.is_full() {
            return Err(line);
        }
        self.items.push_back(line);
        Ok(())
    }

    /// Remove the oldest line.
    pub fn pop(&mut self) -> Option<String> {
        self.items.pop_front()
    }

    /// Number of queued lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True if the next push would be rejected.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard every queued line.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
