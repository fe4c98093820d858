//! Fixed-capacity byte queue used by the console plumbing.

/// Number of slots in a [`Fifo`].
pub const FIFO_SIZE: usize = 256;

/// A bounded FIFO of words.
///
/// Producers that hit a full queue get their value back unchanged; the
/// emulated UARTs report overruns through their own status bits instead.
pub struct Fifo {
    buf: [u64; FIFO_SIZE],
    head: usize,
    tail: usize,
    used: usize,
}

impl Fifo {
    pub const fn new() -> Self {
        Self {
            buf: [0; FIFO_SIZE],
            head: 0,
            tail: 0,
            used: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == FIFO_SIZE
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.used
    }

    /// Queue a value. Returns it back when the queue is full.
    pub fn push(&mut self, val: u64) -> Result<(), u64> {
        if self.is_full() {
            return Err(val);
        }
        self.buf[self.tail] = val;
        self.tail = (self.tail + 1) % FIFO_SIZE;
        self.used += 1;
        Ok(())
    }

    /// Dequeue the oldest value.
    pub fn pop(&mut self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        let val = self.buf[self.head];
        self.head = (self.head + 1) % FIFO_SIZE;
        self.used -= 1;
        Some(val)
    }

    /// Oldest value without dequeueing it.
    pub fn peek(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.buf[self.head])
        }
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.used = 0;
    }
}

impl Default for Fifo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut f = Fifo::new();
        assert!(f.is_empty());
        assert_eq!(f.pop(), None);
        f.push(1).unwrap();
        f.push(2).unwrap();
        f.push(3).unwrap();
        assert_eq!(f.len(), 3);
        assert_eq!(f.peek(), Some(1));
        assert_eq!(f.pop(), Some(1));
        assert_eq!(f.pop(), Some(2));
        assert_eq!(f.pop(), Some(3));
        assert!(f.is_empty());
    }

    #[test]
    fn full_queue_rejects() {
        let mut f = Fifo::new();
        for i in 0..FIFO_SIZE as u64 {
            f.push(i).unwrap();
        }
        assert!(f.is_full());
        assert_eq!(f.push(999), Err(999));
        assert_eq!(f.pop(), Some(0));
        f.push(999).unwrap();
    }

    #[test]
    fn wraps_around_many_times() {
        let mut f = Fifo::new();
        for round in 0..5u64 {
            for i in 0..FIFO_SIZE as u64 {
                f.push(round * 1000 + i).unwrap();
            }
            for i in 0..FIFO_SIZE as u64 {
                assert_eq!(f.pop(), Some(round * 1000 + i));
            }
        }
    }

    #[test]
    fn clear_resets() {
        let mut f = Fifo::new();
        f.push(7).unwrap();
        f.clear();
        assert!(f.is_empty());
        assert_eq!(f.pop(), None);
    }
}
