use std::collections::VecDeque;

/// Interrupt status words captured between the interrupt firing and the
/// completion processor running.
#[derive(Debug)]
pub struct IrqFifo {
    words: VecDeque<u32>,
    capacity: usize,
    dropped: u64,
}

impl IrqFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Returns false when the FIFO is full and the word was dropped.
    pub fn push(&mut self, status: u32) -> bool {
        if self.words.len() >= self.capacity {
            self.dropped += 1;
            log::warn!(
                "irq fifo full ({} entries), dropping status {:#x}",
                self.capacity,
                status
            );
            return false;
        }
        self.words.push_back(status);
        true
    }

    pub fn pop(&mut self) -> Option<u32> {
        self.words.pop_front()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut fifo = IrqFifo::new(4);
        fifo.push(1);
        fifo.push(2);
        assert_eq!(fifo.pop(), Some(1));
        assert_eq!(fifo.pop(), Some(2));
        assert_eq!(fifo.pop(), None);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut fifo = IrqFifo::new(2);
        assert!(fifo.push(1));
        assert!(fifo.push(2));
        assert!(!fifo.push(3));
        assert_eq!(fifo.len(), 2);
        assert_eq!(fifo.dropped(), 1);
        assert_eq!(fifo.pop(), Some(1));
    }
}
