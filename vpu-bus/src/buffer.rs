//! Caller-owned buffers and the per-session queues holding them.
//!
//! Queues are an arena of slots plus the live slot keys in insertion
//! order. Removing one entry by caller index or by DMA address leaves
//! the keys of every other entry valid.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use crate::hw::DmaAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Raw frames going into the encoder.
    Source,
    /// Bitstream buffers coming out of it.
    Destination,
}

impl Display for QueueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Source => f.write_str("source"),
            QueueKind::Destination => f.write_str("destination"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plane {
    pub addr: DmaAddr,
    pub size: u32,
}

/// A raw frame handed in by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceBuffer {
    pub index: u32,
    pub planes: Vec<Plane>,
    /// Presentation timestamp, copied to the bitstream produced from it.
    pub timestamp: u64,
}

impl SourceBuffer {
    pub fn new(index: u32, planes: Vec<Plane>, timestamp: u64) -> Self {
        Self {
            index,
            planes,
            timestamp,
        }
    }
}

/// A bitstream buffer handed in by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestinationBuffer {
    pub index: u32,
    pub addr: DmaAddr,
    pub size: u32,
}

pub trait Indexed {
    fn index(&self) -> u32;
}

impl Indexed for SourceBuffer {
    fn index(&self) -> u32 {
        self.index
    }
}

impl Indexed for DestinationBuffer {
    fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot<T> {
    pub buffer: T,
    /// Submitted to hardware and not completed yet.
    pub consumed: bool,
    pub sequence: u64,
}

/// Key of a live slot; stable until that slot is removed.
pub type SlotKey = usize;

#[derive(Debug)]
pub struct BufferQueue<T> {
    slots: Vec<Option<Slot<T>>>,
    order: VecDeque<SlotKey>,
    free: Vec<SlotKey>,
    next_sequence: u64,
}

impl<T> Default for BufferQueue<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            order: VecDeque::new(),
            free: Vec::new(),
            next_sequence: 0,
        }
    }
}

impl<T> BufferQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a buffer, returning its slot key and sequence number.
    pub fn push(&mut self, buffer: T) -> (SlotKey, u64) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let slot = Slot {
            buffer,
            consumed: false,
            sequence,
        };
        let key = match self.free.pop() {
            Some(key) => {
                self.slots[key] = Some(slot);
                key
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.order.push_back(key);
        (key, sequence)
    }

    pub fn get(&self, key: SlotKey) -> Option<&Slot<T>> {
        self.slots.get(key).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut Slot<T>> {
        self.slots.get_mut(key).and_then(|s| s.as_mut())
    }

    /// Oldest slot not yet handed to hardware.
    pub fn first_pending(&self) -> Option<SlotKey> {
        self.order
            .iter()
            .copied()
            .find(|&key| matches!(self.get(key), Some(slot) if !slot.consumed))
    }

    pub fn find<F>(&self, mut pred: F) -> Option<SlotKey>
    where
        F: FnMut(&T) -> bool,
    {
        self.order
            .iter()
            .copied()
            .find(|&key| matches!(self.get(key), Some(slot) if pred(&slot.buffer)))
    }

    pub fn mark_consumed(&mut self, key: SlotKey) {
        if let Some(slot) = self.get_mut(key) {
            slot.consumed = true;
        }
    }

    pub fn remove(&mut self, key: SlotKey) -> Option<Slot<T>> {
        let slot = self.slots.get_mut(key)?.take()?;
        self.order.retain(|&k| k != key);
        self.free.push(key);
        Some(slot)
    }

    pub fn pop_front(&mut self) -> Option<Slot<T>> {
        let key = *self.order.front()?;
        self.remove(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Slots owned by hardware.
    pub fn consumed_count(&self) -> usize {
        self.iter().filter(|slot| slot.consumed).count()
    }

    pub fn pending_count(&self) -> usize {
        self.len() - self.consumed_count()
    }

    /// Live slots in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Slot<T>> {
        self.order.iter().filter_map(|&key| self.get(key))
    }
}

impl<T: Indexed> BufferQueue<T> {
    pub fn find_index(&self, index: u32) -> Option<SlotKey> {
        self.find(|b| b.index() == index)
    }

    pub fn contains_index(&self, index: u32) -> bool {
        self.find_index(index).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dst(index: u32, addr: DmaAddr) -> DestinationBuffer {
        DestinationBuffer {
            index,
            addr,
            size: 4096,
        }
    }

    #[test]
    fn fifo_order_and_sequence() {
        let mut q = BufferQueue::new();
        let (_, s0) = q.push(dst(0, 0x1000));
        let (_, s1) = q.push(dst(1, 0x2000));
        assert_eq!((s0, s1), (0, 1));
        let first = q.first_pending().unwrap();
        assert_eq!(q.get(first).unwrap().buffer.index, 0);
    }

    #[test]
    fn consumed_slots_are_skipped() {
        let mut q = BufferQueue::new();
        let (a, _) = q.push(dst(0, 0x1000));
        let (b, _) = q.push(dst(1, 0x2000));
        q.mark_consumed(a);
        assert_eq!(q.first_pending(), Some(b));
        q.mark_consumed(b);
        assert_eq!(q.first_pending(), None);
        assert_eq!(q.consumed_count(), 2);
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn remove_from_middle_keeps_other_keys() {
        let mut q = BufferQueue::new();
        let (a, _) = q.push(dst(0, 0x1000));
        let (b, _) = q.push(dst(1, 0x2000));
        let (c, _) = q.push(dst(2, 0x3000));

        let removed = q.remove(b).unwrap();
        assert_eq!(removed.buffer.addr, 0x2000);
        assert_eq!(q.get(a).unwrap().buffer.index, 0);
        assert_eq!(q.get(c).unwrap().buffer.index, 2);
        assert!(q.remove(b).is_none());

        let order: Vec<u32> = q.iter().map(|s| s.buffer.index).collect();
        assert_eq!(order, vec![0, 2]);
    }

    #[test]
    fn freed_key_is_reused_at_back_of_order() {
        let mut q = BufferQueue::new();
        let (a, _) = q.push(dst(0, 0x1000));
        q.push(dst(1, 0x2000));
        q.remove(a);
        let (d, seq) = q.push(dst(3, 0x4000));
        assert_eq!(d, a);
        assert_eq!(seq, 2);
        let order: Vec<u32> = q.iter().map(|s| s.buffer.index).collect();
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn find_by_address_and_index() {
        let mut q = BufferQueue::new();
        q.push(dst(4, 0x1000));
        let (b, _) = q.push(dst(7, 0x2000));
        assert_eq!(q.find(|d| d.addr == 0x2000), Some(b));
        assert_eq!(q.find_index(7), Some(b));
        assert!(!q.contains_index(5));
        assert_eq!(q.find(|d| d.addr == 0x9000), None);
    }

    #[test]
    fn pop_front_drains_in_order() {
        let mut q = BufferQueue::new();
        for i in 0..3 {
            q.push(dst(i, 0x1000 * (i as u64 + 1)));
        }
        let drained: Vec<u32> = std::iter::from_fn(|| q.pop_front())
            .map(|s| s.buffer.index)
            .collect();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(q.is_empty());
    }
}
