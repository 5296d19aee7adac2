//! Fixed-capacity containers used for room bookkeeping
//!
//! Both containers live entirely inline and never grow:
//! - [`RingBuffer`] is a FIFO that evicts its oldest entry when full
//! - [`SlotArena`] hands out stable indices and tracks which ones are occupied

use std::array;

/// Bounded FIFO queue that drops the oldest entry instead of blocking
#[derive(Debug, Clone)]
pub struct RingBuffer<T, const N: usize> {
    items: [Option<T>; N],
    head: usize,
    len: usize,
}

impl<T, const N: usize> RingBuffer<T, N> {
    pub fn new() -> Self {
        Self {
            items: array::from_fn(|_| None),
            head: 0,
            len: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// Appends an item, returning the evicted oldest item if the buffer was full
    pub fn push(&mut self, item: T) -> Option<T> {
        if N == 0 {
            return Some(item);
        }

        let evicted = if self.is_full() {
            let old = self.items[self.head].take();
            self.head = (self.head + 1) % N;
            self.len -= 1;
            old
        } else {
            None
        };

        let tail = (self.head + self.len) % N;
        self.items[tail] = Some(item);
        self.len += 1;
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let item = self.items[self.head].take();
        self.head = (self.head + 1) % N;
        self.len -= 1;
        item
    }

    pub fn front(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            self.items[self.head].as_ref()
        }
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }

    /// Iterates from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.items[(self.head + i) % N].as_ref())
    }
}

impl<T, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed array of slots whose indices stay stable while occupied
#[derive(Debug, Clone)]
pub struct SlotArena<T, const N: usize> {
    slots: [Option<T>; N],
    len: usize,
}

impl<T, const N: usize> SlotArena<T, N> {
    pub fn new() -> Self {
        Self {
            slots: array::from_fn(|_| None),
            len: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// Stores the value in the lowest free slot and returns that slot's index
    pub fn insert(&mut self, value: T) -> Option<usize> {
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(value);
        self.len += 1;
        Some(index)
    }

    /// Stores the value at a specific slot, returning what was there.
    /// Out-of-range indices hand the value back as `Err`.
    pub fn insert_at(&mut self, index: usize, value: T) -> Result<Option<T>, T> {
        let Some(slot) = self.slots.get_mut(index) else {
            return Err(value);
        };
        let previous = slot.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        Ok(previous)
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take()?;
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|value| (i, value)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|value| (i, value)))
    }
}

impl<T, const N: usize> Default for SlotArena<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
