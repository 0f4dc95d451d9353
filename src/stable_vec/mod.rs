//! A vector whose indices stay valid until the element behind them is removed.
//!
//! Removed slots are threaded onto an intrusive free list and handed out again by the next
//! [`StableVec::push()`], so both insertion and removal are `O(1)` and storage never shrinks.

use std::ops::{Index, IndexMut};


#[derive(Clone, Debug)]
enum Slot<T> {
    Active(T),
    Free { next_free: Option<usize> },
}

#[derive(Clone, Debug)]
pub struct StableVec<T> {
    slots: Vec<Slot<T>>,
    first_free: Option<usize>,
    active: usize,
}

impl<T> Default for StableVec<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            first_free: None,
            active: 0,
        }
    }
}

impl<T> StableVec<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` and returns its index.
    ///
    /// The most recently removed slot is reused first; only when the free list is empty does the
    /// backing storage grow.
    pub fn push(&mut self, value: T) -> usize {
        self.active += 1;

        match self.first_free {
            Some(index) => {
                let next_free = match self.slots[index] {
                    Slot::Free { next_free } => next_free,
                    Slot::Active(_) => unreachable!("free list points at an active slot {index}"),
                };
                self.slots[index] = Slot::Active(value);
                self.first_free = next_free;
                index
            }
            None => {
                self.slots.push(Slot::Active(value));
                self.slots.len() - 1
            }
        }
    }

    /// Removes the element at `index` and puts its slot at the head of the free list.
    ///
    /// Returns [`None`] without touching the free list when `index` is out of range or already
    /// removed.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if !self.is_active(index) {
            return None;
        }

        let slot = std::mem::replace(
            &mut self.slots[index],
            Slot::Free {
                next_free: self.first_free,
            },
        );
        self.first_free = Some(index);
        self.active -= 1;

        match slot {
            Slot::Active(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        match self.slots.get(index)? {
            Slot::Active(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        match self.slots.get_mut(index)? {
            Slot::Active(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Number of slots ever handed out, live or free.
    pub fn total_len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_active(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Slot::Active(_)))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.first_free = None;
        self.active = 0;
    }

    /// Live elements in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Active(value) => Some((index, value)),
                Slot::Free { .. } => None,
            })
    }

    /// Indices of the live elements in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.iter().map(|(index, _)| index)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Active(value) => Some((index, value)),
                Slot::Free { .. } => None,
            })
    }
}

impl<T> Index<usize> for StableVec<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!("StableVec index {index} is not active"),
        }
    }
}

impl<T> IndexMut<usize> for StableVec<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        match self.get_mut(index) {
            Some(value) => value,
            None => panic!("StableVec index {index} is not active"),
        }
    }
}
