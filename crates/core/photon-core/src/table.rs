//! Fixed-capacity slot tables for kernel objects.
//!
//! Control blocks live in a table whose index doubles as the object's
//! identifier. Freed slots are reused lowest-first.

use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::error::KernelError;

/// Identifier types that name a table slot.
pub(crate) trait ObjectId: Copy {
    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
}

pub(crate) struct Table<I, T> {
    slots: Vec<Option<T>>,
    capacity: usize,
    _id: PhantomData<I>,
}

impl<I: ObjectId, T> Table<I, T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
            _id: PhantomData,
        }
    }

    /// Stores the value built by `make` in the lowest free slot.
    pub(crate) fn insert_with(&mut self, make: impl FnOnce(I) -> T) -> Result<I, KernelError> {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(KernelError::NoResources),
        };
        let id = I::from_index(index);
        self.slots[index] = Some(make(id));
        Ok(id)
    }

    pub(crate) fn get(&self, id: I) -> Option<&T> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: I) -> Option<&mut T> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn remove(&mut self, id: I) -> Option<T> {
        self.slots.get_mut(id.index()).and_then(Option::take)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (I, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (I::from_index(index), value)))
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}
