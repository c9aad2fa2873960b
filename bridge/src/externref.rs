//! External reference table.
//!
//! The module cannot hold host values, only integers. This table maps small
//! integer handles to host values. Handles 0-3 are reserved for undefined,
//! null, true and false so the most common values never need a slot.
//!
//! Supports O(1) allocation (via free list), O(1) lookup by handle,
//! and O(1) deallocation. Freed slots are tombstoned, so a freed handle
//! can never observe the value it used to hold.

use alloc::vec::Vec;

use crate::value::HostValue;
use crate::{BridgeError, BridgeResult};

/// Index into the [`ExternrefTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    /// `undefined`; doubles as "no value".
    pub const UNDEFINED: Handle = Handle(0);
    /// `null`.
    pub const NULL: Handle = Handle(1);
    /// `true`.
    pub const TRUE: Handle = Handle(2);
    /// `false`.
    pub const FALSE: Handle = Handle(3);

    /// Number of reserved handles.
    pub const RESERVED: u32 = 4;

    /// Raw u32 value for passing to the module.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Reconstruct from a module i32/u32 value.
    pub fn from_u32(v: u32) -> Self {
        Self(v)
    }

    /// Whether this handle means "no value".
    pub fn is_none(self) -> bool {
        self == Handle::UNDEFINED
    }

    /// Whether this is one of the pre-populated sentinel handles.
    pub fn is_reserved(self) -> bool {
        self.0 < Self::RESERVED
    }
}

enum Slot {
    Occupied(HostValue),
    Vacant,
}

/// Growable table of host values indexed by [`Handle`].
pub struct ExternrefTable {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    grow_chunk: u32,
    checked: bool,
}

impl ExternrefTable {
    /// Create a table with the reserved sentinels in place.
    pub fn new(grow_chunk: u32, checked: bool) -> Self {
        let mut slots = Vec::with_capacity(grow_chunk.max(Handle::RESERVED) as usize);
        slots.push(Slot::Occupied(HostValue::Undefined));
        slots.push(Slot::Occupied(HostValue::Null));
        slots.push(Slot::Occupied(HostValue::Bool(true)));
        slots.push(Slot::Occupied(HostValue::Bool(false)));
        Self {
            slots,
            free_list: Vec::new(),
            grow_chunk: grow_chunk.max(1),
            checked,
        }
    }

    /// Store a value in a fresh slot and return its handle.
    ///
    /// Reuses the most recently freed slot first.
    pub fn alloc(&mut self, value: HostValue) -> Handle {
        if let Some(index) = self.free_list.pop() {
            self.slots[index as usize] = Slot::Occupied(value);
            log::trace!("externref alloc {} (reused)", index);
            return Handle(index);
        }

        if self.slots.len() == self.slots.capacity() {
            self.slots.reserve_exact(self.grow_chunk as usize);
            log::debug!(
                "externref table grown to {} slots",
                self.slots.capacity()
            );
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied(value));
        log::trace!("externref alloc {}", index);
        Handle(index)
    }

    /// Like [`alloc`](Self::alloc), but sentinel values map to their
    /// reserved handles without taking a slot.
    pub fn insert(&mut self, value: HostValue) -> Handle {
        match value {
            HostValue::Undefined => Handle::UNDEFINED,
            HostValue::Null => Handle::NULL,
            HostValue::Bool(true) => Handle::TRUE,
            HostValue::Bool(false) => Handle::FALSE,
            other => self.alloc(other),
        }
    }

    /// Read the value behind a handle. The slot stays allocated.
    pub fn resolve(&self, handle: Handle) -> BridgeResult<HostValue> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Occupied(value)) => Ok(value.clone()),
            _ => self.stale(handle).map(|_| HostValue::Undefined),
        }
    }

    /// Read the value and free the slot in one step.
    pub fn take(&mut self, handle: Handle) -> BridgeResult<HostValue> {
        let value = self.resolve(handle)?;
        self.free(handle)?;
        Ok(value)
    }

    /// Release a handle. Reserved handles are never freed.
    pub fn free(&mut self, handle: Handle) -> BridgeResult<()> {
        if handle.is_reserved() {
            return Ok(());
        }
        let index = handle.0 as usize;
        if !matches!(self.slots.get(index), Some(Slot::Occupied(_))) {
            return self.stale(handle);
        }
        self.slots[index] = Slot::Vacant;
        self.free_list.push(handle.0);
        log::trace!("externref free {}", handle.0);
        Ok(())
    }

    /// Whether the handle currently names a live slot.
    pub fn contains(&self, handle: Handle) -> bool {
        matches!(self.slots.get(handle.0 as usize), Some(Slot::Occupied(_)))
    }

    /// Number of live, non-reserved entries.
    pub fn len(&self) -> usize {
        self.slots.len() - Handle::RESERVED as usize - self.free_list.len()
    }

    /// Whether no non-reserved entries are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    fn stale(&self, handle: Handle) -> BridgeResult<()> {
        if self.checked {
            log::warn!("use of stale externref handle {}", handle.0);
            Err(BridgeError::StaleHandle(handle.0))
        } else {
            Ok(())
        }
    }
}
