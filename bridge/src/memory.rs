//! WASM linear memory as observed by the bridge.
//!
//! The module runtime owns the memory; the bridge only reads and writes it
//! through views. Storage lives in a shared [`MemoryBuffer`]. Growing the
//! memory moves the contents into a fresh buffer and detaches the old one,
//! so anything still holding the old buffer sees a zero-length region and
//! knows it must re-sync.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, Ref, RefCell, RefMut};

use crate::{BridgeError, BridgeResult};

/// Page size in bytes (64 KB).
pub const PAGE_SIZE: usize = 65536;

/// Maximum number of pages addressable with 32-bit pointers.
pub const MAX_PAGES: u32 = 65536;

/// Backing store of a linear memory.
///
/// Identity matters: two views over the same memory are only in sync if
/// they point at the same `MemoryBuffer`.
#[derive(Debug)]
pub struct MemoryBuffer {
    bytes: RefCell<Vec<u8>>,
    detached: Cell<bool>,
}

impl MemoryBuffer {
    fn from_vec(bytes: Vec<u8>) -> Rc<Self> {
        Rc::new(MemoryBuffer {
            bytes: RefCell::new(bytes),
            detached: Cell::new(false),
        })
    }

    /// Current length in bytes. Zero once detached.
    pub fn byte_len(&self) -> usize {
        self.bytes.borrow().len()
    }

    /// Whether the buffer was replaced or invalidated.
    pub fn is_detached(&self) -> bool {
        self.detached.get()
    }

    pub(crate) fn bytes(&self) -> Ref<'_, Vec<u8>> {
        self.bytes.borrow()
    }

    pub(crate) fn bytes_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.bytes.borrow_mut()
    }

    /// Take the contents out, leaving this buffer empty and detached.
    fn detach(&self) -> Vec<u8> {
        self.detached.set(true);
        core::mem::take(&mut *self.bytes.borrow_mut())
    }
}

/// Linear memory for a WASM instance.
#[derive(Debug)]
pub struct LinearMemory {
    /// Current backing buffer.
    buffer: Rc<MemoryBuffer>,

    /// Current size in pages.
    current_pages: u32,

    /// Maximum size in pages (if specified).
    max_pages: Option<u32>,
}

impl LinearMemory {
    /// Create a new linear memory.
    pub fn new(initial_pages: u32, max_pages: Option<u32>) -> BridgeResult<Self> {
        if initial_pages > MAX_PAGES {
            return Err(BridgeError::MemoryGrow(
                "Initial memory size exceeds maximum".into(),
            ));
        }

        if let Some(max) = max_pages {
            if max > MAX_PAGES {
                return Err(BridgeError::MemoryGrow(
                    "Maximum memory size exceeds limit".into(),
                ));
            }
            if initial_pages > max {
                return Err(BridgeError::MemoryGrow(
                    "Initial pages exceeds maximum pages".into(),
                ));
            }
        }

        let mut data = Vec::new();
        data.resize(initial_pages as usize * PAGE_SIZE, 0);

        Ok(LinearMemory {
            buffer: MemoryBuffer::from_vec(data),
            current_pages: initial_pages,
            max_pages,
        })
    }

    /// Get the current size in bytes.
    pub fn size(&self) -> usize {
        self.buffer.byte_len()
    }

    /// Get the current size in pages.
    pub fn pages(&self) -> u32 {
        self.current_pages
    }

    /// Get the maximum size in pages.
    pub fn max_pages(&self) -> Option<u32> {
        self.max_pages
    }

    /// The buffer currently backing this memory.
    pub fn buffer(&self) -> &Rc<MemoryBuffer> {
        &self.buffer
    }

    /// Grow memory by the specified number of pages.
    ///
    /// Always installs a new buffer, even for a zero delta. Returns the
    /// previous size in pages.
    pub fn grow(&mut self, delta_pages: u32) -> BridgeResult<u32> {
        let new_pages = self
            .current_pages
            .checked_add(delta_pages)
            .ok_or_else(|| BridgeError::MemoryGrow("Page count overflow".into()))?;

        if new_pages > self.max_pages.unwrap_or(MAX_PAGES) {
            return Err(BridgeError::MemoryGrow(
                "Would exceed maximum memory size".into(),
            ));
        }

        let old_pages = self.current_pages;
        let mut data = self.buffer.detach();
        data.resize(new_pages as usize * PAGE_SIZE, 0);
        self.buffer = MemoryBuffer::from_vec(data);
        self.current_pages = new_pages;

        log::debug!("linear memory grew {} -> {} pages", old_pages, new_pages);
        Ok(old_pages)
    }

    /// Detach the current buffer and re-home the contents in a new one.
    ///
    /// Size is unchanged; only buffer identity moves, as when the embedder
    /// transfers the underlying storage.
    pub fn detach(&mut self) {
        let data = self.buffer.detach();
        self.buffer = MemoryBuffer::from_vec(data);
        log::trace!("linear memory buffer detached");
    }

    /// Read bytes from memory.
    pub fn read_bytes(&self, offset: usize, len: usize) -> BridgeResult<Vec<u8>> {
        self.check_bounds(offset, len)?;
        Ok(self.buffer.bytes()[offset..offset + len].to_vec())
    }

    /// Write bytes to memory.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> BridgeResult<()> {
        self.check_bounds(offset, bytes.len())?;
        self.buffer.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a u32 from memory (little-endian).
    pub fn read_u32(&self, offset: usize) -> BridgeResult<u32> {
        self.check_bounds(offset, 4)?;
        let data = self.buffer.bytes();
        Ok(u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]))
    }

    /// Write a u32 to memory (little-endian).
    pub fn write_u32(&mut self, offset: usize, value: u32) -> BridgeResult<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Copy within memory.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) -> BridgeResult<()> {
        self.check_bounds(src, len)?;
        self.check_bounds(dst, len)?;
        self.buffer.bytes_mut().copy_within(src..src + len, dst);
        Ok(())
    }

    /// Check if an access is within bounds.
    fn check_bounds(&self, offset: usize, len: usize) -> BridgeResult<()> {
        let end = offset
            .checked_add(len)
            .ok_or(BridgeError::MemoryOutOfBounds)?;

        if end > self.size() {
            return Err(BridgeError::MemoryOutOfBounds);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_memory_is_zeroed() {
        let mem = LinearMemory::new(1, Some(4)).unwrap();
        assert_eq!(mem.size(), PAGE_SIZE);
        assert_eq!(mem.pages(), 1);
        assert_eq!(mem.read_u32(128).unwrap(), 0);
    }

    #[test]
    fn initial_above_max_rejected() {
        assert!(LinearMemory::new(3, Some(2)).is_err());
    }

    #[test]
    fn grow_replaces_buffer_and_keeps_contents() {
        let mut mem = LinearMemory::new(1, None).unwrap();
        mem.write_u32(64, 0xCAFE_BABE).unwrap();
        let old = Rc::clone(mem.buffer());

        assert_eq!(mem.grow(2).unwrap(), 1);
        assert_eq!(mem.pages(), 3);
        assert_eq!(mem.size(), 3 * PAGE_SIZE);
        assert_eq!(mem.read_u32(64).unwrap(), 0xCAFE_BABE);

        assert!(old.is_detached());
        assert_eq!(old.byte_len(), 0);
        assert!(!Rc::ptr_eq(&old, mem.buffer()));
    }

    #[test]
    fn grow_past_max_fails_without_detaching() {
        let mut mem = LinearMemory::new(1, Some(1)).unwrap();
        let old = Rc::clone(mem.buffer());
        assert!(mem.grow(1).is_err());
        assert!(!old.is_detached());
        assert!(Rc::ptr_eq(&old, mem.buffer()));
    }

    #[test]
    fn detach_moves_identity_only() {
        let mut mem = LinearMemory::new(1, None).unwrap();
        mem.write_bytes(10, b"abc").unwrap();
        let old = Rc::clone(mem.buffer());
        mem.detach();
        assert!(old.is_detached());
        assert_eq!(mem.size(), PAGE_SIZE);
        assert_eq!(mem.read_bytes(10, 3).unwrap(), b"abc");
    }

    #[test]
    fn out_of_bounds_access() {
        let mut mem = LinearMemory::new(1, None).unwrap();
        assert_eq!(mem.read_u32(PAGE_SIZE - 2), Err(BridgeError::MemoryOutOfBounds));
        assert!(mem.write_bytes(usize::MAX, &[1]).is_err());
    }
}
