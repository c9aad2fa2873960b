//! Memoized views over linear memory.
//!
//! Building a view is cheap but not free, and the bridge touches memory on
//! almost every boundary call, so views are cached. A cached view is only
//! handed out after checking it still sits on the memory's current buffer:
//! a detached buffer, a zero-length buffer or a different buffer identity
//! all force a rebuild.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Ref, RefMut};

use crate::memory::{LinearMemory, MemoryBuffer};
use crate::{BridgeError, BridgeResult};

fn is_current(buffer: &Rc<MemoryBuffer>, memory: &LinearMemory) -> bool {
    !buffer.is_detached() && buffer.byte_len() != 0 && Rc::ptr_eq(buffer, memory.buffer())
}

fn byte_range(buffer: &MemoryBuffer, offset: u32, len: usize) -> BridgeResult<(usize, usize)> {
    let start = offset as usize;
    let end = start.checked_add(len).ok_or(BridgeError::MemoryOutOfBounds)?;
    if end > buffer.byte_len() {
        return Err(BridgeError::MemoryOutOfBounds);
    }
    Ok((start, end))
}

/// Byte-addressable view.
#[derive(Debug, Clone)]
pub struct ByteView {
    buffer: Rc<MemoryBuffer>,
}

impl ByteView {
    fn new(buffer: &Rc<MemoryBuffer>) -> Self {
        ByteView {
            buffer: Rc::clone(buffer),
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.buffer.byte_len()
    }

    /// Whether the view covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one byte.
    pub fn get(&self, ptr: u32) -> BridgeResult<u8> {
        let (start, _) = byte_range(&self.buffer, ptr, 1)?;
        Ok(self.buffer.bytes()[start])
    }

    /// Write one byte.
    pub fn set(&self, ptr: u32, value: u8) -> BridgeResult<()> {
        let (start, _) = byte_range(&self.buffer, ptr, 1)?;
        self.buffer.bytes_mut()[start] = value;
        Ok(())
    }

    /// Borrow `len` bytes starting at `ptr` without copying.
    pub fn subarray(&self, ptr: u32, len: usize) -> BridgeResult<Ref<'_, [u8]>> {
        let (start, end) = byte_range(&self.buffer, ptr, len)?;
        Ok(Ref::map(self.buffer.bytes(), |bytes| &bytes[start..end]))
    }

    /// Mutably borrow `len` bytes starting at `ptr`.
    pub fn subarray_mut(&self, ptr: u32, len: usize) -> BridgeResult<RefMut<'_, [u8]>> {
        let (start, end) = byte_range(&self.buffer, ptr, len)?;
        Ok(RefMut::map(self.buffer.bytes_mut(), |bytes| &mut bytes[start..end]))
    }

    /// Copy `bytes` into memory at `ptr`.
    pub fn write(&self, ptr: u32, bytes: &[u8]) -> BridgeResult<()> {
        let (start, end) = byte_range(&self.buffer, ptr, bytes.len())?;
        self.buffer.bytes_mut()[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

/// 32-bit word view. Indices are in words, not bytes.
#[derive(Debug, Clone)]
pub struct WordView {
    buffer: Rc<MemoryBuffer>,
}

impl WordView {
    fn new(buffer: &Rc<MemoryBuffer>) -> Self {
        WordView {
            buffer: Rc::clone(buffer),
        }
    }

    /// Length in whole words.
    pub fn len(&self) -> usize {
        self.buffer.byte_len() / 4
    }

    /// Whether the view covers no words.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the word at `index` (little-endian).
    pub fn get(&self, index: u32) -> BridgeResult<u32> {
        let offset = index.checked_mul(4).ok_or(BridgeError::MemoryOutOfBounds)?;
        let (start, end) = byte_range(&self.buffer, offset, 4)?;
        let bytes = self.buffer.bytes();
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[start..end]);
        Ok(u32::from_le_bytes(word))
    }

    /// Write the word at `index` (little-endian).
    pub fn set(&self, index: u32, value: u32) -> BridgeResult<()> {
        let offset = index.checked_mul(4).ok_or(BridgeError::MemoryOutOfBounds)?;
        let (start, end) = byte_range(&self.buffer, offset, 4)?;
        self.buffer.bytes_mut()[start..end].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy `len` words starting at word `index`.
    pub fn subarray(&self, index: u32, len: usize) -> BridgeResult<Vec<u32>> {
        let offset = index.checked_mul(4).ok_or(BridgeError::MemoryOutOfBounds)?;
        let byte_len = len.checked_mul(4).ok_or(BridgeError::MemoryOutOfBounds)?;
        let (start, end) = byte_range(&self.buffer, offset, byte_len)?;
        let bytes = self.buffer.bytes();
        Ok(bytes[start..end]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Mixed-width view with little-endian accessors at arbitrary byte offsets.
#[derive(Debug, Clone)]
pub struct DataView {
    buffer: Rc<MemoryBuffer>,
}

macro_rules! data_view_accessors {
    ($($get:ident / $set:ident: $ty:ty;)*) => {
        $(
            #[doc = concat!("Read a little-endian `", stringify!($ty), "`.")]
            pub fn $get(&self, offset: u32) -> BridgeResult<$ty> {
                let bytes = self.read_array::<{ core::mem::size_of::<$ty>() }>(offset)?;
                Ok(<$ty>::from_le_bytes(bytes))
            }

            #[doc = concat!("Write a little-endian `", stringify!($ty), "`.")]
            pub fn $set(&self, offset: u32, value: $ty) -> BridgeResult<()> {
                self.write_slice(offset, &value.to_le_bytes())
            }
        )*
    };
}

impl DataView {
    fn new(buffer: &Rc<MemoryBuffer>) -> Self {
        DataView {
            buffer: Rc::clone(buffer),
        }
    }

    /// Length in bytes.
    pub fn byte_len(&self) -> usize {
        self.buffer.byte_len()
    }

    fn read_array<const N: usize>(&self, offset: u32) -> BridgeResult<[u8; N]> {
        let (start, end) = byte_range(&self.buffer, offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer.bytes()[start..end]);
        Ok(out)
    }

    fn write_slice(&self, offset: u32, bytes: &[u8]) -> BridgeResult<()> {
        let (start, end) = byte_range(&self.buffer, offset, bytes.len())?;
        self.buffer.bytes_mut()[start..end].copy_from_slice(bytes);
        Ok(())
    }

    data_view_accessors! {
        get_u8 / set_u8: u8;
        get_i8 / set_i8: i8;
        get_u16 / set_u16: u16;
        get_i16 / set_i16: i16;
        get_u32 / set_u32: u32;
        get_i32 / set_i32: i32;
        get_u64 / set_u64: u64;
        get_i64 / set_i64: i64;
        get_f32 / set_f32: f32;
        get_f64 / set_f64: f64;
    }
}

/// Cache of the three view kinds over one linear memory.
#[derive(Debug, Default)]
pub struct ViewCache {
    bytes: Option<ByteView>,
    words: Option<WordView>,
    data: Option<DataView>,
    rebuilds: u64,
}

impl ViewCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live byte view over `memory`.
    pub fn bytes(&mut self, memory: &LinearMemory) -> &ByteView {
        if !self.bytes.as_ref().is_some_and(|v| is_current(&v.buffer, memory)) {
            self.note_rebuild("byte", memory);
            self.bytes = None;
        }
        self.bytes.get_or_insert_with(|| ByteView::new(memory.buffer()))
    }

    /// Live word view over `memory`.
    pub fn words(&mut self, memory: &LinearMemory) -> &WordView {
        if !self.words.as_ref().is_some_and(|v| is_current(&v.buffer, memory)) {
            self.note_rebuild("word", memory);
            self.words = None;
        }
        self.words.get_or_insert_with(|| WordView::new(memory.buffer()))
    }

    /// Live data view over `memory`.
    pub fn data(&mut self, memory: &LinearMemory) -> &DataView {
        if !self.data.as_ref().is_some_and(|v| is_current(&v.buffer, memory)) {
            self.note_rebuild("data", memory);
            self.data = None;
        }
        self.data.get_or_insert_with(|| DataView::new(memory.buffer()))
    }

    /// Drop every cached view.
    pub fn reset(&mut self) {
        self.bytes = None;
        self.words = None;
        self.data = None;
    }

    /// Number of views built so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    fn note_rebuild(&mut self, kind: &str, memory: &LinearMemory) {
        self.rebuilds += 1;
        log::trace!("rebuilding {} view over {} bytes", kind, memory.size());
    }
}
