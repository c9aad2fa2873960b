//! Contract between the bridge and the module runtime.
//!
//! The runtime owns linear memory, the allocator and the function table.
//! The bridge calls into these; it never implements them. Function table
//! entries use a closed set of calling conventions so dispatch stays a
//! plain "index the table, match the shape, call" operation.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::abi::CoreValue;
use crate::bridge::Bridge;
use crate::closure::ClosureEnv;
use crate::memory::{LinearMemory, PAGE_SIZE};
use crate::{BridgeError, BridgeResult};

/// Module entry point, run once after the bridge is initialized.
pub type EntryFn = fn(&mut Bridge) -> BridgeResult<()>;

/// A function table slot.
///
/// Callbacks receive the captured environment pointer followed by their
/// arguments lowered to core values.
#[derive(Clone, Copy)]
pub enum TableEntry {
    /// Callback taking no arguments.
    Nullary(fn(&mut Bridge, u32) -> BridgeResult<()>),
    /// Callback taking one argument.
    Unary(fn(&mut Bridge, u32, CoreValue) -> BridgeResult<()>),
    /// Callback taking two arguments.
    Binary(fn(&mut Bridge, u32, CoreValue, CoreValue) -> BridgeResult<()>),
    /// Frees a closure's captured environment.
    Destructor(fn(&mut Bridge, ClosureEnv)),
}

impl TableEntry {
    /// Number of arguments a callback entry accepts. `None` for destructors.
    pub fn arity(&self) -> Option<usize> {
        match self {
            TableEntry::Nullary(_) => Some(0),
            TableEntry::Unary(_) => Some(1),
            TableEntry::Binary(_) => Some(2),
            TableEntry::Destructor(_) => None,
        }
    }
}

impl fmt::Debug for TableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableEntry::Nullary(_) => write!(f, "TableEntry::Nullary"),
            TableEntry::Unary(_) => write!(f, "TableEntry::Unary"),
            TableEntry::Binary(_) => write!(f, "TableEntry::Binary"),
            TableEntry::Destructor(_) => write!(f, "TableEntry::Destructor"),
        }
    }
}

/// Services a module runtime provides to the bridge.
pub trait ModuleRuntime {
    /// The module's linear memory.
    fn memory(&self) -> &LinearMemory;

    /// Mutable access to the module's linear memory.
    fn memory_mut(&mut self) -> &mut LinearMemory;

    /// Allocate `size` bytes aligned to `align`.
    fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32>;

    /// Resize an allocation, preserving its first `min(old_size, new_size)` bytes.
    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32)
        -> BridgeResult<u32>;

    /// Whether [`realloc`](Self::realloc) is available.
    fn has_realloc(&self) -> bool {
        true
    }

    /// Release an allocation.
    fn free(&mut self, ptr: u32, size: u32, align: u32);

    /// Look up a function table entry.
    fn function(&self, index: u32) -> Option<TableEntry>;

    /// The exported entry point, if any.
    fn entry_point(&self) -> Option<EntryFn> {
        None
    }
}

/// Simple vec-backed module runtime.
///
/// Bump allocator over a growable linear memory; the most recent allocation
/// can be resized or freed in place. Address 0 is never handed out.
pub struct BumpModule {
    memory: LinearMemory,
    next: u32,
    last: Option<(u32, u32)>,
    functions: Vec<Option<TableEntry>>,
    entry: Option<EntryFn>,
    realloc_enabled: bool,
}

impl BumpModule {
    /// Create a module with `initial_pages` of memory.
    pub fn new(initial_pages: u32) -> BridgeResult<Self> {
        Ok(BumpModule {
            memory: LinearMemory::new(initial_pages, None)?,
            next: 8,
            last: None,
            // Index 0 stays empty so it can mean "no function".
            functions: vec![None],
            entry: None,
            realloc_enabled: true,
        })
    }

    /// Set the entry point run by [`Bridge::start`].
    pub fn with_entry(mut self, entry: EntryFn) -> Self {
        self.entry = Some(entry);
        self
    }

    /// Pretend the module exports no reallocator.
    pub fn without_realloc(mut self) -> Self {
        self.realloc_enabled = false;
        self
    }

    /// Append a function table entry and return its index.
    pub fn add_function(&mut self, entry: TableEntry) -> u32 {
        self.functions.push(Some(entry));
        (self.functions.len() - 1) as u32
    }

    /// Current bump pointer.
    pub fn heap_top(&self) -> u32 {
        self.next
    }

    fn ensure(&mut self, end: u32) -> BridgeResult<()> {
        let needed = (end as usize).div_ceil(PAGE_SIZE) as u32;
        let pages = self.memory.pages();
        if needed > pages {
            self.memory
                .grow(needed - pages)
                .map_err(|_| BridgeError::AllocFailed)?;
        }
        Ok(())
    }
}

impl ModuleRuntime for BumpModule {
    fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut LinearMemory {
        &mut self.memory
    }

    fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32> {
        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(BridgeError::AllocFailed);
        }
        let aligned = self
            .next
            .checked_add(align - 1)
            .ok_or(BridgeError::AllocFailed)?
            & !(align - 1);
        let end = aligned.checked_add(size).ok_or(BridgeError::AllocFailed)?;
        self.ensure(end)?;
        self.next = end;
        self.last = Some((aligned, size));
        Ok(aligned)
    }

    fn realloc(
        &mut self,
        ptr: u32,
        old_size: u32,
        new_size: u32,
        align: u32,
    ) -> BridgeResult<u32> {
        if !self.realloc_enabled {
            return Err(BridgeError::AllocFailed);
        }
        if self.last == Some((ptr, old_size)) {
            let end = ptr.checked_add(new_size).ok_or(BridgeError::AllocFailed)?;
            self.ensure(end)?;
            self.next = end;
            self.last = Some((ptr, new_size));
            return Ok(ptr);
        }
        let new_ptr = self.malloc(new_size, align)?;
        let keep = old_size.min(new_size) as usize;
        self.memory
            .copy_within(ptr as usize, new_ptr as usize, keep)?;
        Ok(new_ptr)
    }

    fn has_realloc(&self) -> bool {
        self.realloc_enabled
    }

    fn free(&mut self, ptr: u32, size: u32, _align: u32) {
        if self.last == Some((ptr, size)) {
            self.next = ptr;
            self.last = None;
        }
    }

    fn function(&self, index: u32) -> Option<TableEntry> {
        self.functions.get(index as usize).copied().flatten()
    }

    fn entry_point(&self) -> Option<EntryFn> {
        self.entry
    }
}
