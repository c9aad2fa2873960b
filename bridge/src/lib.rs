//! KPIO Module Bridge
//!
//! This crate provides the host side of the boundary between a sandboxed WASM
//! module and the host runtime. The module owns one flat linear memory and can
//! only pass integers and floats; everything else crosses through this bridge.
//!
//! # Architecture
//!
//! - `memory`: Linear memory observed by the bridge (grow / detach semantics)
//! - `view`: Memoized byte, word and data views that re-sync after growth
//! - `text`: UTF-8 encoder and the persistent strict decoder
//! - `marshal`: String and byte marshalling in and out of linear memory
//! - `value`: Host value model (`HostValue`, `HostObject`, `HostError`)
//! - `externref`: Handle table mapping small integers to host values
//! - `closure`: Reference-counted wrappers around module callbacks
//! - `finalize`: Best-effort cleanup of wrappers dropped without release
//! - `boundary`: Host call error capture and the last-exception slot
//! - `abi`: Core values and lowering of host values into them
//! - `module`: Contract the module runtime fulfils (allocator, function table)
//! - `host`: Host import registry and the bridge's own intrinsics
//! - `bridge`: The `Bridge` context object tying everything together

#![no_std]

extern crate alloc;

pub mod abi;
pub mod boundary;
pub mod bridge;
pub mod closure;
pub mod externref;
pub mod finalize;
pub mod host;
pub mod marshal;
pub mod memory;
pub mod module;
pub mod text;
pub mod value;
pub mod view;

use alloc::string::String;
use core::fmt;

pub use abi::CoreValue;
pub use bridge::Bridge;
pub use closure::{Closure, ClosureEnv, Signature};
pub use externref::{ExternrefTable, Handle};
pub use host::{HostFn, HostImport, HostImports};
pub use memory::LinearMemory;
pub use module::{BumpModule, EntryFn, ModuleRuntime, TableEntry};
pub use value::{HostError, HostObject, HostValue};

/// Bridge error types.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Access outside the current linear memory.
    MemoryOutOfBounds,
    /// Linear memory could not grow.
    MemoryGrow(String),
    /// The module allocator could not satisfy a request.
    AllocFailed,
    /// Bytes handed to the decoder were not valid UTF-8.
    InvalidUtf8 {
        /// Length of the longest valid prefix.
        valid_up_to: usize,
    },
    /// Handle refers to a freed or never-allocated slot.
    StaleHandle(u32),
    /// Value had the wrong shape for the requested operation.
    TypeMismatch(String),
    /// Closure wrapper was invoked after release or destruction.
    ClosureDestroyed,
    /// Arguments or table entry do not match a closure's calling convention.
    SignatureMismatch {
        /// Arity of the declared signature.
        expected: usize,
        /// Arity supplied by the caller or found in the table.
        actual: usize,
    },
    /// No function table entry at this index.
    MissingFunction(u32),
    /// Host import not registered.
    ImportNotFound(String),
    /// Host error raised by an import not marked as fallible.
    Uncaught(HostError),
    /// Module code trapped.
    Trap(String),
    /// The module entry point already ran.
    AlreadyStarted,
    /// The module does not export an entry point.
    MissingEntryPoint,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::MemoryOutOfBounds => write!(f, "memory access out of bounds"),
            BridgeError::MemoryGrow(msg) => write!(f, "memory grow failed: {}", msg),
            BridgeError::AllocFailed => write!(f, "module allocation failed"),
            BridgeError::InvalidUtf8 { valid_up_to } => {
                write!(f, "invalid UTF-8 after {} bytes", valid_up_to)
            }
            BridgeError::StaleHandle(idx) => write!(f, "stale handle {}", idx),
            BridgeError::TypeMismatch(msg) => write!(f, "type mismatch: {}", msg),
            BridgeError::ClosureDestroyed => write!(f, "closure invoked after release"),
            BridgeError::SignatureMismatch { expected, actual } => write!(
                f,
                "signature mismatch: expected {} arguments, got {}",
                expected, actual
            ),
            BridgeError::MissingFunction(idx) => write!(f, "no function at table index {}", idx),
            BridgeError::ImportNotFound(name) => write!(f, "import not found: {}", name),
            BridgeError::Uncaught(err) => write!(f, "uncaught host error: {}", err),
            BridgeError::Trap(msg) => write!(f, "trap: {}", msg),
            BridgeError::AlreadyStarted => write!(f, "module already started"),
            BridgeError::MissingEntryPoint => write!(f, "module has no entry point"),
        }
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Cumulative bytes a decoder instance may process before it is replaced.
    pub decoder_byte_limit: u64,
    /// Number of slots reserved whenever the handle table runs out of room.
    pub table_grow_chunk: u32,
    /// Closure registrations between automatic finalization sweeps.
    pub finalizer_sweep_threshold: usize,
    /// Report stale handle use as an error instead of reading `undefined`.
    pub checked_handles: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            // Some decoders corrupt output past ~2 GiB decoded in total.
            decoder_byte_limit: 2_146_435_072,
            table_grow_chunk: 128,
            finalizer_sweep_threshold: 64,
            checked_handles: true,
        }
    }
}
