//! UTF-8 text encoder and decoder.
//!
//! The decoder is strict: malformed input is an error, never replacement
//! characters, and a leading byte order mark is kept as text.

use alloc::string::String;
use alloc::vec::Vec;
use core::cell::Cell;
use core::str;

use crate::{BridgeError, BridgeResult};

/// Outcome of [`TextEncoder::encode_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeResult {
    /// Characters consumed from the source.
    pub read: usize,
    /// Bytes written to the destination.
    pub written: usize,
}

/// UTF-8 encoder.
///
/// Counts how often it is used so callers can tell whether a fast path
/// skipped it.
#[derive(Debug, Default)]
pub struct TextEncoder {
    calls: Cell<u64>,
}

impl TextEncoder {
    /// Create an encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode the whole string into a fresh buffer.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        self.calls.set(self.calls.get() + 1);
        text.as_bytes().to_vec()
    }

    /// Encode as many whole characters of `text` as fit into `dest`.
    pub fn encode_into(&self, text: &str, dest: &mut [u8]) -> EncodeResult {
        self.calls.set(self.calls.get() + 1);
        let mut read = 0;
        let mut written = 0;
        for c in text.chars() {
            let width = c.len_utf8();
            if written + width > dest.len() {
                break;
            }
            c.encode_utf8(&mut dest[written..written + width]);
            written += width;
            read += 1;
        }
        EncodeResult { read, written }
    }

    /// Number of `encode` and `encode_into` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls.get()
    }
}

/// Strict UTF-8 decoder.
#[derive(Debug)]
pub struct TextDecoder {
    generation: u32,
}

impl TextDecoder {
    /// Create a decoder. `generation` tells instances apart in logs and tests.
    pub fn new(generation: u32) -> Self {
        TextDecoder { generation }
    }

    /// Which instance this is.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Decode `bytes`, failing on any malformed sequence.
    pub fn decode(&self, bytes: &[u8]) -> BridgeResult<String> {
        match str::from_utf8(bytes) {
            Ok(s) => Ok(String::from(s)),
            Err(e) => Err(BridgeError::InvalidUtf8 {
                valid_up_to: e.valid_up_to(),
            }),
        }
    }
}
