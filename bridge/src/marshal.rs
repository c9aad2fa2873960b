//! String and byte marshalling.
//!
//! Strings going into the module are written into memory the module's own
//! allocator hands out; strings coming out are decoded from a pointer and a
//! byte length. Most strings crossing the boundary are ASCII, so encoding
//! copies bytes directly until the first non-ASCII character and only then
//! brings in the full encoder for the remainder.

use alloc::string::String;
use alloc::vec::Vec;
use core::cell::Ref;

use crate::bridge::Bridge;
use crate::text::{TextDecoder, TextEncoder};
use crate::{BridgeError, BridgeResult};

/// Encoder, decoder and bookkeeping shared by every marshalling call.
#[derive(Debug)]
pub struct TextCodec {
    encoder: TextEncoder,
    decoder: TextDecoder,
    decoded_since_reset: u64,
    decoder_byte_limit: u64,
    decoder_resets: u32,
    vector_len: u32,
}

impl TextCodec {
    /// Create a codec whose decoder is replaced every `decoder_byte_limit`
    /// cumulative bytes.
    pub fn new(decoder_byte_limit: u64) -> Self {
        let decoder = TextDecoder::new(0);
        // Prime the decoder so the first real call does no setup.
        let _ = decoder.decode(&[]);
        TextCodec {
            encoder: TextEncoder::new(),
            decoder,
            decoded_since_reset: 0,
            decoder_byte_limit,
            decoder_resets: 0,
            vector_len: 0,
        }
    }

    /// How many times the full encoder ran.
    pub fn encoder_calls(&self) -> u64 {
        self.encoder.calls()
    }

    /// Generation of the decoder currently in use.
    pub fn decoder_generation(&self) -> u32 {
        self.decoder.generation()
    }

    /// Bytes decoded by the current decoder instance.
    pub fn decoded_since_reset(&self) -> u64 {
        self.decoded_since_reset
    }

    fn decode(&mut self, bytes: &[u8]) -> BridgeResult<String> {
        let len = bytes.len() as u64;
        self.decoded_since_reset += len;
        if self.decoded_since_reset >= self.decoder_byte_limit {
            self.decoder_resets += 1;
            self.decoder = TextDecoder::new(self.decoder_resets);
            let _ = self.decoder.decode(&[]);
            self.decoded_since_reset = len;
            log::debug!(
                "text decoder replaced after byte limit (generation {})",
                self.decoder_resets
            );
        }
        self.decoder.decode(bytes)
    }
}

impl Bridge {
    /// Copy `text` into module memory as UTF-8 and return `(ptr, len)`.
    ///
    /// The length is also left in [`vector_len`](Self::vector_len).
    pub fn encode_str(&mut self, text: &str) -> BridgeResult<(u32, u32)> {
        if !self.runtime.has_realloc() {
            return self.encode_str_without_realloc(text);
        }

        let bytes = text.as_bytes();
        let char_count = text.chars().count() as u32;
        let mut ptr = self.runtime.malloc(char_count, 1)?;

        let offset = bytes
            .iter()
            .position(|b| !b.is_ascii())
            .unwrap_or(bytes.len());
        self.views
            .bytes(self.runtime.memory())
            .write(ptr, &bytes[..offset])?;

        let mut len = offset as u32;
        if offset != bytes.len() {
            // Starts on a char boundary: everything before it is ASCII.
            let suffix = &text[offset..];
            let new_len = (offset + suffix.len()) as u32;
            ptr = self.runtime.realloc(ptr, char_count, new_len, 1)?;

            let view = self.views.bytes(self.runtime.memory());
            let mut dest = view.subarray_mut(ptr + len, suffix.len())?;
            let result = self.codec.encoder.encode_into(suffix, &mut dest);
            drop(dest);
            len += result.written as u32;
        }

        self.codec.vector_len = len;
        Ok((ptr, len))
    }

    /// Encode up front, then allocate the exact size and copy.
    ///
    /// Used when the module exports no reallocator.
    pub fn encode_str_without_realloc(&mut self, text: &str) -> BridgeResult<(u32, u32)> {
        let buf = self.codec.encoder.encode(text);
        let ptr = self.runtime.malloc(buf.len() as u32, 1)?;
        self.views.bytes(self.runtime.memory()).write(ptr, &buf)?;
        let len = buf.len() as u32;
        self.codec.vector_len = len;
        Ok((ptr, len))
    }

    /// Length written by the most recent string encode.
    pub fn vector_len(&self) -> u32 {
        self.codec.vector_len
    }

    /// Decode `len` bytes at `ptr` as strict UTF-8.
    pub fn decode_str(&mut self, ptr: u32, len: u32) -> BridgeResult<String> {
        let view = self.views.bytes(self.runtime.memory());
        let bytes = view.subarray(ptr, len as usize)?;
        self.codec.decode(&bytes)
    }

    /// Decode a string the module handed over, then free its allocation.
    pub fn take_str(&mut self, ptr: u32, len: u32) -> BridgeResult<String> {
        let decoded = self.decode_str(ptr, len);
        self.runtime.free(ptr, len, 1);
        decoded
    }

    /// Borrow module memory without copying.
    ///
    /// The borrow ends before any call that could grow memory.
    pub fn raw_bytes(&mut self, ptr: u32, len: u32) -> BridgeResult<Ref<'_, [u8]>> {
        self.views
            .bytes(self.runtime.memory())
            .subarray(ptr, len as usize)
    }

    /// Copy bytes out of module memory.
    pub fn copy_bytes(&mut self, ptr: u32, len: u32) -> BridgeResult<Vec<u8>> {
        Ok(self.raw_bytes(ptr, len)?.to_vec())
    }

    /// Copy `len` 32-bit words out of module memory. `ptr` is a byte address.
    pub fn copy_words(&mut self, ptr: u32, len: u32) -> BridgeResult<Vec<u32>> {
        if ptr % 4 != 0 {
            return Err(BridgeError::TypeMismatch(String::from(
                "word pointer is not 4-byte aligned",
            )));
        }
        self.views
            .words(self.runtime.memory())
            .subarray(ptr / 4, len as usize)
    }

    /// Return an optional string through an out-pointer.
    ///
    /// Writes the pointer at `out_ptr` and the length at `out_ptr + 4`;
    /// `None` writes two zeros.
    pub fn write_string_ret(&mut self, out_ptr: u32, text: Option<&str>) -> BridgeResult<()> {
        let (ptr, len) = match text {
            Some(text) => self.encode_str(text)?,
            None => (0, 0),
        };
        let data = self.views.data(self.runtime.memory());
        data.set_i32(out_ptr, ptr as i32)?;
        data.set_i32(out_ptr + 4, len as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;
    use crate::module::BumpModule;
    use crate::BridgeConfig;

    fn bridge() -> Bridge {
        Bridge::new(BumpModule::new(1).unwrap(), BridgeConfig::default())
    }

    #[test]
    fn ascii_skips_encoder() {
        let mut b = bridge();
        let (ptr, len) = b.encode_str("hello").unwrap();
        assert_eq!(len, 5);
        assert_eq!(b.vector_len(), 5);
        assert_eq!(b.codec.encoder_calls(), 0);
        assert_eq!(b.copy_bytes(ptr, len).unwrap(), b"hello");
    }

    #[test]
    fn non_ascii_splices_suffix() {
        let mut b = bridge();
        let text = "caf\u{e9} \u{2603}";
        let (ptr, len) = b.encode_str(text).unwrap();
        assert_eq!(len as usize, text.len());
        assert_eq!(b.codec.encoder_calls(), 1);
        assert_eq!(b.copy_bytes(ptr, len).unwrap(), text.as_bytes());
        assert_eq!(b.decode_str(ptr, len).unwrap(), text);
    }

    #[test]
    fn empty_string() {
        let mut b = bridge();
        let (_, len) = b.encode_str("").unwrap();
        assert_eq!(len, 0);
        assert_eq!(b.vector_len(), 0);
    }

    #[test]
    fn encode_survives_memory_growth() {
        let mut b = bridge();
        let text: String = core::iter::repeat('\u{e9}').take(PAGE_SIZE).collect();
        let (ptr, len) = b.encode_str(&text).unwrap();
        assert_eq!(len as usize, 2 * PAGE_SIZE);
        assert!(b.memory().pages() >= 3);
        assert_eq!(b.decode_str(ptr, len).unwrap(), text);
    }

    #[test]
    fn without_realloc_encodes_up_front() {
        let module = BumpModule::new(1).unwrap().without_realloc();
        let mut b = Bridge::new(module, BridgeConfig::default());
        let (ptr, len) = b.encode_str("ab\u{1F600}").unwrap();
        assert_eq!(len, 6);
        assert_eq!(b.codec.encoder_calls(), 1);
        assert_eq!(b.decode_str(ptr, len).unwrap(), "ab\u{1F600}");
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let mut b = bridge();
        b.bytes().write(100, &[b'a', 0xC3, 0x28]).unwrap();
        assert_eq!(
            b.decode_str(100, 3),
            Err(BridgeError::InvalidUtf8 { valid_up_to: 1 })
        );
    }

    #[test]
    fn decode_preserves_bom() {
        let mut b = bridge();
        b.bytes().write(100, &[0xEF, 0xBB, 0xBF, b'h', b'i']).unwrap();
        assert_eq!(b.decode_str(100, 5).unwrap(), "\u{FEFF}hi");
    }

    #[test]
    fn decoder_replaced_at_limit() {
        let config = BridgeConfig {
            decoder_byte_limit: 10,
            ..BridgeConfig::default()
        };
        let mut b = Bridge::new(BumpModule::new(1).unwrap(), config);
        b.bytes().write(200, b"abcdef").unwrap();

        assert_eq!(b.decode_str(200, 6).unwrap(), "abcdef");
        assert_eq!(b.codec.decoder_generation(), 0);

        assert_eq!(b.decode_str(200, 6).unwrap(), "abcdef");
        assert_eq!(b.codec.decoder_generation(), 1);
        assert_eq!(b.codec.decoded_since_reset(), 6);

        assert_eq!(b.decode_str(200, 3).unwrap(), "abc");
        assert_eq!(b.codec.decoder_generation(), 1);
        assert_eq!(b.codec.decoded_since_reset(), 9);
    }

    #[test]
    fn copy_words_requires_alignment() {
        let mut b = bridge();
        b.data().set_u32(32, 5).unwrap();
        b.data().set_u32(36, 6).unwrap();
        assert_eq!(b.copy_words(32, 2).unwrap(), [5, 6]);
        assert!(b.copy_words(33, 1).is_err());
    }

    #[test]
    fn string_out_pointer() {
        let mut b = bridge();
        b.write_string_ret(16, Some("ok")).unwrap();
        let ptr = b.data().get_i32(16).unwrap() as u32;
        let len = b.data().get_i32(20).unwrap() as u32;
        assert_eq!(b.decode_str(ptr, len).unwrap(), "ok");

        b.write_string_ret(16, None).unwrap();
        assert_eq!(b.data().get_i32(16).unwrap(), 0);
        assert_eq!(b.data().get_i32(20).unwrap(), 0);
    }

    #[test]
    fn take_str_frees_allocation() {
        let mut b = bridge();
        let (ptr, len) = b.encode_str("gone").unwrap();
        assert_eq!(b.take_str(ptr, len).unwrap(), "gone");
        // The bump allocator hands the freed block out again.
        let (again, _) = b.encode_str("x").unwrap();
        assert_eq!(again, ptr);
    }
}
