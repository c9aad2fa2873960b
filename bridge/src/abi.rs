//! Core ABI values and lowering.
//!
//! Only numbers cross the boundary directly. Booleans lower to `i32`,
//! numbers to `f64`; every other host value lowers to an `i32` handle into
//! the external reference table.

use alloc::string::String;

use crate::externref::{ExternrefTable, Handle};
use crate::value::HostValue;
use crate::{BridgeError, BridgeResult};

/// Core value as passed across the module boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoreValue {
    /// 32-bit integer; also pointers, lengths, booleans and handles.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float; host numbers lower to this.
    F64(f64),
}

impl CoreValue {
    /// Reinterpret an `i32` as unsigned, e.g. for pointers and handles.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            CoreValue::I32(v) => Some(*v as u32),
            _ => None,
        }
    }

    /// Get the `f64` payload.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CoreValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Lower a handle.
    pub fn handle(handle: Handle) -> Self {
        CoreValue::I32(handle.as_u32() as i32)
    }
}

/// Lower a host value, allocating a handle when it is not primitive.
pub fn lower(value: HostValue, table: &mut ExternrefTable) -> CoreValue {
    match value {
        HostValue::Bool(b) => CoreValue::I32(b as i32),
        HostValue::Number(n) => CoreValue::F64(n),
        other => CoreValue::handle(table.insert(other)),
    }
}

/// Lower an optional host value; `None` and nullish values become handle 0.
pub fn lower_optional(value: Option<HostValue>, table: &mut ExternrefTable) -> CoreValue {
    match value {
        Some(v) if !v.is_nullish() => CoreValue::handle(table.insert(v)),
        _ => CoreValue::handle(Handle::UNDEFINED),
    }
}

/// Read argument `idx` as an `i32`.
pub fn expect_i32(values: &[CoreValue], idx: usize) -> BridgeResult<i32> {
    match values.get(idx) {
        Some(CoreValue::I32(v)) => Ok(*v),
        _ => Err(BridgeError::TypeMismatch(String::from(
            "expected i32 core value",
        ))),
    }
}

/// Read argument `idx` as a pointer or length.
pub fn expect_u32(values: &[CoreValue], idx: usize) -> BridgeResult<u32> {
    expect_i32(values, idx).map(|v| v as u32)
}

/// Read argument `idx` as an `f64`.
pub fn expect_f64(values: &[CoreValue], idx: usize) -> BridgeResult<f64> {
    match values.get(idx) {
        Some(CoreValue::F64(v)) => Ok(*v),
        _ => Err(BridgeError::TypeMismatch(String::from(
            "expected f64 core value",
        ))),
    }
}

/// Read argument `idx` as a handle.
pub fn expect_handle(values: &[CoreValue], idx: usize) -> BridgeResult<Handle> {
    expect_u32(values, idx).map(Handle::from_u32)
}
