//! Host imports.
//!
//! Functions the module imports from the host, keyed by module and name.
//! Imports marked fallible run inside the error boundary; the rest are
//! expected to succeed, and a failure surfaces as [`BridgeError::Uncaught`].
//! The bridge's own intrinsics live under the `"bridge"` module.

use alloc::format;
use alloc::string::{String, ToString};
use core::fmt;
use hashbrown::HashMap;

use crate::abi::{self, CoreValue};
use crate::bridge::Bridge;
use crate::closure::{ClosureEnv, Signature};
use crate::value::{HostError, HostValue};
use crate::{BridgeError, BridgeResult};

/// Host function signature.
pub type HostFn = fn(&mut Bridge, &[CoreValue]) -> Result<Option<CoreValue>, HostError>;

/// Module name the bridge intrinsics are registered under.
pub const INTRINSICS: &str = "bridge";

/// A registered host import.
#[derive(Clone, Copy)]
pub struct HostImport {
    /// The implementation.
    pub func: HostFn,
    /// Whether failures are captured into the last-exception slot.
    pub fallible: bool,
}

impl fmt::Debug for HostImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostImport")
            .field("fallible", &self.fallible)
            .finish_non_exhaustive()
    }
}

/// Host import registry.
#[derive(Debug, Default)]
pub struct HostImports {
    modules: HashMap<String, HashMap<String, HostImport>>,
}

impl HostImports {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an import that is expected to succeed.
    pub fn add_function(&mut self, module: &str, name: &str, func: HostFn) {
        self.insert(module, name, HostImport { func, fallible: false });
    }

    /// Register an import whose failures become the last exception.
    pub fn add_fallible(&mut self, module: &str, name: &str, func: HostFn) {
        self.insert(module, name, HostImport { func, fallible: true });
    }

    /// Register an import, replacing any previous one of the same name.
    pub fn insert(&mut self, module: &str, name: &str, import: HostImport) {
        self.modules
            .entry(module.into())
            .or_default()
            .insert(name.into(), import);
    }

    /// Look up an import.
    pub fn get(&self, module: &str, name: &str) -> Option<&HostImport> {
        self.modules.get(module)?.get(name)
    }

    /// Total number of imports.
    pub fn len(&self) -> usize {
        self.modules.values().map(HashMap::len).sum()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<BridgeError> for HostError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Uncaught(err) => err,
            BridgeError::TypeMismatch(_)
            | BridgeError::InvalidUtf8 { .. }
            | BridgeError::StaleHandle(_)
            | BridgeError::SignatureMismatch { .. } => HostError::type_error(err.to_string()),
            other => HostError::error(other.to_string()),
        }
    }
}

impl Bridge {
    /// Call a host import on behalf of the module.
    ///
    /// `Ok(None)` means no return value, either because the import returns
    /// nothing or because a fallible import failed and left an exception.
    pub fn call_import(
        &mut self,
        module: &str,
        name: &str,
        args: &[CoreValue],
    ) -> BridgeResult<Option<CoreValue>> {
        let import = *self
            .imports
            .get(module, name)
            .ok_or_else(|| BridgeError::ImportNotFound(format!("{}::{}", module, name)))?;

        if import.fallible {
            Ok(self.handle_error(|bridge| (import.func)(bridge, args)).flatten())
        } else {
            (import.func)(self, args).map_err(BridgeError::Uncaught)
        }
    }
}

/// Register the bridge intrinsics.
pub fn register_intrinsics(imports: &mut HostImports) {
    imports.add_function(INTRINSICS, "externref_drop", externref_drop);
    imports.add_function(INTRINSICS, "string_new", string_new);
    imports.add_function(INTRINSICS, "bytes_new", bytes_new);
    imports.add_function(INTRINSICS, "number_new", number_new);
    imports.add_function(INTRINSICS, "string_get", string_get);
    imports.add_function(INTRINSICS, "debug_string", debug_string);
    imports.add_function(INTRINSICS, "is_undefined", is_undefined);
    imports.add_function(INTRINSICS, "is_null", is_null);
    imports.add_function(INTRINSICS, "is_object", is_object);
    imports.add_function(INTRINSICS, "is_function", is_function);
    imports.add_function(INTRINSICS, "is_string", is_string);
    imports.add_function(INTRINSICS, "closure_new", closure_new);
    imports.add_function(INTRINSICS, "cb_unref", cb_unref);
    imports.add_function(INTRINSICS, "throw", throw);
}

type HostResult = Result<Option<CoreValue>, HostError>;

fn handle_arg(bridge: &Bridge, args: &[CoreValue], idx: usize) -> Result<HostValue, HostError> {
    let handle = abi::expect_handle(args, idx)?;
    Ok(bridge.externs.resolve(handle)?)
}

fn new_handle(bridge: &mut Bridge, value: HostValue) -> HostResult {
    Ok(Some(CoreValue::handle(bridge.externs.alloc(value))))
}

fn flag(value: bool) -> HostResult {
    Ok(Some(CoreValue::I32(value as i32)))
}

// (handle)
fn externref_drop(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    let handle = abi::expect_handle(args, 0)?;
    bridge.externs.free(handle)?;
    Ok(None)
}

// (ptr, len) -> handle
fn string_new(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    let ptr = abi::expect_u32(args, 0)?;
    let len = abi::expect_u32(args, 1)?;
    let s = bridge.decode_str(ptr, len)?;
    new_handle(bridge, HostValue::String(s))
}

// (ptr, len) -> handle
fn bytes_new(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    let ptr = abi::expect_u32(args, 0)?;
    let len = abi::expect_u32(args, 1)?;
    let bytes = bridge.copy_bytes(ptr, len)?;
    new_handle(bridge, HostValue::bytes(bytes))
}

// (f64) -> handle
fn number_new(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    let n = abi::expect_f64(args, 0)?;
    new_handle(bridge, HostValue::Number(n))
}

// (handle, out_ptr); writes (0, 0) when the value is not a string
fn string_get(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    let value = handle_arg(bridge, args, 0)?;
    let out = abi::expect_u32(args, 1)?;
    bridge.write_string_ret(out, value.as_str())?;
    Ok(None)
}

// (handle, out_ptr)
fn debug_string(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    let rendered = handle_arg(bridge, args, 0)?.debug_string();
    let out = abi::expect_u32(args, 1)?;
    bridge.write_string_ret(out, Some(rendered.as_str()))?;
    Ok(None)
}

fn is_undefined(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    flag(handle_arg(bridge, args, 0)?.is_undefined())
}

fn is_null(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    flag(handle_arg(bridge, args, 0)?.is_null())
}

fn is_object(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    flag(handle_arg(bridge, args, 0)?.is_object())
}

fn is_function(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    flag(handle_arg(bridge, args, 0)?.is_function())
}

fn is_string(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    flag(handle_arg(bridge, args, 0)?.is_string())
}

// (state, index, dtor, arity) -> handle
fn closure_new(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    let env = ClosureEnv {
        state: abi::expect_u32(args, 0)?,
        index: abi::expect_u32(args, 1)?,
    };
    let dtor = abi::expect_u32(args, 2)?;
    let signature = match abi::expect_i32(args, 3)? {
        0 => Signature::Nullary,
        1 => Signature::Unary,
        2 => Signature::Binary,
        n => return Err(HostError::type_error(format!("unsupported closure arity {}", n))),
    };
    let closure = bridge.wrap_closure(env, dtor, signature)?;
    new_handle(bridge, HostValue::Closure(closure))
}

// (handle) -> bool; consumes the handle
fn cb_unref(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    let handle = abi::expect_handle(args, 0)?;
    let closure = bridge
        .externs
        .resolve(handle)?
        .as_closure()
        .cloned()
        .ok_or_else(|| HostError::type_error("handle is not a closure"))?;
    bridge.externs.free(handle)?;
    flag(closure.release(bridge))
}

// (ptr, len)
fn throw(bridge: &mut Bridge, args: &[CoreValue]) -> HostResult {
    let ptr = abi::expect_u32(args, 0)?;
    let len = abi::expect_u32(args, 1)?;
    let message = bridge.decode_str(ptr, len)?;
    Err(HostError::error(message))
}
