//! Host values.
//!
//! Everything the module can refer to only through a handle: strings,
//! byte buffers, objects, errors and wrapped closures. Objects and closures
//! compare by identity; primitives compare by value.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;

use crate::closure::Closure;

/// A host runtime value.
#[derive(Clone)]
pub enum HostValue {
    /// Absence of a value.
    Undefined,
    /// The null value.
    Null,
    /// A boolean value.
    Bool(bool),
    /// A numeric value.
    Number(f64),
    /// A string value.
    String(String),
    /// An immutable byte buffer.
    Bytes(Rc<[u8]>),
    /// A host object.
    Object(HostObject),
    /// An error raised by a host operation.
    Error(HostError),
    /// A module callback wrapped for the host.
    Closure(Closure),
}

impl HostValue {
    /// Create a string value.
    pub fn string<S: Into<String>>(s: S) -> Self {
        HostValue::String(s.into())
    }

    /// Create a byte buffer value.
    pub fn bytes(bytes: Vec<u8>) -> Self {
        HostValue::Bytes(Rc::from(bytes))
    }

    /// Check if value is undefined.
    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    /// Check if value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    /// Check if value is nullish (undefined or null).
    pub fn is_nullish(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    /// Check if value is a string.
    pub fn is_string(&self) -> bool {
        matches!(self, HostValue::String(_))
    }

    /// Check if value is callable.
    pub fn is_function(&self) -> bool {
        matches!(self, HostValue::Closure(_))
    }

    /// Check if value is a non-null, non-callable object.
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            HostValue::Object(_) | HostValue::Error(_) | HostValue::Bytes(_)
        )
    }

    /// Whether the value crosses the boundary without a handle.
    pub fn is_primitive(&self) -> bool {
        matches!(self, HostValue::Bool(_) | HostValue::Number(_))
    }

    /// Borrow the string contents.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the numeric value.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get the closure, if this is one.
    pub fn as_closure(&self) -> Option<&Closure> {
        match self {
            HostValue::Closure(c) => Some(c),
            _ => None,
        }
    }

    /// Get the type of value as a string.
    pub fn type_of(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "object",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Bytes(_) | HostValue::Object(_) | HostValue::Error(_) => "object",
            HostValue::Closure(_) => "function",
        }
    }

    /// Human-readable rendering used by the `debug_string` intrinsic.
    pub fn debug_string(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".to_string(),
            HostValue::Null => "null".to_string(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => format_number(*n),
            HostValue::String(s) => format!("\"{}\"", s),
            HostValue::Bytes(b) => format!("Uint8Array({})", b.len()),
            HostValue::Closure(_) => "Function".to_string(),
            HostValue::Error(e) => e.to_string(),
            HostValue::Object(obj) if obj.class_name() == "Object" => {
                match obj.to_json(&mut Vec::new()) {
                    Some(json) => format!("Object({})", json),
                    None => "Object".to_string(),
                }
            }
            HostValue::Object(obj) => obj.class_name().to_string(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_infinite() {
        let sign = if n > 0.0 { "" } else { "-" };
        format!("{}Infinity", sign)
    } else {
        format!("{}", n)
    }
}

fn json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Bytes(a), HostValue::Bytes(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => a.ptr_eq(b),
            (HostValue::Error(a), HostValue::Error(b)) => a == b,
            (HostValue::Closure(a), HostValue::Closure(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => write!(f, "Undefined"),
            HostValue::Null => write!(f, "Null"),
            HostValue::Bool(b) => write!(f, "Bool({})", b),
            HostValue::Number(n) => write!(f, "Number({})", n),
            HostValue::String(s) => write!(f, "String({:?})", s),
            HostValue::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            HostValue::Object(o) => write!(f, "Object({})", o.class_name()),
            HostValue::Error(e) => write!(f, "Error({})", e),
            HostValue::Closure(c) => write!(f, "{:?}", c),
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.into())
    }
}

impl From<HostError> for HostValue {
    fn from(e: HostError) -> Self {
        HostValue::Error(e)
    }
}

struct ObjectData {
    class: String,
    properties: RefCell<BTreeMap<String, HostValue>>,
}

/// A host object with a class name and string-keyed properties.
#[derive(Clone)]
pub struct HostObject(Rc<ObjectData>);

impl HostObject {
    /// Create an object of the given class.
    pub fn new<S: Into<String>>(class: S) -> Self {
        HostObject(Rc::new(ObjectData {
            class: class.into(),
            properties: RefCell::new(BTreeMap::new()),
        }))
    }

    /// Create a plain `Object`.
    pub fn plain() -> Self {
        Self::new("Object")
    }

    /// Class name.
    pub fn class_name(&self) -> &str {
        &self.0.class
    }

    /// Read a property.
    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.0.properties.borrow().get(key).cloned()
    }

    /// Write a property.
    pub fn set<S: Into<String>>(&self, key: S, value: HostValue) {
        self.0.properties.borrow_mut().insert(key.into(), value);
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// JSON rendering of the own properties. `None` if the object graph
    /// reachable from here contains a cycle. `path` holds the objects
    /// currently being rendered.
    fn to_json(&self, path: &mut Vec<HostObject>) -> Option<String> {
        if path.iter().any(|seen| seen.ptr_eq(self)) {
            return None;
        }
        path.push(self.clone());
        let props = self.0.properties.borrow();
        let mut out = String::from("{");
        let mut first = true;
        for (key, value) in props.iter() {
            let rendered = match value {
                HostValue::Null => "null".to_string(),
                HostValue::Bool(b) => b.to_string(),
                HostValue::Number(n) if n.is_finite() => format!("{}", n),
                HostValue::Number(_) => "null".to_string(),
                HostValue::String(s) => json_string(s),
                HostValue::Object(o) => o.to_json(path)?,
                HostValue::Bytes(_) | HostValue::Error(_) => "{}".to_string(),
                // Skipped, as JSON does for undefined and functions.
                HostValue::Undefined | HostValue::Closure(_) => continue,
            };
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(&json_string(key));
            out.push(':');
            out.push_str(&rendered);
        }
        out.push('}');
        path.pop();
        Some(out)
    }
}

/// Error raised by a host operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    name: String,
    message: String,
}

impl HostError {
    /// Create an error with an explicit name, such as `TypeError`.
    pub fn new<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        HostError {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a generic `Error`.
    pub fn error<M: Into<String>>(message: M) -> Self {
        Self::new("Error", message)
    }

    /// Create a `TypeError`.
    pub fn type_error<M: Into<String>>(message: M) -> Self {
        Self::new("TypeError", message)
    }

    /// Get error name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_compare_by_value() {
        assert_eq!(HostValue::Number(1.5), HostValue::from(1.5));
        assert_eq!(HostValue::from("a"), HostValue::string("a"));
        assert_ne!(HostValue::Undefined, HostValue::Null);
        assert_ne!(HostValue::Bool(true), HostValue::Number(1.0));
    }

    #[test]
    fn objects_compare_by_identity() {
        let a = HostObject::plain();
        let b = HostObject::plain();
        assert_eq!(HostValue::Object(a.clone()), HostValue::Object(a.clone()));
        assert_ne!(HostValue::Object(a), HostValue::Object(b));
    }

    #[test]
    fn type_predicates() {
        assert!(HostValue::Null.is_nullish());
        assert!(HostValue::Undefined.is_nullish());
        assert!(!HostValue::Null.is_object());
        assert!(HostValue::Object(HostObject::plain()).is_object());
        assert!(HostValue::bytes(alloc::vec![1]).is_object());
        assert_eq!(HostValue::Null.type_of(), "object");
        assert!(HostValue::Number(0.0).is_primitive());
        assert!(!HostValue::string("x").is_primitive());
    }

    #[test]
    fn debug_string_primitives() {
        assert_eq!(HostValue::Undefined.debug_string(), "undefined");
        assert_eq!(HostValue::Number(3.0).debug_string(), "3");
        assert_eq!(HostValue::Number(f64::NEG_INFINITY).debug_string(), "-Infinity");
        assert_eq!(HostValue::string("hi").debug_string(), "\"hi\"");
        assert_eq!(HostValue::Bool(false).debug_string(), "false");
    }

    #[test]
    fn debug_string_objects() {
        let obj = HostObject::plain();
        obj.set("b", HostValue::string("x\"y"));
        obj.set("a", HostValue::Number(1.0));
        obj.set("skip", HostValue::Undefined);
        assert_eq!(
            HostValue::Object(obj).debug_string(),
            "Object({\"a\":1,\"b\":\"x\\\"y\"})"
        );

        let canvas = HostObject::new("HTMLCanvasElement");
        assert_eq!(HostValue::Object(canvas).debug_string(), "HTMLCanvasElement");

        assert_eq!(HostValue::bytes(alloc::vec![0; 3]).debug_string(), "Uint8Array(3)");

        let err = HostError::type_error("bad arg");
        assert_eq!(HostValue::from(err).debug_string(), "TypeError: bad arg");
    }

    #[test]
    fn cyclic_objects_render_as_object() {
        let a = HostObject::plain();
        let b = HostObject::plain();
        a.set("b", HostValue::Object(b.clone()));
        b.set("a", HostValue::Object(a.clone()));
        assert_eq!(HostValue::Object(a.clone()).debug_string(), "Object");
        assert_eq!(HostValue::Object(b).debug_string(), "Object");

        let looped = HostObject::plain();
        looped.set("me", HostValue::Object(looped.clone()));
        assert_eq!(HostValue::Object(looped).debug_string(), "Object");
    }

    #[test]
    fn shared_child_is_not_a_cycle() {
        let child = HostObject::plain();
        child.set("n", HostValue::Number(1.0));
        let parent = HostObject::plain();
        parent.set("x", HostValue::Object(child.clone()));
        parent.set("y", HostValue::Object(child));
        assert_eq!(
            HostValue::Object(parent).debug_string(),
            "Object({\"x\":{\"n\":1},\"y\":{\"n\":1}})"
        );
    }

    #[test]
    fn control_characters_escaped() {
        let obj = HostObject::plain();
        obj.set("k", HostValue::string("a\tb\r\u{1}"));
        assert_eq!(
            HostValue::Object(obj).debug_string(),
            "Object({\"k\":\"a\\tb\\r\\u0001\"})"
        );
    }
}
