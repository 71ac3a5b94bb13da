//! file: core/src/vm/value.rs
//! description: dynamically tagged runtime values.
//!
//! `Value` is the single cell type that flows through the operand stack,
//! scopes and containers. The type tag is derived from the payload, so the
//! two can never disagree. Scalars are immutable; lists and maps are shared
//! by reference and guarded by a mutex.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::VmError;
use crate::vm::channel::Channel;
use crate::vm::function::{Closure, HostFunction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Undefined,
    Bool,
    Int,
    Float,
    Char,
    Str,
    Bytes,
    List,
    Map,
    Function,
    Host,
    Channel,
    Opaque,
}

impl Kind {
    pub fn tag(&self) -> &'static str {
        match self {
            Kind::Undefined => "undefined",
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::Char => "char",
            Kind::Str => "string",
            Kind::Bytes => "bytes",
            Kind::List => "list",
            Kind::Map => "map",
            Kind::Function => "function",
            Kind::Host => "host-function",
            Kind::Channel => "channel",
            Kind::Opaque => "opaque",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Kind::Int | Kind::Float)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

pub type ListRef = Arc<Mutex<Vec<Value>>>;
pub type MapRef = Arc<Mutex<HashMap<MapKey, Value>>>;

#[derive(Clone)]
pub enum Payload {
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    List(ListRef),
    Map(MapRef),
    Function(Arc<Closure>),
    Host(Arc<HostFunction>),
    Channel(Arc<Channel>),
    Opaque(Arc<dyn Any + Send + Sync>),
}

/// Hashable subset of values usable as map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKey {
    Bool(bool),
    Int(i64),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
}

impl MapKey {
    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Bool(b) => Value::from(*b),
            MapKey::Int(i) => Value::from(*i),
            MapKey::Char(c) => Value::from(*c),
            MapKey::Str(s) => Value::from(s.as_str()),
            MapKey::Bytes(b) => Value::bytes(b.clone()),
        }
    }
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        MapKey::Str(s.to_string())
    }
}

impl From<i64> for MapKey {
    fn from(i: i64) -> Self {
        MapKey::Int(i)
    }
}

const DEEP_CLONE_DEPTH: usize = 32;

#[derive(Clone)]
pub struct Value {
    payload: Payload,
    literal: Option<Arc<str>>,
}

impl Default for Value {
    fn default() -> Self {
        Value::undefined()
    }
}

impl Value {
    pub fn new(payload: Payload) -> Self {
        Value { payload, literal: None }
    }

    pub fn undefined() -> Self {
        Value::new(Payload::Undefined)
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::new(Payload::Bytes(Arc::from(b.into())))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::new(Payload::List(Arc::new(Mutex::new(items))))
    }

    pub fn map(entries: HashMap<MapKey, Value>) -> Self {
        Value::new(Payload::Map(Arc::new(Mutex::new(entries))))
    }

    pub fn function(closure: Closure) -> Self {
        Value::new(Payload::Function(Arc::new(closure)))
    }

    pub fn host(f: HostFunction) -> Self {
        Value::new(Payload::Host(Arc::new(f)))
    }

    pub fn channel(ch: Arc<Channel>) -> Self {
        Value::new(Payload::Channel(ch))
    }

    pub fn opaque<T: Any + Send + Sync>(v: T) -> Self {
        Value::new(Payload::Opaque(Arc::new(v)))
    }

    /// Keeps the source spelling (`0x10`, `1e3`) next to the parsed payload.
    pub fn with_literal(mut self, literal: impl Into<Arc<str>>) -> Self {
        self.literal = Some(literal.into());
        self
    }

    pub fn literal(&self) -> Option<&str> {
        self.literal.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> Kind {
        match &self.payload {
            Payload::Undefined => Kind::Undefined,
            Payload::Bool(_) => Kind::Bool,
            Payload::Int(_) => Kind::Int,
            Payload::Float(_) => Kind::Float,
            Payload::Char(_) => Kind::Char,
            Payload::Str(_) => Kind::Str,
            Payload::Bytes(_) => Kind::Bytes,
            Payload::List(_) => Kind::List,
            Payload::Map(_) => Kind::Map,
            Payload::Function(_) => Kind::Function,
            Payload::Host(_) => Kind::Host,
            Payload::Channel(_) => Kind::Channel,
            Payload::Opaque(_) => Kind::Opaque,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        self.kind().tag()
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.payload, Payload::Undefined)
    }

    pub fn truthy(&self) -> bool {
        match &self.payload {
            Payload::Undefined => false,
            Payload::Bool(b) => *b,
            Payload::Int(i) => *i != 0,
            Payload::Float(f) => *f != 0.0,
            Payload::Char(c) => *c != '\0',
            Payload::Str(s) => !s.is_empty(),
            Payload::Bytes(b) => !b.is_empty(),
            Payload::List(l) => !l.lock().is_empty(),
            Payload::Map(m) => !m.lock().is_empty(),
            Payload::Function(_) | Payload::Host(_) | Payload::Channel(_) | Payload::Opaque(_) => {
                true
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.payload {
            Payload::Int(i) => Some(*i),
            Payload::Char(c) => Some(*c as i64),
            Payload::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match &self.payload {
            Payload::Int(i) => Some(*i as f64),
            Payload::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.payload {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(b) => Some(b),
            Payload::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Copies lists and maps into fresh containers, recursively, so later
    /// mutation of `self` is not visible through the copy. Containers nested
    /// deeper than `DEEP_CLONE_DEPTH` stay shared.
    pub fn deep_clone(&self) -> Value {
        self.deep_clone_at(0)
    }

    fn deep_clone_at(&self, depth: usize) -> Value {
        if depth >= DEEP_CLONE_DEPTH {
            return self.clone();
        }
        match &self.payload {
            Payload::List(l) => {
                let items = l.lock().clone();
                Value::list(items.iter().map(|v| v.deep_clone_at(depth + 1)).collect())
            }
            Payload::Map(m) => {
                let entries = m.lock().clone();
                Value::map(entries.into_iter().map(|(k, v)| (k, v.deep_clone_at(depth + 1))).collect())
            }
            _ => self.clone(),
        }
    }

    pub fn as_list(&self) -> Option<&ListRef> {
        match &self.payload {
            Payload::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapRef> {
        match &self.payload {
            Payload::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Arc<Channel>> {
        match &self.payload {
            Payload::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match &self.payload {
            Payload::Opaque(o) => o.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.payload, Payload::Function(_) | Payload::Host(_))
    }

    /// Number of elements for sized values.
    pub fn len(&self) -> Option<usize> {
        match &self.payload {
            Payload::Str(s) => Some(s.len()),
            Payload::Bytes(b) => Some(b.len()),
            Payload::List(l) => Some(l.lock().len()),
            Payload::Map(m) => Some(m.lock().len()),
            Payload::Channel(c) => Some(c.len()),
            _ => None,
        }
    }

    pub fn to_key(&self) -> Result<MapKey, VmError> {
        match &self.payload {
            Payload::Bool(b) => Ok(MapKey::Bool(*b)),
            Payload::Int(i) => Ok(MapKey::Int(*i)),
            Payload::Char(c) => Ok(MapKey::Char(*c)),
            Payload::Str(s) => Ok(MapKey::Str(s.to_string())),
            Payload::Bytes(b) => Ok(MapKey::Bytes(b.to_vec())),
            _ => Err(VmError::type_error(format!("unhashable type {}", self.type_tag()))),
        }
    }

    /// Script-level `==`: numbers compare across int/float, bytes against
    /// strings, ints against single runes, and undefined by truthiness.
    pub fn equals(&self, other: &Value) -> bool {
        use Payload::*;
        match (&self.payload, &other.payload) {
            (Undefined, Undefined) => true,
            (Undefined, _) | (_, Undefined) => self.truthy() == other.truthy(),
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (Int(a), Char(c)) | (Char(c), Int(a)) => *a == *c as i64,
            (Int(a), Str(s)) | (Str(s), Int(a)) => single_rune(s).is_some_and(|c| *a == c as i64),
            (Char(c), Str(s)) | (Str(s), Char(c)) => single_rune(s) == Some(*c),
            (Bytes(b), Str(s)) | (Str(s), Bytes(b)) => b.as_ref() == s.as_bytes(),
            (List(a), List(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.lock().clone(), b.lock().clone());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Map(a), Map(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.lock().clone(), b.lock().clone());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.equals(w)))
            }
            _ => self == other,
        }
    }
}

fn single_rune(s: &str) -> Option<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

/// Strict structural equality: kinds must match exactly. Used by watch
/// breakpoints and tests; scripts go through `Value::equals`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Payload::*;
        match (&self.payload, &other.payload) {
            (Undefined, Undefined) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (List(a), List(b)) => Arc::ptr_eq(a, b) || *a.lock() == *b.lock(),
            (Map(a), Map(b)) => Arc::ptr_eq(a, b) || *a.lock() == *b.lock(),
            (Function(a), Function(b)) => Arc::ptr_eq(a, b),
            (Host(a), Host(b)) => Arc::ptr_eq(a, b),
            (Channel(a), Channel(b)) => Arc::ptr_eq(a, b),
            (Opaque(a), Opaque(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Undefined => write!(f, "undefined"),
            Payload::Bool(b) => write!(f, "{}", b),
            Payload::Int(i) => write!(f, "{}", i),
            Payload::Float(x) => write!(f, "{}", x),
            Payload::Char(c) => write!(f, "{}", c),
            Payload::Str(s) => write!(f, "{}", s),
            Payload::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Payload::List(l) => {
                let inner: Vec<String> = l.lock().iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", inner.join(" "))
            }
            Payload::Map(m) => {
                let guard = m.lock();
                let mut keys: Vec<&MapKey> = guard.keys().collect();
                keys.sort();
                let inner: Vec<String> = keys
                    .into_iter()
                    .map(|k| format!("{}:{}", k.to_value(), guard[k]))
                    .collect();
                write!(f, "map[{}]", inner.join(" "))
            }
            Payload::Function(c) => write!(f, "<function {}>", c.name()),
            Payload::Host(h) => write!(f, "<host {}>", h.name()),
            Payload::Channel(_) => write!(f, "<channel>"),
            Payload::Opaque(_) => write!(f, "<opaque>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Str(s) => write!(f, "{}({:?})", self.type_tag(), s),
            Payload::Char(c) => write!(f, "{}({:?})", self.type_tag(), c),
            _ => write!(f, "{}({})", self.type_tag(), self),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::new(Payload::Bool(b))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::new(Payload::Int(i))
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::new(Payload::Int(i as i64))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::new(Payload::Int(i as i64))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::new(Payload::Float(x))
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::new(Payload::Char(c))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::new(Payload::Str(Arc::from(s)))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::new(Payload::Str(Arc::from(s)))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_clone_detaches_nested_containers() {
        let inner = Value::list(vec![Value::from(1i64)]);
        let outer = Value::list(vec![inner.clone()]);
        let copy = outer.deep_clone();
        assert_eq!(copy, outer);

        if let Some(items) = inner.as_list() {
            items.lock().push(Value::from(2i64));
        }
        assert_eq!(outer.to_string(), "[[1 2]]");
        assert_eq!(copy.to_string(), "[[1]]");
        assert_ne!(copy, outer);
    }

    #[test]
    fn type_tag_follows_payload() {
        assert_eq!(Value::from(1i64).type_tag(), "int");
        assert_eq!(Value::from(1.5).type_tag(), "float");
        assert_eq!(Value::bytes(b"ab".to_vec()).type_tag(), "bytes");
        assert_eq!(Value::undefined().type_tag(), "undefined");
    }

    #[test]
    fn loose_equality_rules() {
        assert!(Value::from(1i64).equals(&Value::from(1.0)));
        assert!(Value::from(97i64).equals(&Value::from("a")));
        assert!(Value::from('a').equals(&Value::from(97i64)));
        assert!(Value::bytes(b"hi".to_vec()).equals(&Value::from("hi")));
        assert!(Value::undefined().equals(&Value::from(0i64)));
        assert!(!Value::undefined().equals(&Value::from(2i64)));
        assert!(!Value::from(1i64).equals(&Value::from("1")));
    }

    #[test]
    fn strict_equality_is_kind_sensitive() {
        assert_ne!(Value::from(1i64), Value::from(1.0));
        assert_eq!(Value::list(vec![1i64.into()]), Value::list(vec![1i64.into()]));
    }

    #[test]
    fn containers_are_shared_by_reference() {
        let a = Value::list(vec![]);
        let b = a.clone();
        b.as_list().map(|l| l.lock().push(Value::from(3i64)));
        assert_eq!(a.len(), Some(1));
    }

    #[test]
    fn literal_is_preserved() {
        let v = Value::from(16i64).with_literal("0x10");
        assert_eq!(v.literal(), Some("0x10"));
        assert_eq!(v.to_string(), "16");
    }

    #[test]
    fn float_keys_are_rejected() {
        assert!(Value::from(1.5).to_key().is_err());
        assert_eq!(Value::from("k").to_key().ok(), Some(MapKey::from("k")));
    }
}
