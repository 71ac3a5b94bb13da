//! file: core/src/vm/operators.rs
//! description: operator dispatch tables.
//!
//! Implementations are registered per `(operator, lhs kind, rhs kind)` so
//! dispatch is a single hash lookup on the operand tags. A per-operator
//! wildcard entry covers operators defined for every kind (`==`, `in`, `!`).

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::error::VmError;
use crate::vm::op::{BinaryOp, UnaryOp};
use crate::vm::value::{Kind, Payload, Value};

/// Largest string or list `*` may build, in bytes or elements.
pub const MAX_REPEAT_LEN: usize = 1 << 28;

pub type BinaryFn = fn(BinaryOp, &Value, &Value) -> Result<Value, VmError>;
pub type UnaryFn = fn(&Value) -> Result<Value, VmError>;

#[derive(Clone, Default)]
pub struct OperatorTable {
    binary: HashMap<(BinaryOp, Kind, Kind), BinaryFn>,
    binary_any: HashMap<BinaryOp, BinaryFn>,
    unary: HashMap<(UnaryOp, Kind), UnaryFn>,
    unary_any: HashMap<UnaryOp, UnaryFn>,
}

lazy_static! {
    /// Built once per process; VMs share it unless a host installs its own.
    pub static ref DEFAULT_OPERATORS: Arc<OperatorTable> = Arc::new(OperatorTable::with_defaults());
}

impl OperatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_binary(&mut self, op: BinaryOp, lhs: Kind, rhs: Kind, f: BinaryFn) {
        self.binary.insert((op, lhs, rhs), f);
    }

    pub fn register_binary_any(&mut self, op: BinaryOp, f: BinaryFn) {
        self.binary_any.insert(op, f);
    }

    pub fn register_unary(&mut self, op: UnaryOp, operand: Kind, f: UnaryFn) {
        self.unary.insert((op, operand), f);
    }

    pub fn register_unary_any(&mut self, op: UnaryOp, f: UnaryFn) {
        self.unary_any.insert(op, f);
    }

    pub fn binary(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, VmError> {
        let f = self
            .binary
            .get(&(op, lhs.kind(), rhs.kind()))
            .or_else(|| self.binary_any.get(&op))
            .ok_or_else(|| unsupported_binary(op, lhs, rhs))?;
        f(op, lhs, rhs)
    }

    pub fn unary(&self, op: UnaryOp, operand: &Value) -> Result<Value, VmError> {
        let f = self
            .unary
            .get(&(op, operand.kind()))
            .or_else(|| self.unary_any.get(&op))
            .ok_or_else(|| VmError::UnsupportedOperator {
                op: op.symbol().to_string(),
                lhs: operand.type_tag(),
                rhs: None,
            })?;
        f(operand)
    }

    pub fn with_defaults() -> Self {
        use BinaryOp::*;
        use Kind::{Bytes as KBytes, Char as KChar, Float as KFloat, Int as KInt, List as KList, Str as KStr};

        let mut t = OperatorTable::new();

        for op in [Add, Sub, Mul, Div, Mod] {
            t.register_binary(op, KInt, KInt, int_arith);
            t.register_binary(op, KInt, KFloat, float_arith);
            t.register_binary(op, KFloat, KInt, float_arith);
            t.register_binary(op, KFloat, KFloat, float_arith);
        }
        for op in [BitAnd, BitOr, BitXor, BitAndNot, Shl, Shr] {
            t.register_binary(op, KInt, KInt, int_arith);
        }
        for op in [Lt, Gt, LtEq, GtEq] {
            for (l, r) in [
                (KInt, KInt),
                (KInt, KFloat),
                (KFloat, KInt),
                (KFloat, KFloat),
                (KStr, KStr),
                (KBytes, KBytes),
                (KChar, KChar),
                (KChar, KInt),
                (KInt, KChar),
            ] {
                t.register_binary(op, l, r, compare);
            }
        }

        t.register_binary(Add, KStr, KStr, concat_str);
        t.register_binary(Add, KStr, KChar, concat_str);
        t.register_binary(Add, KChar, KStr, concat_str);
        t.register_binary(Add, KStr, KInt, append_rune);
        t.register_binary(Add, KBytes, KBytes, concat_bytes);
        t.register_binary(Add, KBytes, KStr, concat_bytes);
        t.register_binary(Add, KList, KList, concat_list);
        t.register_binary(Add, KChar, KInt, rune_arith);
        t.register_binary(Sub, KChar, KInt, rune_arith);
        t.register_binary(Sub, KChar, KChar, |_, a, b| Ok(Value::from(rune(a)? - rune(b)?)));
        t.register_binary(Mul, KStr, KInt, repeat);
        t.register_binary(Mul, KList, KInt, repeat);

        t.register_binary_any(Eq, |_, a, b| Ok(Value::from(a.equals(b))));
        t.register_binary_any(NotEq, |_, a, b| Ok(Value::from(!a.equals(b))));
        t.register_binary_any(In, contains);

        t.register_unary(UnaryOp::Neg, KInt, |v| Ok(Value::from(int(v)?.wrapping_neg())));
        t.register_unary(UnaryOp::Neg, KFloat, |v| Ok(Value::from(-float(v)?)));
        t.register_unary(UnaryOp::Plus, KInt, |v| Ok(v.clone()));
        t.register_unary(UnaryOp::Plus, KFloat, |v| Ok(v.clone()));
        t.register_unary(UnaryOp::Plus, KChar, |v| Ok(Value::from(rune(v)?)));
        t.register_unary(UnaryOp::BitNot, KInt, |v| Ok(Value::from(!int(v)?)));
        t.register_unary_any(UnaryOp::Not, |v| Ok(Value::from(!v.truthy())));

        t
    }
}

fn unsupported_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> VmError {
    VmError::UnsupportedOperator { op: op.symbol().to_string(), lhs: lhs.type_tag(), rhs: Some(rhs.type_tag()) }
}

fn int(v: &Value) -> Result<i64, VmError> {
    match v.payload() {
        Payload::Int(i) => Ok(*i),
        _ => Err(VmError::type_error(format!("expected int, got {}", v.type_tag()))),
    }
}

fn float(v: &Value) -> Result<f64, VmError> {
    v.as_float().ok_or_else(|| VmError::type_error(format!("expected number, got {}", v.type_tag())))
}

fn rune(v: &Value) -> Result<i64, VmError> {
    match v.payload() {
        Payload::Char(c) => Ok(*c as i64),
        Payload::Int(i) => Ok(*i),
        _ => Err(VmError::type_error(format!("expected char, got {}", v.type_tag()))),
    }
}

fn to_char(code: i64) -> Result<char, VmError> {
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| VmError::runtime(format!("{} is not a valid rune", code)))
}

fn int_arith(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    apply_int(op, int(a)?, int(b)?)
}

fn float_arith(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    apply_float(op, float(a)?, float(b)?)
}

fn compare(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    use std::cmp::Ordering;
    let ord = match (a.payload(), b.payload()) {
        (Payload::Str(x), Payload::Str(y)) => x.cmp(y),
        (Payload::Bytes(x), Payload::Bytes(y)) => x.cmp(y),
        (Payload::Char(_), _) | (_, Payload::Char(_)) => rune(a)?.cmp(&rune(b)?),
        (Payload::Int(x), Payload::Int(y)) => x.cmp(y),
        _ => float(a)?.partial_cmp(&float(b)?).unwrap_or(Ordering::Equal),
    };
    let result = match op {
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::LtEq => ord != Ordering::Greater,
        BinaryOp::GtEq => ord != Ordering::Less,
        other => return Err(unsupported_binary(other, a, b)),
    };
    Ok(Value::from(result))
}

fn apply_int(op: BinaryOp, x: i64, y: i64) -> Result<Value, VmError> {
    let v = match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        BinaryOp::Mul => x.wrapping_mul(y),
        BinaryOp::Div if y == 0 => return Err(VmError::runtime("integer divide by zero")),
        BinaryOp::Div => x.wrapping_div(y),
        BinaryOp::Mod if y == 0 => return Err(VmError::runtime("integer divide by zero")),
        BinaryOp::Mod => x.wrapping_rem(y),
        BinaryOp::BitAnd => x & y,
        BinaryOp::BitOr => x | y,
        BinaryOp::BitXor => x ^ y,
        BinaryOp::BitAndNot => x & !y,
        BinaryOp::Shl | BinaryOp::Shr if y < 0 => return Err(VmError::runtime("negative shift amount")),
        BinaryOp::Shl => x.checked_shl(y as u32).unwrap_or(0),
        BinaryOp::Shr => x.checked_shr(y as u32).unwrap_or(if x < 0 { -1 } else { 0 }),
        other => {
            return Err(VmError::UnsupportedOperator { op: other.symbol().to_string(), lhs: "int", rhs: Some("int") });
        }
    };
    Ok(Value::from(v))
}

fn apply_float(op: BinaryOp, x: f64, y: f64) -> Result<Value, VmError> {
    let v = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
        BinaryOp::Mod => x % y,
        other => {
            return Err(VmError::UnsupportedOperator {
                op: other.symbol().to_string(),
                lhs: "float",
                rhs: Some("float"),
            });
        }
    };
    Ok(Value::from(v))
}

fn rune_arith(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    let (x, y) = (rune(a)?, int(b)?);
    let code = match op {
        BinaryOp::Sub => x.checked_sub(y),
        _ => x.checked_add(y),
    };
    let code = code.ok_or_else(|| VmError::runtime(format!("{} {} {} is not a valid rune", x, op.symbol(), y)))?;
    Ok(Value::from(to_char(code)?))
}

fn concat_str(_: BinaryOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    Ok(Value::from(format!("{}{}", a, b)))
}

fn append_rune(_: BinaryOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    let mut s = a.to_string();
    s.push(to_char(int(b)?)?);
    Ok(Value::from(s))
}

fn concat_bytes(_: BinaryOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    let mut out = a.as_bytes().unwrap_or_default().to_vec();
    out.extend_from_slice(b.as_bytes().unwrap_or_default());
    Ok(Value::bytes(out))
}

fn concat_list(_: BinaryOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    let mut out = a.as_list().map(|l| l.lock().clone()).unwrap_or_default();
    out.extend(b.as_list().map(|l| l.lock().clone()).unwrap_or_default());
    Ok(Value::list(out))
}

fn repeat(_: BinaryOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    let n = usize::try_from(int(b)?).map_err(|_| VmError::runtime("negative repeat count"))?;
    let too_long = |unit: usize| {
        unit.checked_mul(n)
            .filter(|total| *total <= MAX_REPEAT_LEN)
            .ok_or_else(|| VmError::runtime(format!("repeat count {} exceeds the {} limit", n, MAX_REPEAT_LEN)))
    };
    match a.payload() {
        Payload::Str(s) => {
            too_long(s.len())?;
            Ok(Value::from(s.repeat(n)))
        }
        Payload::List(l) => {
            let items = l.lock().clone();
            let mut out = Vec::with_capacity(too_long(items.len())?);
            for _ in 0..n {
                out.extend(items.iter().cloned());
            }
            Ok(Value::list(out))
        }
        _ => Err(unsupported_binary(BinaryOp::Mul, a, b)),
    }
}

/// `needle in haystack`.
fn contains(_: BinaryOp, needle: &Value, haystack: &Value) -> Result<Value, VmError> {
    let found = match haystack.payload() {
        Payload::List(l) => l.lock().iter().any(|v| v.equals(needle)),
        Payload::Map(m) => match needle.to_key() {
            Ok(k) => m.lock().contains_key(&k),
            Err(_) => false,
        },
        Payload::Str(s) => match needle.payload() {
            Payload::Char(c) => s.contains(*c),
            _ => s.contains(needle.to_string().as_str()),
        },
        Payload::Bytes(b) => {
            let n = needle.as_bytes().map(<[u8]>::to_vec).unwrap_or_else(|| needle.to_string().into_bytes());
            n.is_empty() || b.windows(n.len()).any(|w| w == n.as_slice())
        }
        _ => return Err(unsupported_binary(BinaryOp::In, needle, haystack)),
    };
    Ok(Value::from(found))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(op: BinaryOp, a: impl Into<Value>, b: impl Into<Value>) -> Result<Value, VmError> {
        DEFAULT_OPERATORS.binary(op, &a.into(), &b.into())
    }

    #[test]
    fn int_and_float_promotion() {
        assert_eq!(bin(BinaryOp::Add, 1i64, 2i64).unwrap(), Value::from(3i64));
        assert_eq!(bin(BinaryOp::Add, 1i64, 0.5).unwrap(), Value::from(1.5));
        assert_eq!(bin(BinaryOp::Div, 7i64, 2i64).unwrap(), Value::from(3i64));
        assert!(bin(BinaryOp::Div, 1i64, 0i64).is_err());
    }

    #[test]
    fn string_forms() {
        assert_eq!(bin(BinaryOp::Add, "a", "b").unwrap(), Value::from("ab"));
        assert_eq!(bin(BinaryOp::Add, "a", 98i64).unwrap(), Value::from("ab"));
        assert_eq!(bin(BinaryOp::Mul, "ab", 2i64).unwrap(), Value::from("abab"));
        assert_eq!(bin(BinaryOp::Lt, "a", "b").unwrap(), Value::from(true));
        assert_eq!(bin(BinaryOp::In, "ell", "hello").unwrap(), Value::from(true));
    }

    #[test]
    fn unsupported_combination_is_an_error() {
        let err = bin(BinaryOp::Sub, "a", 1.5).unwrap_err();
        assert_eq!(err.to_string(), "cannot support op1[string] - op2[float]");
        let err = DEFAULT_OPERATORS.unary(UnaryOp::Neg, &Value::from("x")).unwrap_err();
        assert!(matches!(err, VmError::UnsupportedOperator { rhs: None, .. }));
    }

    #[test]
    fn bitwise_and_shifts() {
        assert_eq!(bin(BinaryOp::Shl, 1i64, 4i64).unwrap(), Value::from(16i64));
        assert_eq!(bin(BinaryOp::BitAndNot, 0b1111i64, 0b0101i64).unwrap(), Value::from(0b1010i64));
        assert!(bin(BinaryOp::Shr, 1i64, -1i64).is_err());
    }

    #[test]
    fn equality_is_defined_for_every_kind() {
        assert_eq!(bin(BinaryOp::Eq, Value::undefined(), 0i64).unwrap(), Value::from(true));
        assert_eq!(bin(BinaryOp::NotEq, "x", 1i64).unwrap(), Value::from(true));
        assert_eq!(DEFAULT_OPERATORS.unary(UnaryOp::Not, &Value::from("")).unwrap(), Value::from(true));
    }

    #[test]
    fn chars_do_rune_arithmetic() {
        assert_eq!(bin(BinaryOp::Add, 'a', 1i64).unwrap(), Value::from('b'));
        assert_eq!(bin(BinaryOp::Sub, 'c', 'a').unwrap(), Value::from(2i64));
        assert_eq!(bin(BinaryOp::Lt, 'a', 98i64).unwrap(), Value::from(true));
    }

    #[test]
    fn rune_overflow_is_a_runtime_error() {
        let err = bin(BinaryOp::Add, 'a', i64::MAX).unwrap_err();
        assert!(matches!(err, VmError::Runtime(_)), "{:?}", err);
        assert!(err.to_string().contains("not a valid rune"), "{}", err);
        assert!(bin(BinaryOp::Sub, 'a', i64::MIN).is_err());
        assert!(bin(BinaryOp::Add, 'a', -200i64).is_err());
    }

    #[test]
    fn oversized_repeats_fail_instead_of_allocating() {
        let err = bin(BinaryOp::Mul, "x", i64::MAX).unwrap_err();
        assert!(matches!(err, VmError::Runtime(_)), "{:?}", err);
        assert!(bin(BinaryOp::Mul, "ab", (MAX_REPEAT_LEN / 2 + 1) as i64).is_err());
        let list = Value::list(vec![Value::from(1i64), Value::from(2i64)]);
        assert!(bin(BinaryOp::Mul, list.clone(), i64::MAX).is_err());
        assert_eq!(bin(BinaryOp::Mul, list, 2i64).unwrap().len(), Some(4));
        assert_eq!(bin(BinaryOp::Mul, "", i64::MAX).unwrap(), Value::from(""));
    }

    #[test]
    fn hosts_can_extend_a_cloned_table() {
        let mut t = (**DEFAULT_OPERATORS).clone();
        t.register_binary(BinaryOp::Sub, Kind::Str, Kind::Str, |_, a, b| {
            Ok(Value::from(a.to_string().replace(&b.to_string(), "")))
        });
        assert_eq!(t.binary(BinaryOp::Sub, &"abcb".into(), &"b".into()).unwrap(), Value::from("ac"));
    }
}
