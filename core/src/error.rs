use std::fmt;

use crate::location::{Location, Span};
use crate::vm::context::CancelReason;
use crate::vm::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level_str = match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        };
        write!(f, "{}", level_str)
    }
}

/// Structured view over every error the engine surfaces to a host.
pub trait YakErrorExt {
    fn level(&self) -> Level;
    fn message(&self) -> String;
    fn issuer(&self) -> String;
    fn span(&self) -> Option<Span>;
    fn location(&self) -> Option<Location>;
}

impl fmt::Debug for dyn YakErrorExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loc_str = match self.location() {
            Some(loc) => loc.to_string(),
            None => "unknown".to_string(),
        };
        let span_str = match self.span() {
            Some(span) => span.to_string(),
            None => "span:none".to_string(),
        };

        write!(
            f,
            "YAKVM | {} | {} | {} | {} | {}",
            self.level(),
            loc_str,
            self.issuer(),
            span_str,
            self.message()
        )
    }
}

impl fmt::Display for dyn YakErrorExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Failures of the `.yakc` codec. Never retried silently by an explicit
/// unmarshal call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    Truncated,
    BadMagic([u8; 2]),
    VersionMismatch { found: String, expected: String },
    MissingKey,
    Decrypt,
    Compression(String),
    Encoding(String),
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::Truncated => write!(f, "yakc blob is truncated"),
            MarshalError::BadMagic(m) => write!(f, "invalid yakc magic {:02x}{:02x}", m[0], m[1]),
            MarshalError::VersionMismatch { found, expected } => {
                write!(f, "yakc version {} does not match engine {}", found, expected)
            }
            MarshalError::MissingKey => write!(f, "encrypted yakc requires a key"),
            MarshalError::Decrypt => write!(f, "yakc decryption failed"),
            MarshalError::Compression(e) => write!(f, "yakc gzip: {}", e),
            MarshalError::Encoding(e) => write!(f, "yakc encoding: {}", e),
        }
    }
}

impl std::error::Error for MarshalError {}

#[derive(Debug, Clone)]
pub enum VmError {
    /// Opaque text forwarded from the external compiler.
    Compile(String),
    Arity {
        function: String,
        expected: usize,
        got: usize,
        variadic: bool,
    },
    UndefinedSymbol(String),
    UnsupportedOperator {
        op: String,
        lhs: &'static str,
        rhs: Option<&'static str>,
    },
    Type(String),
    Cancelled(CancelReason),
    Panic(Value),
    Runtime(String),
    Marshal(MarshalError),
    MissingSymbolTable,
}

impl VmError {
    pub fn runtime(msg: impl Into<String>) -> Self {
        VmError::Runtime(msg.into())
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        VmError::Type(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, VmError::Cancelled(_))
    }

    /// Ordinary `catch` blocks see every error except cancellation.
    pub fn is_catchable(&self) -> bool {
        !self.is_cancelled()
    }

    /// The script-level value bound to a catch variable or returned by
    /// `recover()`.
    pub fn to_value(&self) -> Value {
        match self {
            VmError::Panic(v) => v.clone(),
            other => Value::from(other.to_string()),
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Compile(msg) => write!(f, "compile error: {}", msg),
            VmError::Arity { function, expected, got, variadic } => {
                let at_least = if *variadic { "at least " } else { "" };
                write!(
                    f,
                    "function {} expects {}{} argument(s), got {}",
                    function, at_least, expected, got
                )
            }
            VmError::UndefinedSymbol(name) => write!(f, "undefined variable: {}", name),
            VmError::UnsupportedOperator { op, lhs, rhs: Some(rhs) } => {
                write!(f, "cannot support op1[{}] {} op2[{}]", lhs, op, rhs)
            }
            VmError::UnsupportedOperator { op, lhs, rhs: None } => {
                write!(f, "cannot support {}op1[{}]", op, lhs)
            }
            VmError::Type(msg) => write!(f, "type error: {}", msg),
            VmError::Cancelled(reason) => write!(f, "{}", reason),
            VmError::Panic(v) => write!(f, "panic: {}", v),
            VmError::Runtime(msg) => write!(f, "runtime error: {}", msg),
            VmError::Marshal(e) => write!(f, "{}", e),
            VmError::MissingSymbolTable => write!(f, "no symbol table attached to the vm"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::Marshal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MarshalError> for VmError {
    fn from(e: MarshalError) -> Self {
        VmError::Marshal(e)
    }
}

impl YakErrorExt for VmError {
    fn level(&self) -> Level {
        match self {
            VmError::Cancelled(_) => Level::Warning,
            VmError::Marshal(_) | VmError::MissingSymbolTable => Level::Critical,
            _ => Level::Error,
        }
    }

    fn message(&self) -> String {
        self.to_string()
    }

    fn issuer(&self) -> String {
        match self {
            VmError::Compile(_) => "yakvm.compiler",
            VmError::Marshal(_) => "yakvm.marshal",
            VmError::Cancelled(_) => "yakvm.context",
            _ => "yakvm.runtime",
        }
        .to_string()
    }

    fn span(&self) -> Option<Span> {
        None
    }

    fn location(&self) -> Option<Location> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_message_names_function_and_counts() {
        let e = VmError::Arity { function: "add".into(), expected: 2, got: 1, variadic: false };
        assert_eq!(e.to_string(), "function add expects 2 argument(s), got 1");
    }

    #[test]
    fn cancellation_is_not_catchable() {
        assert!(!VmError::Cancelled(CancelReason::Cancelled).is_catchable());
        assert!(VmError::runtime("x").is_catchable());
    }

    #[test]
    fn structured_display_contains_issuer() {
        let e: Box<dyn YakErrorExt> = Box::new(VmError::Marshal(MarshalError::MissingKey));
        let text = e.to_string();
        assert!(text.starts_with("YAKVM | CRITICAL"), "{}", text);
        assert!(text.contains("yakvm.marshal"), "{}", text);
    }
}
