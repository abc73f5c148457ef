//! Runtime error model
//!
//! Every fallible core operation returns `Result<T, Error>`. An `Error`
//! carries a closed kind set, the pipeline phase it was raised in, and the
//! source coordinates of the offending operand so the top level can print a
//! line-and-column-anchored message.
//!
//! A thread-local cell holds the most recently thrown user exception so that
//! `try`/`catch` and the worker pool can recover the thrown value after an
//! error has unwound through non-Clove frames.

use std::cell::RefCell;
use std::fmt;

use crate::value::Value;

/// Closed set of error kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Overflow, divide-by-zero
    Arithmetic,
    /// Non-numeric in a numeric position, callee not callable
    Type,
    /// Wrong argument count
    Arity,
    /// Bad set! target, shutdown-hook table full, invalid state
    Value,
    /// Bootstrap or evaluator failure
    Internal,
    /// `throw` payload; carries an arbitrary value for `catch`
    User(Value),
}

/// Pipeline phase an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Read,
    Analyze,
    Eval,
    Runtime,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Read => write!(f, "read"),
            Phase::Analyze => write!(f, "analyze"),
            Phase::Eval => write!(f, "eval"),
            Phase::Runtime => write!(f, "runtime"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub phase: Phase,
    pub message: String,
    /// Which argument failed (0 or 1 for binary numeric ops)
    pub arg_index: Option<usize>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub col: Option<u32>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            phase: Phase::Runtime,
            message: message.into(),
            arg_index: None,
            file: None,
            line: None,
            col: None,
        }
    }

    pub fn arithmetic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arithmetic, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn arity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arity, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn user(thrown: Value, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User(thrown), message)
    }

    /// Attribute the error to the nth argument of the failing operation.
    pub fn with_arg(mut self, idx: usize) -> Self {
        self.arg_index = Some(idx);
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Anchor the error at a source coordinate. Keeps an existing anchor if
    /// one is already set, so the innermost location wins.
    pub fn at(mut self, line: u32, col: u32) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
            self.col = Some(col);
        }
        self
    }

    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        if self.file.is_none() {
            self.file = Some(file.into());
        }
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ErrorKind::Arithmetic => "arithmetic_error",
            ErrorKind::Type => "type_error",
            ErrorKind::Arity => "arity_error",
            ErrorKind::Value => "value_error",
            ErrorKind::Internal => "internal_error",
            ErrorKind::User(_) => "exception",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error", self.phase)?;
        if let (Some(line), Some(col)) = (self.line, self.col) {
            write!(f, " at {line}:{col}")?;
        }
        write!(f, ": {}: {}", self.kind_name(), self.message)
    }
}

impl std::error::Error for Error {}

thread_local! {
    /// Most recently thrown user exception value on this thread.
    static LAST_EXCEPTION: RefCell<Option<Value>> = const { RefCell::new(None) };
}

/// Record the value a `throw` raised on this thread.
pub fn set_last_exception(v: Value) {
    LAST_EXCEPTION.with(|e| *e.borrow_mut() = Some(v));
}

/// Take (and clear) the last thrown value.
pub fn take_last_exception() -> Option<Value> {
    LAST_EXCEPTION.with(|e| e.borrow_mut().take())
}

pub fn has_last_exception() -> bool {
    LAST_EXCEPTION.with(|e| e.borrow().is_some())
}

pub fn clear_last_exception() {
    LAST_EXCEPTION.with(|e| *e.borrow_mut() = None);
}

/// Format a panic payload into an error message.
pub fn format_panic_payload(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_anchored() {
        let e = Error::type_error("cannot add string")
            .with_phase(Phase::Eval)
            .at(3, 16);
        assert_eq!(
            e.to_string(),
            "eval error at 3:16: type_error: cannot add string"
        );
    }

    #[test]
    fn test_innermost_anchor_wins() {
        let e = Error::arithmetic("Divide by zero").at(1, 5).at(9, 9);
        assert_eq!(e.line, Some(1));
        assert_eq!(e.col, Some(5));
    }

    #[test]
    fn test_last_exception_cell() {
        clear_last_exception();
        assert!(!has_last_exception());

        set_last_exception(Value::nil());
        assert!(has_last_exception());
        assert!(take_last_exception().is_some());
        assert!(!has_last_exception());
    }

    #[test]
    fn test_format_panic_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("panic message");
        assert_eq!(format_panic_payload(&payload), "panic message");

        let payload: Box<dyn std::any::Any + Send> = Box::new("owned panic".to_string());
        assert_eq!(format_panic_payload(&payload), "owned panic");
    }
}
