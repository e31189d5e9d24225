//! Error taxonomy for the resolution engine.
//!
//! Errors are split by the phase that produces them:
//!
//! - [`DefinitionError`]: load time. Fatal to one machine family load.
//! - [`EvalError`]: evaluation time. Caught per key and surfaced as that
//!   key's `Undefined` value / `error` validation state.
//! - [`StackError`]: write time and stack-graph structure. A failed write
//!   leaves every container exactly as it was.

use thiserror::Error;

use crate::setting_id::StackId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("definition not found: {0}")]
    DefinitionNotFound(String),

    /// The inherits chain loops back on itself; holds the chain in load order.
    #[error("definition inherits cycle: {}", .0.join(" -> "))]
    DefinitionCycle(Vec<String>),

    #[error("malformed definition '{family}': {reason}")]
    MalformedDefinition { family: String, reason: String },
}

impl DefinitionError {
    pub(crate) fn malformed(family: &str, reason: impl Into<String>) -> Self {
        Self::MalformedDefinition {
            family: family.to_string(),
            reason: reason.into(),
        }
    }
}

/// Evaluation failures. `Clone` because results, failures included, are cached.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("syntax error in '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("unsupported operand types for {op}: {types}")]
    TypeMismatch { op: String, types: String },

    #[error("unresolved reference '{key}' in stack {stack}")]
    UnresolvedReference { key: String, stack: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}() takes {expected} argument(s), {got} given")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("math domain error in {0}()")]
    MathDomain(String),

    /// Evaluation re-entered a property already on the call chain.
    #[error("evaluation cycle: {}", .0.join(" -> "))]
    EvaluationCycle(Vec<String>),

    #[error("maximum evaluation depth {0} exceeded")]
    MaxDepthExceeded(usize),
}

impl EvalError {
    pub(crate) fn mismatch(op: &str, types: impl Into<String>) -> Self {
        Self::TypeMismatch {
            op: op.to_string(),
            types: types.into(),
        }
    }

    pub(crate) fn syntax(expression: &str, message: impl Into<String>) -> Self {
        Self::Syntax {
            expression: expression.to_string(),
            message: message.into(),
        }
    }

    /// True for failures that depend on the call chain rather than on stored
    /// data. These are never cached.
    pub fn is_chain_dependent(&self) -> bool {
        matches!(self, Self::EvaluationCycle(_) | Self::MaxDepthExceeded(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StackError {
    #[error("unknown stack {0}")]
    UnknownStack(StackId),

    #[error("setting '{key}' is not defined for stack {stack}")]
    UnknownSetting { key: String, stack: StackId },

    #[error("property '{property}' of '{key}' is read-only on stack {stack}")]
    ReadOnlyKey {
        key: String,
        property: String,
        stack: StackId,
    },

    #[error("extruder index {index} out of range ({count} extruder(s))")]
    ExtruderIndexOutOfRange { index: i64, count: usize },

    #[error("stack {stack} is not a {expected} stack")]
    InvalidStackKind { stack: StackId, expected: &'static str },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Expression(#[from] EvalError),
}
