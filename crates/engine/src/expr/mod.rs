// Setting formula parsing and evaluation

pub mod parser;
pub mod eval;
pub mod functions;
pub mod analyze;

pub(crate) mod builtins_math;
pub(crate) mod builtins_stack;

pub use eval::{evaluate, ResolutionContext};
pub use functions::{Arity, FunctionEntry, FunctionImpl, FunctionRegistry};
pub use parser::{parse, CompiledExpression, Expr};
