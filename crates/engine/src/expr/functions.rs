// Function registry: name -> implementation, plus dotted constants (math.pi).
//
// The builtin catalogue is registered by builtins_math and builtins_stack.
// Callers may register further functions on their own registry copy.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use super::eval::ResolutionContext;
use crate::error::EvalError;
use crate::value::Value;

/// A builtin receives its arguments already evaluated, left to right.
pub type FunctionImpl = fn(ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError>;

/// Accepted argument counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    Range(usize, usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, got: usize) -> bool {
        match self {
            Arity::Exact(n) => got == n,
            Arity::Range(lo, hi) => (lo..=hi).contains(&got),
            Arity::AtLeast(n) => got >= n,
        }
    }

    pub fn check(self, function: &str, got: usize) -> Result<(), EvalError> {
        if self.accepts(got) {
            return Ok(());
        }
        Err(EvalError::Arity {
            function: function.to_string(),
            expected: self.to_string(),
            got,
        })
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::Range(lo, hi) => write!(f, "{} to {}", lo, hi),
            Arity::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

#[derive(Clone, Copy)]
pub struct FunctionEntry {
    pub arity: Arity,
    pub implementation: FunctionImpl,
    /// One-line description for `strata functions`.
    pub summary: &'static str,
}

impl std::fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("arity", &self.arity)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: FxHashMap<String, FunctionEntry>,
    constants: FxHashMap<String, Value>,
}

static BUILTIN: Lazy<FunctionRegistry> = Lazy::new(FunctionRegistry::with_builtins);

impl FunctionRegistry {
    /// An empty registry (no functions, no constants).
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared builtin catalogue.
    pub fn builtin() -> &'static FunctionRegistry {
        &BUILTIN
    }

    /// A fresh registry holding the builtin catalogue, ready for extension.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtins_math::register(&mut registry);
        super::builtins_stack::register(&mut registry);
        registry
    }

    /// Add or replace a function. Returns the entry it replaced, if any.
    pub fn register(
        &mut self,
        name: &str,
        arity: Arity,
        implementation: FunctionImpl,
        summary: &'static str,
    ) -> Option<FunctionEntry> {
        self.functions.insert(
            name.to_string(),
            FunctionEntry {
                arity,
                implementation,
                summary,
            },
        )
    }

    pub fn register_constant(&mut self, name: &str, value: Value) {
        self.constants.insert(name.to_string(), value);
    }

    pub fn lookup(&self, name: &str) -> Result<FunctionEntry, EvalError> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    /// Function names with their entries, sorted by name.
    pub fn functions(&self) -> Vec<(&str, &FunctionEntry)> {
        let mut entries: Vec<_> = self.functions.iter().map(|(k, v)| (k.as_str(), v)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Constant names with their values, sorted by name.
    pub fn constants(&self) -> Vec<(&str, &Value)> {
        let mut entries: Vec<_> = self.constants.iter().map(|(k, v)| (k.as_str(), v)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{evaluate, parse};

    fn double(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
        match &args[0] {
            Value::Int(i) => Ok(Value::Int(i * 2)),
            other => Err(EvalError::mismatch("double", format!("'{}'", other.type_name()))),
        }
    }

    /// Map context that evaluates through a caller-supplied registry.
    struct WithRegistry {
        registry: FunctionRegistry,
    }

    impl ResolutionContext for WithRegistry {
        fn setting_value(&mut self, key: &str) -> Result<Value, EvalError> {
            Err(EvalError::UnresolvedReference {
                key: key.to_string(),
                stack: "<test>".to_string(),
            })
        }

        fn functions(&self) -> &FunctionRegistry {
            &self.registry
        }
    }

    #[test]
    fn test_builtin_catalogue() {
        let registry = FunctionRegistry::builtin();
        for name in ["min", "max", "round", "math.ceil", "extruderValue", "resolveOrValue", "anyExtruderWithMaterial"] {
            assert!(registry.contains(name), "missing builtin {}", name);
        }
        assert!(registry.constant("math.pi").is_some());
        assert!(!registry.contains("valueFromContainer"));
    }

    #[test]
    fn test_functions_listing_is_sorted() {
        let names: Vec<&str> = FunctionRegistry::builtin().functions().iter().map(|(n, _)| *n).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_register_extends_registry() {
        let mut registry = FunctionRegistry::with_builtins();
        let before = registry.len();
        assert!(registry.register("double", Arity::Exact(1), double, "Twice the argument").is_none());
        assert_eq!(registry.len(), before + 1);

        let mut ctx = WithRegistry { registry };
        let expr = parse("double(21)").unwrap();
        assert_eq!(evaluate(&expr, &mut ctx).unwrap(), Value::Int(42));

        // builtins are untouched
        assert!(!FunctionRegistry::builtin().contains("double"));
    }

    #[test]
    fn test_arity_checked_before_call() {
        let mut registry = FunctionRegistry::new();
        registry.register("double", Arity::Exact(1), double, "");
        let mut ctx = WithRegistry { registry };
        let expr = parse("double(1, 2)").unwrap();
        match evaluate(&expr, &mut ctx).unwrap_err() {
            EvalError::Arity { function, expected, got } => {
                assert_eq!(function, "double");
                assert_eq!(expected, "1");
                assert_eq!(got, 2);
            }
            other => panic!("expected arity error, got {:?}", other),
        }
    }

    #[test]
    fn test_arity_display() {
        assert_eq!(Arity::Range(1, 2).to_string(), "1 to 2");
        assert_eq!(Arity::AtLeast(1).to_string(), "at least 1");
        assert!(Arity::AtLeast(1).accepts(5));
        assert!(!Arity::Range(1, 2).accepts(0));
    }
}
