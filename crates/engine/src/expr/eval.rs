// Expression evaluator - executes a parsed formula against a resolution context

use std::cmp::Ordering;

use super::functions::FunctionRegistry;
use super::parser::{BinOp, CmpOp, CompiledExpression, Expr, UnaryOp};
use crate::error::EvalError;
use crate::value::Value;

/// Everything a formula can observe. Implemented by the engine's per-call
/// resolver (bound to one stack) and by plain maps in tests.
///
/// Only `setting_value` is required; the cross-stack methods default to the
/// behaviour of a machine with a single stack and no extruders.
pub trait ResolutionContext {
    /// Value of setting `key` in the stack this formula is evaluated in.
    fn setting_value(&mut self, key: &str) -> Result<Value, EvalError>;

    /// Value of `key` in the extruder stack at `position` (-1: default extruder).
    fn extruder_value(&mut self, position: i64, key: &str) -> Result<Value, EvalError> {
        match position {
            -1 | 0 => self.setting_value(key),
            _ => Err(EvalError::IndexOutOfRange { index: position, len: 1 }),
        }
    }

    /// Values of `key` across every enabled extruder, in position order.
    fn extruder_values(&mut self, key: &str) -> Result<Vec<Value>, EvalError> {
        Ok(vec![self.setting_value(key)?])
    }

    /// Value of `key` as the machine's global stack resolves it.
    fn resolve_or_value(&mut self, key: &str) -> Result<Value, EvalError> {
        self.setting_value(key)
    }

    /// Positions of the enabled extruders.
    fn enabled_extruders(&self) -> Vec<i64> {
        vec![0]
    }

    fn default_extruder_position(&self) -> i64 {
        self.enabled_extruders().first().copied().unwrap_or(0)
    }

    /// Metadata entry of the material loaded in extruder `position`.
    fn material_metadata(&self, _position: i64, _entry: &str) -> Option<serde_json::Value> {
        None
    }

    fn functions(&self) -> &FunctionRegistry {
        FunctionRegistry::builtin()
    }
}

/// Flat key -> value context for evaluating formulas outside any stack.
impl ResolutionContext for rustc_hash::FxHashMap<String, Value> {
    fn setting_value(&mut self, key: &str) -> Result<Value, EvalError> {
        self.get(key).cloned().ok_or_else(|| EvalError::UnresolvedReference {
            key: key.to_string(),
            stack: "<map>".to_string(),
        })
    }
}

pub fn evaluate(expr: &CompiledExpression, ctx: &mut dyn ResolutionContext) -> Result<Value, EvalError> {
    eval_expr(expr.ast(), ctx)
}

fn eval_expr(expr: &Expr, ctx: &mut dyn ResolutionContext) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Name(name) => {
            if name.contains('.') {
                return ctx.functions().constant(name).cloned().ok_or_else(|| EvalError::UnresolvedReference {
                    key: name.clone(),
                    stack: "<constants>".to_string(),
                });
            }
            ctx.setting_value(name)
        }
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_expr(item, ctx)?);
            }
            Ok(Value::List(values))
        }
        Expr::Unary { op, operand } => {
            let v = eval_expr(operand, ctx)?;
            unary(*op, v)
        }
        Expr::Binary { op, left, right } => {
            let l = eval_expr(left, ctx)?;
            let r = eval_expr(right, ctx)?;
            binary(*op, &l, &r)
        }
        Expr::Compare { first, rest } => {
            let mut left = eval_expr(first, ctx)?;
            for (op, right_expr) in rest {
                let right = eval_expr(right_expr, ctx)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        // and/or yield an operand, not a coerced bool
        Expr::And(left, right) => {
            let l = eval_expr(left, ctx)?;
            if !l.truthy()? {
                return Ok(l);
            }
            eval_expr(right, ctx)
        }
        Expr::Or(left, right) => {
            let l = eval_expr(left, ctx)?;
            if l.truthy()? {
                return Ok(l);
            }
            eval_expr(right, ctx)
        }
        // Only the taken branch is evaluated (and becomes a dependency)
        Expr::Conditional { condition, then, otherwise } => {
            if eval_expr(condition, ctx)?.truthy()? {
                eval_expr(then, ctx)
            } else {
                eval_expr(otherwise, ctx)
            }
        }
        Expr::Call { name, args } => {
            let function = ctx.functions().lookup(name)?;
            function.arity.check(name, args.len())?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, ctx)?);
            }
            (function.implementation)(ctx, &values)
        }
        Expr::Index { target, index } => {
            let t = eval_expr(target, ctx)?;
            let i = eval_expr(index, ctx)?;
            subscript(&t, &i)
        }
    }
}

fn type_pair(l: &Value, r: &Value) -> String {
    format!("'{}' and '{}'", l.type_name(), r.type_name())
}

fn unary(op: UnaryOp, v: Value) -> Result<Value, EvalError> {
    match (op, v) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy()?)),
        (UnaryOp::Neg, Value::Int(i)) => Ok(i.checked_neg().map(Value::Int).unwrap_or(Value::Float(-(i as f64)))),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, v @ (Value::Int(_) | Value::Float(_))) => Ok(v),
        (op, v) => {
            let symbol = if op == UnaryOp::Neg { "unary -" } else { "unary +" };
            Err(EvalError::mismatch(symbol, format!("'{}'", v.type_name())))
        }
    }
}

/// Arithmetic with integer-preserving semantics. int op int stays int except
/// for `/` (always float), negative exponents and overflow (float fallback).
pub(crate) fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => int_binary(op, *a, *b),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            // as_f64 is Some for both arms above
            let a = l.as_f64().unwrap_or(f64::NAN);
            let b = r.as_f64().unwrap_or(f64::NAN);
            float_binary(op, a, b)
        }
        (Value::String(a), Value::String(b)) if op == BinOp::Add => Ok(Value::String(format!("{}{}", a, b))),
        (Value::List(a), Value::List(b)) if op == BinOp::Add => {
            Ok(Value::List(a.iter().chain(b.iter()).cloned().collect()))
        }
        (Value::String(s), Value::Int(n)) | (Value::Int(n), Value::String(s)) if op == BinOp::Mul => {
            let times = repeat_count(s.len(), *n)?;
            Ok(Value::String(s.repeat(times)))
        }
        (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) if op == BinOp::Mul => {
            let times = repeat_count(items.len(), *n)?;
            let mut out = Vec::with_capacity(items.len() * times);
            for _ in 0..times {
                out.extend(items.iter().cloned());
            }
            Ok(Value::List(out))
        }
        _ => Err(EvalError::mismatch(op.symbol(), type_pair(l, r))),
    }
}

/// Longest string (bytes) or list (items) that `*` may build.
pub const MAX_SEQUENCE_LEN: usize = 1 << 20;

/// Repeat count for `seq * n`, bounded by [`MAX_SEQUENCE_LEN`].
fn repeat_count(len: usize, n: i64) -> Result<usize, EvalError> {
    let times = usize::try_from(n.max(0)).map_err(|_| EvalError::MathDomain("*".to_string()))?;
    match len.checked_mul(times) {
        Some(total) if total <= MAX_SEQUENCE_LEN => Ok(times),
        _ => Err(EvalError::MathDomain("*".to_string())),
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> Result<Value, EvalError> {
    let widen = || float_binary(op, a as f64, b as f64);
    match op {
        BinOp::Add => a.checked_add(b).map(Value::Int).map_or_else(widen, Ok),
        BinOp::Sub => a.checked_sub(b).map(Value::Int).map_or_else(widen, Ok),
        BinOp::Mul => a.checked_mul(b).map(Value::Int).map_or_else(widen, Ok),
        BinOp::Div => float_binary(op, a as f64, b as f64),
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            let Some(q) = a.checked_div(b) else { return widen() };
            // Round toward negative infinity
            if a % b != 0 && ((a < 0) != (b < 0)) {
                Ok(Value::Int(q - 1))
            } else {
                Ok(Value::Int(q))
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            let Some(r) = a.checked_rem(b) else { return Ok(Value::Int(0)) };
            // Result takes the sign of the divisor
            if r != 0 && ((r < 0) != (b < 0)) {
                Ok(Value::Int(r + b))
            } else {
                Ok(Value::Int(r))
            }
        }
        BinOp::Pow => {
            if b < 0 {
                return widen();
            }
            match u32::try_from(b).ok().and_then(|e| a.checked_pow(e)) {
                Some(v) => Ok(Value::Int(v)),
                None => widen(),
            }
        }
    }
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Result<Value, EvalError> {
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a.powf(b)
        }
    };
    Ok(Value::Float(v))
}

/// Equality across any two values. Int and Float compare numerically;
/// every other cross-type pair is unequal.
pub(crate) fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => match (l, r) {
            (Value::Int(a), Value::Int(b)) => a == b,
            _ => l.as_f64() == r.as_f64(),
        },
        (Value::List(a), Value::List(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y)),
        _ => l == r,
    }
}

/// Ordering for numbers and for strings. Anything else is a type mismatch.
pub(crate) fn order(op: &str, l: &Value, r: &Value) -> Result<Ordering, EvalError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = l.as_f64().unwrap_or(f64::NAN);
            let b = r.as_f64().unwrap_or(f64::NAN);
            a.partial_cmp(&b).ok_or_else(|| EvalError::mismatch(op, "unordered NaN"))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(EvalError::mismatch(op, type_pair(l, r))),
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(values_equal(l, r)),
        CmpOp::NotEq => Ok(!values_equal(l, r)),
        CmpOp::Lt => Ok(order(op.symbol(), l, r)? == Ordering::Less),
        CmpOp::LtEq => Ok(order(op.symbol(), l, r)? != Ordering::Greater),
        CmpOp::Gt => Ok(order(op.symbol(), l, r)? == Ordering::Greater),
        CmpOp::GtEq => Ok(order(op.symbol(), l, r)? != Ordering::Less),
        CmpOp::In => contains(l, r),
        CmpOp::NotIn => contains(l, r).map(|found| !found),
    }
}

fn contains(needle: &Value, haystack: &Value) -> Result<bool, EvalError> {
    match (needle, haystack) {
        (_, Value::List(items)) => Ok(items.iter().any(|item| values_equal(needle, item))),
        (Value::String(n), Value::String(h)) => Ok(h.contains(n.as_str())),
        _ => Err(EvalError::mismatch("in", type_pair(needle, haystack))),
    }
}

fn subscript(target: &Value, index: &Value) -> Result<Value, EvalError> {
    let Value::Int(i) = index else {
        return Err(EvalError::mismatch("[]", type_pair(target, index)));
    };
    let len = match target {
        Value::List(items) => items.len(),
        Value::String(s) => s.chars().count(),
        _ => return Err(EvalError::mismatch("[]", type_pair(target, index))),
    };
    // Negative indices count from the end
    let resolved = if *i < 0 { *i + len as i64 } else { *i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(EvalError::IndexOutOfRange { index: *i, len });
    }
    let at = resolved as usize;
    match target {
        Value::List(items) => Ok(items[at].clone()),
        Value::String(s) => Ok(Value::String(s.chars().nth(at).map(String::from).unwrap_or_default())),
        _ => Err(EvalError::mismatch("[]", type_pair(target, index))),
    }
}
