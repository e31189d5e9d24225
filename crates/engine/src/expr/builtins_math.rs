// Math and conversion builtins: min, max, abs, round, ceil, floor, sqrt, pow,
// int, float, str, bool, len, sum, any, all, and the math.* namespace

use std::cmp::Ordering;

use super::eval::{binary, order, ResolutionContext};
use super::functions::{Arity, FunctionRegistry};
use super::parser::BinOp;
use crate::error::EvalError;
use crate::value::Value;

pub(crate) fn register(registry: &mut FunctionRegistry) {
    registry.register("min", Arity::AtLeast(1), min, "Smallest argument, or smallest item of one list");
    registry.register("max", Arity::AtLeast(1), max, "Largest argument, or largest item of one list");
    registry.register("abs", Arity::Exact(1), abs, "Absolute value");
    registry.register("round", Arity::Range(1, 2), round, "Round half to even; int without digits");
    registry.register("int", Arity::Exact(1), to_int, "Convert to int (truncates floats)");
    registry.register("float", Arity::Exact(1), to_float, "Convert to float");
    registry.register("str", Arity::Exact(1), to_str, "Convert to string");
    registry.register("bool", Arity::Exact(1), to_bool, "Truth value");
    registry.register("len", Arity::Exact(1), len, "Length of a list or string");
    registry.register("sum", Arity::Exact(1), sum, "Sum of a list of numbers");
    registry.register("any", Arity::Exact(1), any, "True if any list item is truthy");
    registry.register("all", Arity::Exact(1), all, "True if every list item is truthy");
    registry.register("pow", Arity::Exact(2), pow, "Power, int for int operands");

    for prefix in ["", "math."] {
        let name = |n: &str| format!("{}{}", prefix, n);
        registry.register(&name("ceil"), Arity::Exact(1), ceil, "Smallest int >= x");
        registry.register(&name("floor"), Arity::Exact(1), floor, "Largest int <= x");
        registry.register(&name("sqrt"), Arity::Exact(1), sqrt, "Square root");
    }
    registry.register("math.pow", Arity::Exact(2), math_pow, "Float power");
    registry.register("math.fabs", Arity::Exact(1), fabs, "Absolute value as float");
    registry.register("math.exp", Arity::Exact(1), exp, "e raised to x");
    registry.register("math.log", Arity::Range(1, 2), log, "Natural log, or log to a base");
    registry.register("math.radians", Arity::Exact(1), radians, "Degrees to radians");
    registry.register("math.degrees", Arity::Exact(1), degrees, "Radians to degrees");
    registry.register("math.sin", Arity::Exact(1), sin, "Sine (radians)");
    registry.register("math.cos", Arity::Exact(1), cos, "Cosine (radians)");
    registry.register("math.tan", Arity::Exact(1), tan, "Tangent (radians)");
    registry.register("math.atan", Arity::Exact(1), atan, "Arc tangent (radians)");

    registry.register_constant("math.pi", Value::Float(std::f64::consts::PI));
    registry.register_constant("math.e", Value::Float(std::f64::consts::E));
    registry.register_constant("math.inf", Value::Float(f64::INFINITY));
}

fn number(function: &str, v: &Value) -> Result<f64, EvalError> {
    v.as_f64()
        .ok_or_else(|| EvalError::mismatch(&format!("{}()", function), format!("'{}'", v.type_name())))
}

fn list<'a>(function: &str, v: &'a Value) -> Result<&'a [Value], EvalError> {
    match v {
        Value::List(items) => Ok(items),
        other => Err(EvalError::mismatch(&format!("{}()", function), format!("'{}'", other.type_name()))),
    }
}

/// Float result that must stay an integer (ceil/floor/round) as Int.
fn integral(function: &str, f: f64) -> Result<Value, EvalError> {
    if !f.is_finite() || f.abs() >= 9.2e18 {
        return Err(EvalError::MathDomain(function.to_string()));
    }
    Ok(Value::Int(f as i64))
}

fn extreme(function: &str, args: &[Value], keep: Ordering) -> Result<Value, EvalError> {
    // One list argument: iterate its items, like Python's min(iterable)
    let items = match args {
        [Value::List(items)] => items.as_slice(),
        _ => args,
    };
    let mut best: Option<&Value> = None;
    for item in items {
        match best {
            None => best = Some(item),
            Some(current) => {
                if order(function, item, current)? == keep {
                    best = Some(item);
                }
            }
        }
    }
    best.cloned()
        .ok_or_else(|| EvalError::mismatch(&format!("{}()", function), "empty sequence"))
}

fn min(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    extreme("min", args, Ordering::Less)
}

fn max(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    extreme("max", args, Ordering::Greater)
}

fn abs(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    match &args[0] {
        Value::Int(i) => Ok(i.checked_abs().map(Value::Int).unwrap_or(Value::Float((*i as f64).abs()))),
        other => Ok(Value::Float(number("abs", other)?.abs())),
    }
}

fn round(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    let x = number("round", &args[0])?;
    match args.get(1) {
        None => match &args[0] {
            Value::Int(i) => Ok(Value::Int(*i)),
            _ => integral("round", x.round_ties_even()),
        },
        Some(Value::Int(digits)) => {
            let scale = 10f64.powi((*digits).clamp(-300, 300) as i32);
            let rounded = (x * scale).round_ties_even() / scale;
            match &args[0] {
                Value::Int(_) => Ok(Value::Int(rounded as i64)),
                _ => Ok(Value::Float(rounded)),
            }
        }
        Some(other) => Err(EvalError::mismatch("round()", format!("'{}'", other.type_name()))),
    }
}

fn ceil(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        other => integral("ceil", number("ceil", other)?.ceil()),
    }
}

fn floor(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        other => integral("floor", number("floor", other)?.floor()),
    }
}

fn sqrt(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    let x = number("sqrt", &args[0])?;
    if x < 0.0 {
        return Err(EvalError::MathDomain("sqrt".to_string()));
    }
    Ok(Value::Float(x.sqrt()))
}

fn pow(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    binary(BinOp::Pow, &args[0], &args[1])
}

fn math_pow(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    let base = number("pow", &args[0])?;
    let exponent = number("pow", &args[1])?;
    Ok(Value::Float(base.powf(exponent)))
}

fn fabs(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Float(number("fabs", &args[0])?.abs()))
}

fn exp(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Float(number("exp", &args[0])?.exp()))
}

fn log(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    let x = number("log", &args[0])?;
    if x <= 0.0 {
        return Err(EvalError::MathDomain("log".to_string()));
    }
    match args.get(1) {
        None => Ok(Value::Float(x.ln())),
        Some(base) => {
            let b = number("log", base)?;
            if b <= 0.0 || b == 1.0 {
                return Err(EvalError::MathDomain("log".to_string()));
            }
            Ok(Value::Float(x.ln() / b.ln()))
        }
    }
}

fn radians(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Float(number("radians", &args[0])?.to_radians()))
}

fn degrees(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Float(number("degrees", &args[0])?.to_degrees()))
}

fn sin(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Float(number("sin", &args[0])?.sin()))
}

fn cos(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Float(number("cos", &args[0])?.cos()))
}

fn tan(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Float(number("tan", &args[0])?.tan()))
}

fn atan(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Float(number("atan", &args[0])?.atan()))
}

// Explicit conversions. Unlike operators, these accept booleans.

fn to_int(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Float(f) => integral("int", f.trunc()),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| EvalError::mismatch("int()", format!("invalid literal '{}'", s))),
        other => Err(EvalError::mismatch("int()", format!("'{}'", other.type_name()))),
    }
}

fn to_float(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    match &args[0] {
        Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| EvalError::mismatch("float()", format!("invalid literal '{}'", s))),
        other => Ok(Value::Float(number("float", other)?)),
    }
}

fn to_str(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::String(args[0].to_string()))
}

fn to_bool(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Bool(args[0].truthy()?))
}

fn len(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    match &args[0] {
        Value::List(items) => Ok(Value::Int(items.len() as i64)),
        Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
        other => Err(EvalError::mismatch("len()", format!("'{}'", other.type_name()))),
    }
}

fn sum(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    let mut total = Value::Int(0);
    for item in list("sum", &args[0])? {
        total = binary(BinOp::Add, &total, item)?;
    }
    Ok(total)
}

fn any(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    for item in list("any", &args[0])? {
        if item.truthy()? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn all(_ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    for item in list("all", &args[0])? {
        if !item.truthy()? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}
