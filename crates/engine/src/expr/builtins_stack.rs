// Cross-stack builtins: extruderValue, extruderValues, resolveOrValue,
// anyExtruderWithMaterial, anyExtruderNrWithOrDefault, defaultExtruderPosition

use super::eval::ResolutionContext;
use super::functions::{Arity, FunctionRegistry};
use crate::error::EvalError;
use crate::value::Value;

pub(crate) fn register(registry: &mut FunctionRegistry) {
    registry.register(
        "extruderValue",
        Arity::Exact(2),
        extruder_value,
        "Value of a setting in one extruder (-1: default extruder)",
    );
    registry.register(
        "extruderValues",
        Arity::Exact(1),
        extruder_values,
        "Values of a setting across all enabled extruders",
    );
    registry.register(
        "resolveOrValue",
        Arity::Exact(1),
        resolve_or_value,
        "Machine-wide resolved value of a setting",
    );
    registry.register(
        "anyExtruderWithMaterial",
        Arity::Exact(1),
        any_extruder_with_material,
        "True if any enabled extruder's material has a truthy metadata entry",
    );
    registry.register(
        "anyExtruderNrWithOrDefault",
        Arity::Exact(1),
        any_extruder_nr_with_or_default,
        "First enabled extruder where a setting is truthy, else the default extruder",
    );
    registry.register(
        "defaultExtruderPosition",
        Arity::Exact(0),
        default_extruder_position,
        "Position of the first enabled extruder",
    );
}

fn setting_key<'a>(function: &str, v: &'a Value) -> Result<&'a str, EvalError> {
    v.as_str()
        .ok_or_else(|| EvalError::mismatch(&format!("{}()", function), format!("'{}'", v.type_name())))
}

/// Extruder positions arrive as ints, integral floats, or numeric strings
/// (extruder settings are often stored as strings in profiles).
fn position(function: &str, v: &Value) -> Result<i64, EvalError> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| EvalError::mismatch(&format!("{}()", function), format!("position '{}'", s))),
        other => Err(EvalError::mismatch(&format!("{}()", function), format!("'{}'", other.type_name()))),
    }
}

fn extruder_value(ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    let index = position("extruderValue", &args[0])?;
    let key = setting_key("extruderValue", &args[1])?;
    ctx.extruder_value(index, key)
}

fn extruder_values(ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    let key = setting_key("extruderValues", &args[0])?;
    ctx.extruder_values(key).map(Value::List)
}

fn resolve_or_value(ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    let key = setting_key("resolveOrValue", &args[0])?;
    ctx.resolve_or_value(key)
}

fn any_extruder_with_material(ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    let entry = setting_key("anyExtruderWithMaterial", &args[0])?;
    let found = ctx.enabled_extruders().into_iter().any(|pos| {
        ctx.material_metadata(pos, entry)
            .map(|meta| Value::from_json(&meta).truthy().unwrap_or(false))
            .unwrap_or(false)
    });
    Ok(Value::Bool(found))
}

fn any_extruder_nr_with_or_default(ctx: &mut dyn ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
    let key = setting_key("anyExtruderNrWithOrDefault", &args[0])?;
    for pos in ctx.enabled_extruders() {
        if ctx.extruder_value(pos, key)?.truthy()? {
            return Ok(Value::Int(pos));
        }
    }
    Ok(Value::Int(ctx.default_extruder_position()))
}

fn default_extruder_position(ctx: &mut dyn ResolutionContext, _args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Int(ctx.default_extruder_position()))
}
