// Setting values and type coercion

use serde::{Deserialize, Serialize, Serializer};

use crate::error::EvalError;

// =============================================================================
// Value: the closed tagged union every property resolves to
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    String(String),
    List(Vec<Value>),
    /// Sentinel for "could not be computed" (and the `None` literal).
    #[default]
    Undefined,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Float(_) => "float",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::String(_) => "str",
            Value::List(_) => "list",
            Value::Undefined => "undefined",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Numeric view of Int/Float. Booleans are deliberately not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness as used by conditionals and boolean operators.
    pub fn truthy(&self) -> Result<bool, EvalError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Float(f) => Ok(*f != 0.0),
            Value::String(s) => Ok(!s.is_empty()),
            Value::List(items) => Ok(!items.is_empty()),
            Value::Undefined => Err(EvalError::mismatch("truth test", "'undefined'")),
        }
    }

    /// Build a literal from a JSON scalar/array as supplied by profile loaders.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Undefined,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            // Objects have no value representation; keep their text.
            serde_json::Value::Object(_) => Value::String(json.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Undefined => serde_json::Value::Null,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Float(n) => {
                if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{:.1}", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Int(i) => write!(f, "{}", i),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match item {
                        Value::String(s) => write!(f, "'{}'", s)?,
                        other => write!(f, "{}", other)?,
                    }
                }
                write!(f, "]")
            }
            Value::Undefined => write!(f, "None"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

// =============================================================================
// Setting types and coercion
// =============================================================================

/// Declared type of a setting definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingType {
    /// Grouping node in the settings tree; carries no value.
    Category,
    Float,
    Int,
    Bool,
    Str,
    Enum,
    Vector,
    /// Extruder position (>= 0).
    Extruder,
    /// Extruder position or -1 for "not set".
    OptionalExtruder,
}

impl SettingType {
    /// Parse a definition type tag. Returns None for unknown tags.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "category" => SettingType::Category,
            "float" => SettingType::Float,
            "int" => SettingType::Int,
            "bool" => SettingType::Bool,
            "str" | "string" => SettingType::Str,
            "enum" => SettingType::Enum,
            "vector" | "polygon" | "polygons" | "[int]" => SettingType::Vector,
            "extruder" => SettingType::Extruder,
            "optional_extruder" => SettingType::OptionalExtruder,
            _ => return None,
        })
    }

    pub fn tag(self) -> &'static str {
        match self {
            SettingType::Category => "category",
            SettingType::Float => "float",
            SettingType::Int => "int",
            SettingType::Bool => "bool",
            SettingType::Str => "str",
            SettingType::Enum => "enum",
            SettingType::Vector => "vector",
            SettingType::Extruder => "extruder",
            SettingType::OptionalExtruder => "optional_extruder",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, SettingType::Float | SettingType::Int)
    }
}

/// How a float result becomes an int setting value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntCoercion {
    /// Toward zero, like a C cast. Downstream min/max comparisons rely on it.
    #[default]
    Truncate,
    /// Half away from zero.
    Round,
}

impl IntCoercion {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "truncate" => Some(IntCoercion::Truncate),
            "round" => Some(IntCoercion::Round),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            IntCoercion::Truncate => "truncate",
            IntCoercion::Round => "round",
        }
    }

    fn apply(self, f: f64) -> f64 {
        match self {
            IntCoercion::Truncate => f.trunc(),
            IntCoercion::Round => f.round(),
        }
    }
}

/// Coerce a resolved value to a setting's declared type.
///
/// Undefined passes through untouched; a value that cannot be represented in
/// the target type is a `TypeMismatch`.
pub fn coerce(value: Value, ty: SettingType, rounding: IntCoercion) -> Result<Value, EvalError> {
    if value.is_undefined() {
        return Ok(value);
    }
    let fail = |v: &Value| EvalError::mismatch(&format!("coerce to {}", ty.tag()), format!("'{}'", v.type_name()));

    match ty {
        SettingType::Category => Ok(Value::Undefined),
        SettingType::Float => match value {
            Value::Float(_) => Ok(value),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::String(ref s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| fail(&value)),
            other => Err(fail(&other)),
        },
        SettingType::Int | SettingType::Extruder | SettingType::OptionalExtruder => {
            let coerced = match value {
                Value::Int(_) => value,
                Value::Float(f) if f.is_finite() => Value::Int(rounding.apply(f) as i64),
                Value::String(ref s) => match s.trim().parse::<i64>() {
                    Ok(i) => Value::Int(i),
                    Err(_) => match s.trim().parse::<f64>() {
                        Ok(f) if f.is_finite() => Value::Int(rounding.apply(f) as i64),
                        _ => return Err(fail(&value)),
                    },
                },
                other => return Err(fail(&other)),
            };
            Ok(coerced)
        }
        SettingType::Bool => match value {
            Value::Bool(_) => Ok(value),
            Value::Int(i) => Ok(Value::Bool(i != 0)),
            Value::Float(f) => Ok(Value::Bool(f != 0.0)),
            Value::String(ref s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(fail(&value)),
            },
            other => Err(fail(&other)),
        },
        SettingType::Str | SettingType::Enum => match value {
            Value::String(_) => Ok(value),
            Value::List(_) => Err(fail(&value)),
            other => Ok(Value::String(other.to_string())),
        },
        SettingType::Vector => match value {
            Value::List(_) => Ok(value),
            Value::String(ref s) => match serde_json::from_str::<serde_json::Value>(s) {
                Ok(json @ serde_json::Value::Array(_)) => Ok(Value::from_json(&json)),
                _ => Err(fail(&value)),
            },
            other => Err(fail(&other)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_coercion_truncates_by_default() {
        let v = coerce(Value::Float(2.9), SettingType::Int, IntCoercion::Truncate).unwrap();
        assert_eq!(v, Value::Int(2));
        let v = coerce(Value::Float(-2.9), SettingType::Int, IntCoercion::Truncate).unwrap();
        assert_eq!(v, Value::Int(-2));
    }

    #[test]
    fn test_int_coercion_round() {
        let v = coerce(Value::Float(2.5), SettingType::Int, IntCoercion::Round).unwrap();
        assert_eq!(v, Value::Int(3));
    }

    #[test]
    fn test_float_from_int_and_string() {
        assert_eq!(coerce(Value::Int(3), SettingType::Float, IntCoercion::Truncate).unwrap(), Value::Float(3.0));
        assert_eq!(
            coerce(Value::String("0.15".into()), SettingType::Float, IntCoercion::Truncate).unwrap(),
            Value::Float(0.15)
        );
    }

    #[test]
    fn test_bool_coercion_rejects_garbage() {
        let err = coerce(Value::String("maybe".into()), SettingType::Bool, IntCoercion::Truncate).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
    }

    #[test]
    fn test_extruder_from_string() {
        let v = coerce(Value::String("1".into()), SettingType::Extruder, IntCoercion::Truncate).unwrap();
        assert_eq!(v, Value::Int(1));
    }

    #[test]
    fn test_undefined_passes_through() {
        let v = coerce(Value::Undefined, SettingType::Float, IntCoercion::Truncate).unwrap();
        assert!(v.is_undefined());
    }

    #[test]
    fn test_vector_from_json_text() {
        let v = coerce(Value::String("[[1, 2], [3, 4]]".into()), SettingType::Vector, IntCoercion::Truncate).unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::List(vec![Value::Int(1), Value::Int(2)]),
                Value::List(vec![Value::Int(3), Value::Int(4)]),
            ])
        );
    }

    #[test]
    fn test_display_is_python_like() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(0.4).to_string(), "0.4");
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(Value::List(vec![Value::Int(1), Value::String("a".into())]).to_string(), "[1, 'a']");
    }

    #[test]
    fn test_json_roundtrip_of_scalars() {
        let json = serde_json::json!({"a": 1, "b": 0.5, "c": true, "d": "x"});
        let obj = json.as_object().unwrap();
        assert_eq!(Value::from_json(&obj["a"]), Value::Int(1));
        assert_eq!(Value::from_json(&obj["b"]), Value::Float(0.5));
        assert_eq!(Value::from_json(&obj["c"]), Value::Bool(true));
        assert_eq!(Value::from_json(&obj["d"]).to_json(), obj["d"]);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Int(0).truthy().unwrap());
        assert!(Value::String("x".into()).truthy().unwrap());
        assert!(Value::Undefined.truthy().is_err());
    }

    #[test]
    fn test_type_tags() {
        assert_eq!(SettingType::from_tag("polygons"), Some(SettingType::Vector));
        assert_eq!(SettingType::from_tag("str"), Some(SettingType::Str));
        assert_eq!(SettingType::from_tag("colour"), None);
    }
}
