//! Validation state of a resolved setting value.
//!
//! The state is the `validationState` property of every non-category key. It
//! compares the resolved `value` against the resolved bounds:
//!
//! | Check                                   | State          |
//! |-----------------------------------------|----------------|
//! | value or a bound failed to evaluate     | `error`        |
//! | `maximum_value < minimum_value`         | `error`        |
//! | enum value not among the options        | `error`        |
//! | `value < minimum_value`                 | `exceeds_min`  |
//! | `value > maximum_value`                 | `exceeds_max`  |
//! | outside either warning bound            | `warning`      |
//! | otherwise                               | `valid`        |
//!
//! All comparisons are strict: a value equal to a bound is inside it.

use serde::{Deserialize, Serialize};

use crate::definition::{Bound, SettingDefinition};
use crate::error::EvalError;
use crate::resolver::Resolver;
use crate::setting_id::{PropertyId, StackId};
use crate::value::{SettingType, Value};

/// Name of the computed property carrying the state.
pub const VALIDATION_STATE: &str = "validationState";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Valid,
    Warning,
    Error,
    ExceedsMin,
    ExceedsMax,
}

impl ValidationState {
    pub fn tag(self) -> &'static str {
        match self {
            ValidationState::Valid => "valid",
            ValidationState::Warning => "warning",
            ValidationState::Error => "error",
            ValidationState::ExceedsMin => "exceeds_min",
            ValidationState::ExceedsMax => "exceeds_max",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        [
            ValidationState::Valid,
            ValidationState::Warning,
            ValidationState::Error,
            ValidationState::ExceedsMin,
            ValidationState::ExceedsMax,
        ]
        .into_iter()
        .find(|s| s.tag() == tag)
    }

    pub fn is_valid(self) -> bool {
        self == ValidationState::Valid
    }

    /// Error-level states block slicing; warnings do not.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ValidationState::Error | ValidationState::ExceedsMin | ValidationState::ExceedsMax
        )
    }
}

impl std::fmt::Display for ValidationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Compute the state of `definition` as seen through `stack`.
///
/// Failures of the value or of a bound become `Error`, except failures that
/// depend on the evaluation chain; those propagate so the state is not cached.
pub(crate) fn compute(
    resolver: &mut Resolver<'_>,
    stack: StackId,
    definition: &SettingDefinition,
) -> Result<ValidationState, EvalError> {
    let key = definition.key.as_str();

    let value = match resolver.get(PropertyId::new(stack, key, "value")) {
        Ok(Some(v)) if !v.is_undefined() => v,
        Ok(_) => return Ok(ValidationState::Error),
        Err(e) if e.is_chain_dependent() => return Err(e),
        Err(e) => {
            tracing::debug!(key, error = %e, "value failed; validation state is error");
            return Ok(ValidationState::Error);
        }
    };

    if definition.setting_type == SettingType::Enum {
        return Ok(match value.as_str() {
            Some(option) if definition.options.is_empty() || definition.has_option(option) => ValidationState::Valid,
            _ => ValidationState::Error,
        });
    }

    let Some(number) = value.as_f64() else {
        return Ok(ValidationState::Valid);
    };

    let mut bounds = [None; 4];
    for (slot, bound) in bounds.iter_mut().zip(Bound::ALL) {
        if definition.bound(bound).is_none() {
            continue;
        }
        match resolver.get(PropertyId::new(stack, key, bound.property())) {
            Ok(Some(Value::Undefined)) | Ok(None) => {}
            Ok(Some(v)) => match v.as_f64() {
                Some(n) => *slot = Some(n),
                None => return Ok(ValidationState::Error),
            },
            Err(e) if e.is_chain_dependent() => return Err(e),
            Err(e) => {
                tracing::debug!(key, bound = bound.property(), error = %e, "bound failed; validation state is error");
                return Ok(ValidationState::Error);
            }
        }
    }
    let [min, max, min_warning, max_warning] = bounds;

    Ok(classify(number, min, max, min_warning, max_warning))
}

fn classify(
    value: f64,
    min: Option<f64>,
    max: Option<f64>,
    min_warning: Option<f64>,
    max_warning: Option<f64>,
) -> ValidationState {
    if value.is_nan() {
        return ValidationState::Error;
    }
    if let (Some(min), Some(max)) = (min, max) {
        if max < min {
            return ValidationState::Error;
        }
    }
    if min.is_some_and(|m| value < m) {
        return ValidationState::ExceedsMin;
    }
    if max.is_some_and(|m| value > m) {
        return ValidationState::ExceedsMax;
    }
    if min_warning.is_some_and(|m| value < m) || max_warning.is_some_and(|m| value > m) {
        return ValidationState::Warning;
    }
    ValidationState::Valid
}
