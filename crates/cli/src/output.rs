// Output helpers shared by the commands: stdout writing, text and JSON forms.

use std::io::{self, Write};

use strata_engine::{LayerSource, Redirect, StackId, Value};

use crate::machine::LoadedMachine;
use crate::CliError;

/// Write lines to stdout, mapping a closed pipe to an I/O error.
pub fn print_lines<I, S>(lines: I) -> Result<(), CliError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    for line in lines {
        writeln!(handle, "{}", line.as_ref()).map_err(|e| CliError::io(e.to_string()))?;
    }
    Ok(())
}

/// Exactly one JSON value on stdout, pretty-printed unless `compact`.
pub fn print_json(value: &serde_json::Value, compact: bool) -> Result<(), CliError> {
    let text = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
    .map_err(|e| CliError::io(e.to_string()))?;
    print_lines([text])
}

/// Formula-style rendering: floats keep a decimal point, strings are bare.
pub fn value_text(value: &Value) -> String {
    value.to_string()
}

pub fn stack_name(machine: &LoadedMachine, stack: StackId) -> String {
    match machine.engine.stack(stack) {
        Ok(s) => s.name().to_string(),
        Err(_) => stack.to_string(),
    }
}

pub fn source_text(machine: &LoadedMachine, source: &LayerSource) -> String {
    match source {
        LayerSource::Container {
            stack,
            container_id,
            container_type,
        } => format!("{} '{}' on {}", container_type, container_id, stack_name(machine, *stack)),
        LayerSource::Definition { family } => format!("definition '{}'", family),
    }
}

pub fn source_json(machine: &LoadedMachine, source: &LayerSource) -> serde_json::Value {
    match source {
        LayerSource::Container {
            stack,
            container_id,
            container_type,
        } => serde_json::json!({
            "kind": "container",
            "stack": stack_name(machine, *stack),
            "container": container_id,
            "type": container_type.tag(),
        }),
        LayerSource::Definition { family } => serde_json::json!({
            "kind": "definition",
            "family": family,
        }),
    }
}

pub fn redirect_text(machine: &LoadedMachine, redirect: &Redirect) -> String {
    match redirect {
        Redirect::Delegate(next) => format!("not settable here; read from {}", stack_name(machine, *next)),
        Redirect::Resolve => "computed by the resolve formula".to_string(),
        Redirect::LimitToExtruder(target) => format!("limited to {}", stack_name(machine, *target)),
    }
}
