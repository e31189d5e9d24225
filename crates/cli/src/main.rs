// Strata CLI - headless setting resolution for slicer machines

mod exit_codes;
mod machine;
mod output;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use strata_engine::{ConfigError, EngineConfig, StackError, StackKind, ValidationState};

use exit_codes::{
    stack_exit_code, EXIT_CONFIG, EXIT_DEFINITION, EXIT_ERROR, EXIT_IO, EXIT_MACHINE, EXIT_PROFILE,
    EXIT_SNAPSHOT_INCOMPLETE, EXIT_SUCCESS, EXIT_UNKNOWN_SETTING, EXIT_USAGE, EXIT_VALIDATION,
};
use machine::{LoadError, LoadedMachine};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Resolve slicer settings for a machine (headless)")]
#[command(version)]
struct Cli {
    /// Engine config file (TOML). Defaults to <config dir>/strata/config.toml when present.
    #[arg(long, global = true, env = "STRATA_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `strata_engine=debug`. Overrides the config file.
    #[arg(long, global = true, env = "STRATA_LOG", value_name = "FILTER")]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print resolved properties of one or more keys
    #[command(after_help = "\
Examples:
  strata resolve -m machine.json layer_height wall_line_count
  strata resolve -m machine.json -e 1 material_print_temperature
  strata resolve -m machine.json -p validationState layer_height
  strata resolve -m machine.json --json speed_print speed_travel")]
    Resolve {
        /// Machine description file
        #[arg(long, short = 'm')]
        machine: PathBuf,

        /// Resolve on this extruder's stack instead of the global stack
        #[arg(long, short = 'e')]
        extruder: Option<i64>,

        /// Property to resolve
        #[arg(long, short = 'p', default_value = "value")]
        property: String,

        /// Emit a JSON object instead of `key = value` lines
        #[arg(long)]
        json: bool,

        /// Setting keys
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Report keys whose validation state is not `valid` (exit 12 on errors)
    Validate {
        #[arg(long, short = 'm')]
        machine: PathBuf,

        /// Also list valid keys
        #[arg(long)]
        all: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show which layer supplies a key's value
    Explain {
        #[arg(long, short = 'm')]
        machine: PathBuf,

        #[arg(long, short = 'e')]
        extruder: Option<i64>,

        #[arg(long)]
        json: bool,

        key: String,
    },

    /// Resolve every enabled key of one stack to JSON
    #[command(after_help = "\
Exit code 13 means some enabled keys failed to resolve; they are left out of
the output and reported on stderr.")]
    Snapshot {
        #[arg(long, short = 'm')]
        machine: PathBuf,

        #[arg(long, short = 'e')]
        extruder: Option<i64>,

        /// Single-line JSON
        #[arg(long)]
        compact: bool,
    },

    /// List formula functions and constants
    Functions {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref()).and_then(|config| {
        init_logging(cli.log.as_deref(), &config);
        run(cli.command, config)
    });

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

fn run(command: Commands, config: EngineConfig) -> Result<(), CliError> {
    match command {
        Commands::Resolve {
            machine,
            extruder,
            property,
            json,
            keys,
        } => cmd_resolve(&machine, config, extruder, &property, json, &keys),
        Commands::Validate { machine, all, json } => cmd_validate(&machine, config, all, json),
        Commands::Explain {
            machine,
            extruder,
            json,
            key,
        } => cmd_explain(&machine, config, extruder, json, &key),
        Commands::Snapshot {
            machine,
            extruder,
            compact,
        } => cmd_snapshot(&machine, config, extruder, compact),
        Commands::Functions { json } => cmd_functions(config, json),
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), hint: None }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(EXIT_IO, msg)
    }

    /// Failure already reported on stderr; only the exit code remains.
    pub fn silent(code: u8) -> Self {
        Self::new(code, "")
    }

    pub fn stack(err: StackError) -> Self {
        let hint = match &err {
            StackError::ExtruderIndexOutOfRange { count, .. } => {
                Some(format!("the machine has {} extruder(s), numbered from 0", count))
            }
            _ => None,
        };
        Self { code: stack_exit_code(&err), message: err.to_string(), hint }
    }

    pub fn config(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::Io { .. } => EXIT_IO,
            ConfigError::Parse(_) | ConfigError::Validation(_) => EXIT_CONFIG,
        };
        Self::new(code, err.to_string())
    }

    pub fn load(err: LoadError) -> Self {
        let code = match &err {
            LoadError::Io { .. } => EXIT_IO,
            LoadError::Json { .. } | LoadError::Machine(_) => EXIT_MACHINE,
            LoadError::Definition { .. } => EXIT_DEFINITION,
            LoadError::Profile { .. } => EXIT_PROFILE,
            LoadError::Stack(e) => stack_exit_code(e),
        };
        let hint = match &err {
            LoadError::Io { .. } => Some("paths in machine.json are relative to the machine file".to_string()),
            _ => None,
        };
        Self { code, message: err.to_string(), hint }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// ============================================================================
// config & logging
// ============================================================================

fn load_config(explicit: Option<&Path>) -> Result<EngineConfig, CliError> {
    if let Some(path) = explicit {
        return EngineConfig::load(path).map_err(CliError::config);
    }
    match dirs::config_dir().map(|d| d.join("strata").join("config.toml")) {
        Some(path) if path.is_file() => EngineConfig::load(&path)
            .map_err(CliError::config)
            .map_err(|e| e.with_hint(format!("loaded by default from {}", path.display()))),
        _ => Ok(EngineConfig::default()),
    }
}

/// Filter precedence: `--log`, then `STRATA_LOG` (both via clap), then the
/// config file's `logging.filter`.
fn init_logging(flag: Option<&str>, config: &EngineConfig) {
    let directive = flag.unwrap_or(&config.logging.filter);
    let filter = match EnvFilter::try_new(directive) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("warning: ignoring log filter '{}': {}", directive, e);
            EnvFilter::new("warn")
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn load_machine(path: &Path, config: EngineConfig) -> Result<LoadedMachine, CliError> {
    machine::load(path, config).map_err(CliError::load)
}

// ============================================================================
// resolve
// ============================================================================

fn cmd_resolve(
    path: &Path,
    config: EngineConfig,
    extruder: Option<i64>,
    property: &str,
    json: bool,
    keys: &[String],
) -> Result<(), CliError> {
    let machine = load_machine(path, config)?;
    let stack = machine.stack(extruder).map_err(CliError::stack)?;
    let definition = machine.engine.stack(stack).map_err(CliError::stack)?.definition().clone();

    let mut failure: Option<u8> = None;
    let mut lines = Vec::with_capacity(keys.len());
    let mut object = serde_json::Map::new();

    for key in keys {
        if !definition.contains(key) {
            eprintln!("error: unknown setting '{}'", key);
            failure.get_or_insert(EXIT_UNKNOWN_SETTING);
            continue;
        }
        match machine.engine.try_get_property(stack, key, property) {
            Ok(Some(value)) => {
                lines.push(format!("{} = {}", key, output::value_text(&value)));
                object.insert(key.clone(), value.to_json());
            }
            Ok(None) => {
                lines.push(format!("{} = <none>", key));
                object.insert(key.clone(), serde_json::Value::Null);
            }
            Err(e) => {
                eprintln!("error: {}: {}", key, e);
                failure.get_or_insert(stack_exit_code(&e));
            }
        }
    }

    if json {
        output::print_json(&serde_json::Value::Object(object), false)?;
    } else {
        output::print_lines(lines)?;
    }
    match failure {
        Some(code) => Err(CliError::silent(code)),
        None => Ok(()),
    }
}

// ============================================================================
// validate
// ============================================================================

fn cmd_validate(path: &Path, config: EngineConfig, all: bool, json: bool) -> Result<(), CliError> {
    let machine = load_machine(path, config)?;
    let engine = &machine.engine;

    let mut rows = Vec::new();
    let mut errors = 0usize;
    for (stack, name) in machine.stacks() {
        let container_stack = engine.stack(stack).map_err(CliError::stack)?;
        let is_extruder = matches!(container_stack.kind(), StackKind::Extruder { .. });
        for setting in container_stack.definition().iter() {
            if setting.is_category() || (is_extruder && !setting.settable_per_extruder) {
                continue;
            }
            let key = setting.key.as_str();
            if engine.get_property(stack, key, "enabled") == Some(strata_engine::Value::Bool(false)) {
                continue;
            }
            let state = engine.validation_state(stack, key).map_err(CliError::stack)?;
            if state.is_error() {
                errors += 1;
            }
            if state != ValidationState::Valid || all {
                let value = engine.value(stack, key).unwrap_or_default();
                rows.push((name.clone(), key.to_string(), state, value));
            }
        }
    }

    if json {
        let items: Vec<serde_json::Value> = rows
            .iter()
            .map(|(stack, key, state, value)| {
                serde_json::json!({
                    "stack": stack,
                    "key": key,
                    "state": state.tag(),
                    "value": value.to_json(),
                })
            })
            .collect();
        output::print_json(&serde_json::Value::Array(items), false)?;
    } else {
        output::print_lines(rows.iter().map(|(stack, key, state, value)| {
            format!("{:<14} {:<32} {:<12} {}", stack, key, state.tag(), output::value_text(value))
        }))?;
    }

    tracing::info!(reported = rows.len(), errors, "validation finished");
    if errors > 0 {
        return Err(CliError::new(EXIT_VALIDATION, format!("{} setting(s) failed validation", errors)));
    }
    Ok(())
}

// ============================================================================
// explain
// ============================================================================

fn cmd_explain(
    path: &Path,
    config: EngineConfig,
    extruder: Option<i64>,
    json: bool,
    key: &str,
) -> Result<(), CliError> {
    let machine = load_machine(path, config)?;
    let stack = machine.stack(extruder).map_err(CliError::stack)?;
    let explanation = machine.engine.explain(stack, key).map_err(CliError::stack)?;

    if json {
        let value = match &explanation.value {
            Ok(Some(v)) => serde_json::json!({"value": v.to_json()}),
            Ok(None) => serde_json::json!({"value": null}),
            Err(e) => serde_json::json!({"error": e.to_string()}),
        };
        let body = serde_json::json!({
            "key": explanation.key,
            "stack": output::stack_name(&machine, explanation.stack),
            "result": value,
            "source": explanation.source.as_ref().map(|s| output::source_json(&machine, s)),
            "raw": explanation.raw.as_ref().map(|r| r.to_json()),
            "redirect": explanation.redirect.as_ref().map(|r| output::redirect_text(&machine, r)),
            "references": explanation.references,
        });
        return output::print_json(&body, false);
    }

    let mut lines = vec![
        format!("key:        {}", explanation.key),
        format!("stack:      {}", output::stack_name(&machine, explanation.stack)),
    ];
    lines.push(match &explanation.value {
        Ok(Some(v)) => format!("value:      {}", output::value_text(v)),
        Ok(None) => "value:      <none>".to_string(),
        Err(e) => format!("value:      <error: {}>", e),
    });
    if let Some(redirect) = &explanation.redirect {
        lines.push(format!("redirect:   {}", output::redirect_text(&machine, redirect)));
    }
    match (&explanation.source, &explanation.raw) {
        (Some(source), Some(raw)) => {
            lines.push(format!("source:     {}", output::source_text(&machine, source)));
            lines.push(format!("raw:        {}", raw));
        }
        _ => lines.push("source:     <none>".to_string()),
    }
    if !explanation.references.is_empty() {
        lines.push(format!("references: {}", explanation.references.join(", ")));
    }
    output::print_lines(lines)
}

// ============================================================================
// snapshot
// ============================================================================

fn cmd_snapshot(path: &Path, config: EngineConfig, extruder: Option<i64>, compact: bool) -> Result<(), CliError> {
    let machine = load_machine(path, config)?;
    let stack = machine.stack(extruder).map_err(CliError::stack)?;
    let snapshot = machine.engine.snapshot(stack).map_err(CliError::stack)?;

    output::print_json(&snapshot.to_json(), compact)?;

    if snapshot.is_complete() {
        return Ok(());
    }
    for (key, err) in &snapshot.errors {
        eprintln!("error: {}: {}", key, err);
    }
    Err(CliError::new(
        EXIT_SNAPSHOT_INCOMPLETE,
        format!("{} enabled setting(s) could not be resolved", snapshot.errors.len()),
    ))
}

// ============================================================================
// functions
// ============================================================================

fn cmd_functions(config: EngineConfig, json: bool) -> Result<(), CliError> {
    let engine = strata_engine::SettingsEngine::new(config);
    let registry = engine.functions();

    if json {
        let functions: Vec<serde_json::Value> = registry
            .functions()
            .into_iter()
            .map(|(name, entry)| {
                serde_json::json!({
                    "name": name,
                    "arity": entry.arity.to_string(),
                    "summary": entry.summary,
                })
            })
            .collect();
        let constants: serde_json::Map<String, serde_json::Value> = registry
            .constants()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect();
        return output::print_json(&serde_json::json!({"functions": functions, "constants": constants}), false);
    }

    let mut lines: Vec<String> = registry
        .functions()
        .into_iter()
        .map(|(name, entry)| format!("{:<28} {:<12} {}", name, entry.arity.to_string(), entry.summary))
        .collect();
    lines.extend(
        registry
            .constants()
            .into_iter()
            .map(|(name, value)| format!("{:<28} = {}", name, output::value_text(value))),
    );
    if lines.is_empty() {
        return Err(CliError::new(EXIT_ERROR, "function registry is empty"));
    }
    output::print_lines(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_stack_error_codes() {
        let err = CliError::stack(StackError::UnknownSetting {
            key: "x".into(),
            stack: strata_engine::StackId::from_raw(0),
        });
        assert_eq!(err.code, EXIT_UNKNOWN_SETTING);

        let err = CliError::stack(StackError::ExtruderIndexOutOfRange { index: 3, count: 2 });
        assert_eq!(err.code, EXIT_USAGE);
        assert!(err.hint.unwrap().contains("2 extruder"));
    }
}
