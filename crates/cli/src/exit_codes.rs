//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract: scripts rely on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain           | Description                              |
//! |---------|------------------|------------------------------------------|
//! | 0       | Universal        | Success                                  |
//! | 1       | Universal        | General error (unspecified)              |
//! | 2       | Universal        | CLI usage error (bad args, missing file) |
//! | 3-9     | load             | Config, definitions, profiles, machine   |
//! | 10-19   | resolve          | Unknown keys, failed formulas, validation|
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into the relevant command's error handling

use strata_engine::{EvalError, StackError};

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
/// Avoid using this; prefer a specific error code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Load (3-9)
// =============================================================================

/// A file named on the command line or by machine.json cannot be read.
pub const EXIT_IO: u8 = 3;

/// Config file failed to parse or validate.
pub const EXIT_CONFIG: u8 = 4;

/// A definition file is malformed, missing, or inherits in a cycle.
pub const EXIT_DEFINITION: u8 = 5;

/// A profile (instance container) file is malformed or has a bad formula.
pub const EXIT_PROFILE: u8 = 6;

/// machine.json, or a file it names, is not valid JSON, or the machine it
/// describes cannot be built.
pub const EXIT_MACHINE: u8 = 7;

// =============================================================================
// Resolve (10-19)
// =============================================================================

/// A requested key is not defined for the machine.
pub const EXIT_UNKNOWN_SETTING: u8 = 10;

/// A requested key's formula failed to evaluate.
pub const EXIT_EVAL: u8 = 11;

/// `validate` found at least one error-level validation state.
pub const EXIT_VALIDATION: u8 = 12;

/// `snapshot` could not resolve every enabled key.
pub const EXIT_SNAPSHOT_INCOMPLETE: u8 = 13;

// =============================================================================
// Engine Error Types
// =============================================================================

/// Map a StackError to its exit code.
pub fn stack_exit_code(err: &StackError) -> u8 {
    match err {
        StackError::UnknownSetting { .. } => EXIT_UNKNOWN_SETTING,
        StackError::Expression(e) => eval_exit_code(e),
        StackError::Definition(_) => EXIT_DEFINITION,
        StackError::ExtruderIndexOutOfRange { .. } => EXIT_USAGE,
        StackError::UnknownStack(_) | StackError::InvalidStackKind { .. } => EXIT_MACHINE,
        StackError::ReadOnlyKey { .. } => EXIT_PROFILE,
    }
}

pub fn eval_exit_code(err: &EvalError) -> u8 {
    match err {
        EvalError::Syntax { .. } => EXIT_PROFILE,
        _ => EXIT_EVAL,
    }
}
