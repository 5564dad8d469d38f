//! Command word expansion
//!
//! The task command is a shell-like string expanded inside the grandchild
//! right before exec. Expansion is deliberately narrower than a shell:
//! variables come from the task environment only, command substitution
//! and shell control operators are refused outright, and an undefined
//! variable is an error rather than an empty string.

use std::borrow::Cow;

use crate::errors::{Result, TaskError};

/// Split a `KEY=VALUE` entry; entries without `=` are treated as a key
/// with an empty value
fn split_entry(entry: &str) -> (&str, &str) {
    match entry.split_once('=') {
        Some((key, value)) => (key, value),
        None => (entry, ""),
    }
}

/// Look up `key` in an ordered environment list, last entry wins
pub fn environ_lookup<'a>(environ: &'a [String], key: &str) -> Option<&'a str> {
    environ
        .iter()
        .rev()
        .map(|entry| split_entry(entry))
        .find(|(k, _)| *k == key)
        .map(|(_, value)| value)
}

/// Expand `command` into an argv against the task environment
pub fn expand_command(command: &str, environ: &[String]) -> Result<Vec<String>> {
    if command.contains("$(") || command.contains('`') {
        return Err(TaskError::invalid_value(
            "wordexp: command substitution is not supported",
        ));
    }

    if command.contains('\n') || command.contains(['|', '&', ';', '<', '>', '(', ')', '{', '}']) {
        return Err(TaskError::invalid_value(
            "wordexp: illegal occurrence of newline or one of |, &, ;, <, >, (, ), {, }",
        ));
    }

    let expanded = shellexpand::env_with_context(command, |name: &str| {
        match environ_lookup(environ, name) {
            Some(value) => Ok(Some(Cow::Borrowed(value))),
            None => Err(()),
        }
    })
    .map_err(|e| {
        TaskError::invalid_value(format!(
            "wordexp: undefined shell variable was referenced: {}",
            e.var_name
        ))
    })?;

    let argv = shlex::split(&expanded)
        .ok_or_else(|| TaskError::invalid_value("wordexp: syntax error in command"))?;

    if argv.is_empty() {
        return Err(TaskError::invalid_value("empty command after expansion"));
    }

    Ok(argv)
}
