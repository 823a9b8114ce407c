//! Reference action kinds shipped with the runner: `echo` and `shell`.
//!
//! These exist as the vehicle the end-to-end scenarios exercise and as the
//! bundled loader's static factory table; concrete action kinds are
//! otherwise outside the core's concern (§6 only specifies the trait).

mod echo;
mod shell;

pub use echo::{EchoAction, EchoArgs};
pub use shell::{ShellAction, ShellArgs};

use crate::action::{Action, ActionBody, Dependency, Severity};
use indexmap::IndexMap;

/// Registered action-kind factories, keyed by the `type:` field in a loaded
/// workflow document.
pub fn build_action(
    type_name: &str,
    name: String,
    description: Option<String>,
    severity: Severity,
    selectable: bool,
    ancestors: IndexMap<String, Dependency>,
    args: serde_json::Value,
) -> Result<Action, String> {
    let body = build_body(type_name, args)?;
    Ok(Action::new(name, description, severity, selectable, ancestors, body))
}

/// Builds a kind's body from its (already rendered) argument tree. The
/// loader uses this once, through [`build_action`], to validate the
/// document at load time; the orchestrator calls it again at every
/// dispatch once outcomes are available to substitute into templates, and
/// swaps the result in via [`Action::replace_body`] before running it.
pub fn build_body(type_name: &str, args: serde_json::Value) -> Result<Box<dyn ActionBody>, String> {
    match type_name {
        "echo" => Ok(Box::new(EchoAction::from_value(args)?)),
        "shell" => Ok(Box::new(ShellAction::from_value(args)?)),
        other => Err(format!("Unrecognized action type: {other:?}")),
    }
}
