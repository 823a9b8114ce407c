//! The display sink: the pluggable consumer of action events and
//! lifecycle callbacks. Only the bundled `prefix` implementation ships
//! here; the contract is what the orchestrator depends on.

pub mod color;
pub mod default;

use async_trait::async_trait;

use crate::action::Action;
use crate::workflow::Workflow;

/// Any callback may fail; the orchestrator logs the error and continues
/// (§6 — a misbehaving display must never abort a run).
#[async_trait]
pub trait Display: Send + Sync {
    async fn on_runner_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_runner_finish(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Mediates interactive action selection; implementations call
    /// `action.disable()` on everything the user deselects.
    async fn on_plan_interaction(&self, workflow: &Workflow) -> anyhow::Result<()> {
        let _ = workflow;
        Ok(())
    }

    async fn on_action_start(&self, action: &Action) -> anyhow::Result<()>;
    async fn on_action_finish(&self, action: &Action) -> anyhow::Result<()>;
    async fn emit_action_message(&self, action: &Action, message: &str, is_stderr: bool) -> anyhow::Result<()>;
    async fn emit_action_error(&self, action: &Action, message: &str) -> anyhow::Result<()>;
}

pub use default::PrefixDisplay;

pub fn build(name: &str, use_color: bool, interactive: bool) -> Result<Box<dyn Display>, String> {
    match name {
        "prefixes" => Ok(Box::new(PrefixDisplay::new(use_color, interactive))),
        other => Err(format!("Unrecognized display: {other:?}")),
    }
}
