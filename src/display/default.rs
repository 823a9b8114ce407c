//! `prefix`-style terminal display: each message line is prefixed with the
//! action's name and a one-character status mark; a banner line is
//! printed when an action finishes.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, bail};
use async_trait::async_trait;

use crate::action::{Action, ActionStatus};
use crate::workflow::Workflow;

use super::color::{paint, status_color, status_mark, Color};
use super::Display;

pub struct PrefixDisplay {
    use_color: bool,
    interactive: bool,
    name_width: AtomicUsize,
}

impl PrefixDisplay {
    pub fn new(use_color: bool, interactive: bool) -> Self {
        Self { use_color, interactive, name_width: AtomicUsize::new(0) }
    }

    fn width_for(&self, name: &str) -> usize {
        self.name_width.fetch_max(name.len(), Ordering::Relaxed).max(name.len())
    }

    fn prefix(&self, action: &Action, status: ActionStatus) -> String {
        let width = self.width_for(&action.name);
        let mark = status_mark(status);
        let label = format!("{:<width$} {mark}", action.name, width = width);
        paint(&label, status_color(status), self.use_color)
    }
}

#[async_trait]
impl Display for PrefixDisplay {
    async fn on_plan_interaction(&self, workflow: &Workflow) -> anyhow::Result<()> {
        if !self.interactive {
            return Ok(());
        }
        let selectable: Vec<&std::sync::Arc<Action>> =
            workflow.actions.values().filter(|a| a.selectable).collect();
        if selectable.is_empty() {
            bail!("interactive mode requested but no action is selectable");
        }

        let mut seen = std::collections::HashSet::new();
        for action in workflow.actions.values() {
            let full = format!("{}::{}", action.name, action.description.as_deref().unwrap_or(""));
            if !seen.insert(full) {
                bail!("two actions share the same name and description; cannot disambiguate interactively");
            }
        }

        let labels: Vec<String> = selectable.iter().map(|a| a.name.clone()).collect();
        let chosen = tokio::task::spawn_blocking(move || {
            inquire::MultiSelect::new("Select actions to run:", labels.clone())
                .with_default(&(0..labels.len()).collect::<Vec<_>>())
                .prompt()
        })
        .await
        .map_err(|e| anyhow!("interactive prompt panicked: {e}"))??;

        let chosen: std::collections::HashSet<String> = chosen.into_iter().collect();
        for action in selectable {
            if !chosen.contains(&action.name) {
                action.disable().await?;
            }
        }
        Ok(())
    }

    async fn on_action_start(&self, action: &Action) -> anyhow::Result<()> {
        let label = self.prefix(action, ActionStatus::Running);
        println!("{label} starting");
        Ok(())
    }

    async fn on_action_finish(&self, action: &Action) -> anyhow::Result<()> {
        let status = action.status().await;
        let label = self.prefix(action, status);
        println!("{label} finished: {status:?}");
        Ok(())
    }

    async fn emit_action_message(&self, action: &Action, message: &str, is_stderr: bool) -> anyhow::Result<()> {
        let status = action.status().await;
        let label = self.prefix(action, status);
        if is_stderr {
            eprintln!("{} {}", label, paint(message, Color::Red, self.use_color));
        } else {
            println!("{label} {message}");
        }
        Ok(())
    }

    async fn emit_action_error(&self, action: &Action, message: &str) -> anyhow::Result<()> {
        let label = self.prefix(action, ActionStatus::Failure);
        eprintln!("{} {}", label, paint(message, Color::Red, self.use_color));
        Ok(())
    }
}
