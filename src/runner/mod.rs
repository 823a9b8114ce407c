//! The run orchestrator: drives a [`Workflow`] to completion through a
//! [`Strategy`], rendering each action's arguments fresh at dispatch and
//! reporting through a [`Display`] sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::action::bundled::build_body;
use crate::action::{ActionStatus, EventItem};
use crate::display::Display;
use crate::errors::{BaseError, ExecutionFailed, InteractionError};
use crate::loader;
use crate::rendering::{DocValue, Templar};
use crate::strategy;
use crate::workflow::Workflow;

#[derive(Debug, Error)]
pub enum RunOutcome {
    #[error(transparent)]
    Base(#[from] BaseError),
    #[error(transparent)]
    ExecutionFailed(#[from] ExecutionFailed),
}

/// Drives `workflow` to completion.
///
/// `raw_args`/`type_names` are the loader's as-loaded argument trees and
/// action-kind names, keyed by action name — re-rendered and re-decoded
/// into a fresh body on every dispatch rather than once at load time.
pub async fn run(
    workflow: Arc<Workflow>,
    raw_args: &IndexMap<String, DocValue>,
    type_names: &IndexMap<String, String>,
    required_packages: &[String],
    display: Arc<dyn Display>,
    strategy_name: &str,
    strict_outcomes_rendering: bool,
) -> Result<(), RunOutcome> {
    loader::check_requirements(required_packages).map_err(BaseError::from)?;

    if let Err(e) = display.on_runner_start().await {
        tracing::warn!(error = %e, "on_runner_start failed");
    }

    display
        .on_plan_interaction(&workflow)
        .await
        .map_err(|e| BaseError::Interaction(InteractionError(e.to_string())))?;

    let environment: HashMap<String, String> = std::env::vars().collect();
    let mut strategy = strategy::build(strategy_name, workflow.clone())
        .map_err(|e| BaseError::Interaction(InteractionError(e)))?;

    let failed = Arc::new(AtomicBool::new(false));
    let mut tasks = Vec::new();

    while let Some(action) = strategy.next().await {
        if !action.enabled().await {
            action.omit().await;
            continue;
        }

        let mut outcomes = IndexMap::new();
        let mut statuses = IndexMap::new();
        for (name, a) in &workflow.actions {
            outcomes.insert(name.clone(), a.outcomes().await);
            statuses.insert(name.clone(), a.status().await);
        }
        let templar = Templar::new(outcomes, statuses, &workflow.context, environment.clone(), strict_outcomes_rendering);

        let args = raw_args.get(&action.name).cloned().unwrap_or(DocValue::Map(IndexMap::new()));
        let rendered = match templar.recursive_render(&args) {
            Ok(value) => value,
            Err(e) => {
                let _ = display.emit_action_error(&action, &e.to_string()).await;
                action.force_fail(e.to_string()).await;
                failed.store(true, Ordering::SeqCst);
                continue;
            }
        };

        let type_name = type_names.get(&action.name).cloned().unwrap_or_default();
        let body = match build_body(&type_name, rendered) {
            Ok(body) => body,
            Err(e) => {
                let _ = display.emit_action_error(&action, &e).await;
                action.force_fail(e).await;
                failed.store(true, Ordering::SeqCst);
                continue;
            }
        };
        action.replace_body(body).await;

        let action = action.clone();
        let display = display.clone();
        let failed = failed.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = display.on_action_start(&action).await {
                tracing::warn!(error = %e, action = %action.name, "on_action_start failed");
            }

            let drain_action = action.clone();
            let drain_display = display.clone();
            let drainer = tokio::spawn(async move {
                while let Some(event) = drain_action.next_event().await {
                    let (message, is_stderr) = match &event {
                        EventItem::Message(m) => (m.as_str(), false),
                        EventItem::Stderr(m) => (m.as_str(), true),
                    };
                    if let Err(e) = drain_display.emit_action_message(&drain_action, message, is_stderr).await {
                        tracing::warn!(error = %e, action = %drain_action.name, "emit_action_message failed");
                    }
                }
            });

            action.execute().await;
            let _ = drainer.await;

            let status = action.status().await;
            if status == ActionStatus::Failure || status == ActionStatus::Warning {
                let message = action.error_message().await.unwrap_or_default();
                if let Err(e) = display.emit_action_error(&action, &message).await {
                    tracing::warn!(error = %e, action = %action.name, "emit_action_error failed");
                }
                if status == ActionStatus::Failure {
                    failed.store(true, Ordering::SeqCst);
                }
            }

            if let Err(e) = display.on_action_finish(&action).await {
                tracing::warn!(error = %e, action = %action.name, "on_action_finish failed");
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }

    if let Err(e) = display.on_runner_finish().await {
        tracing::warn!(error = %e, "on_runner_finish failed");
    }

    if failed.load(Ordering::SeqCst) {
        return Err(ExecutionFailed.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    use crate::loader;
    use crate::workflow::Workflow;

    /// Records every callback instead of printing, so tests can assert on
    /// what the orchestrator reported without touching stdout.
    #[derive(Default)]
    struct RecordingDisplay {
        messages: StdMutex<Vec<String>>,
        errors: StdMutex<Vec<String>>,
        started: StdMutex<Vec<String>>,
        finished: StdMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Display for RecordingDisplay {
        async fn on_action_start(&self, action: &crate::action::Action) -> anyhow::Result<()> {
            self.started.lock().unwrap().push(action.name.clone());
            Ok(())
        }

        async fn on_action_finish(&self, action: &crate::action::Action) -> anyhow::Result<()> {
            self.finished.lock().unwrap().push(action.name.clone());
            Ok(())
        }

        async fn emit_action_message(
            &self,
            action: &crate::action::Action,
            message: &str,
            _is_stderr: bool,
        ) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push(format!("{}: {message}", action.name));
            Ok(())
        }

        async fn emit_action_error(&self, action: &crate::action::Action, message: &str) -> anyhow::Result<()> {
            self.errors.lock().unwrap().push(format!("{}: {message}", action.name));
            Ok(())
        }
    }

    fn workflow_from(yaml: &str) -> (Arc<Workflow>, IndexMap<String, DocValue>, IndexMap<String, String>) {
        let loaded = loader::load_from_str(yaml, Path::new(".")).unwrap();
        let raw_args = loaded.raw_args.clone();
        let type_names = loaded.type_names.clone();
        let workflow = Arc::new(Workflow::new(loaded.actions, loaded.context).unwrap());
        (workflow, raw_args, type_names)
    }

    #[tokio::test]
    async fn echo_happy_path_reports_start_message_and_finish() {
        let (workflow, raw_args, type_names) = workflow_from(
            r#"
actions:
  - name: greet
    type: echo
    message: hello
"#,
        );
        let display = Arc::new(RecordingDisplay::default());
        run(workflow, &raw_args, &type_names, &[], display.clone(), "free", false).await.unwrap();

        assert_eq!(display.started.lock().unwrap().as_slice(), ["greet"]);
        assert_eq!(display.finished.lock().unwrap().as_slice(), ["greet"]);
        assert_eq!(display.messages.lock().unwrap().as_slice(), ["greet: hello"]);
        assert!(display.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatch_time_rendering_sees_ancestor_outcome() {
        let (workflow, raw_args, type_names) = workflow_from(
            r#"
actions:
  - name: produce
    type: shell
    command: "yield_outcome greeting hi"
  - name: consume
    type: echo
    message: "@{outcomes.produce.greeting}"
    expects:
      - name: produce
        strict: true
"#,
        );
        let display = Arc::new(RecordingDisplay::default());
        run(workflow, &raw_args, &type_names, &[], display.clone(), "strict", false).await.unwrap();

        let messages = display.messages.lock().unwrap();
        assert!(messages.iter().any(|m| m == "consume: hi"), "messages: {messages:?}");
    }

    #[tokio::test]
    async fn failing_action_yields_execution_failed() {
        let (workflow, raw_args, type_names) = workflow_from(
            r#"
actions:
  - name: broken
    type: shell
    command: "exit 1"
"#,
        );
        let display = Arc::new(RecordingDisplay::default());
        let result = run(workflow, &raw_args, &type_names, &[], display, "free", false).await;
        assert!(matches!(result, Err(RunOutcome::ExecutionFailed(_))));
    }

    #[tokio::test]
    async fn unrecognized_strategy_surfaces_as_base_error() {
        let (workflow, raw_args, type_names) = workflow_from(
            r#"
actions:
  - name: greet
    type: echo
    message: hi
"#,
        );
        let display = Arc::new(RecordingDisplay::default());
        let result = run(workflow, &raw_args, &type_names, &[], display, "not-a-strategy", false).await;
        assert!(matches!(result, Err(RunOutcome::Base(BaseError::Interaction(_)))));
    }

    #[tokio::test]
    async fn bad_render_marks_action_failure_without_running_body() {
        let (workflow, raw_args, type_names) = workflow_from(
            r#"
actions:
  - name: broken-template
    type: echo
    message: "@{outcomes.missing.key}"
"#,
        );
        let display = Arc::new(RecordingDisplay::default());
        let result = run(workflow, &raw_args, &type_names, &[], display.clone(), "free", true).await;
        assert!(matches!(result, Err(RunOutcome::ExecutionFailed(_))));
        assert!(display.messages.lock().unwrap().is_empty());
        assert!(!display.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unmet_package_requirement_aborts_before_any_action_starts() {
        let (workflow, raw_args, type_names) = workflow_from(
            r#"
actions:
  - name: greet
    type: echo
    message: hi
"#,
        );
        let display = Arc::new(RecordingDisplay::default());
        let missing = vec!["definitely-not-a-real-binary-xyz".to_string()];
        let result = run(workflow, &raw_args, &type_names, &missing, display.clone(), "free", false).await;
        assert!(matches!(result, Err(RunOutcome::Base(BaseError::PackageRequirement(_)))));
        assert!(display.started.lock().unwrap().is_empty());
    }
}
