//! Shell command handler, with service-message scanning on stdout.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::action::{
    check_reserved_argument_names, scan_service_message_line, service_message_prefix, ActionBody,
    ActionHandle, BodyOutcome, ScannedLine, SHELL_SERVICE_FUNCTIONS_DEFINITIONS,
};
use crate::config::Config;

#[derive(Debug, Deserialize)]
pub struct ShellArgs {
    pub command: Option<String>,
    pub file: Option<String>,
    pub environment: Option<HashMap<String, String>>,
    pub cwd: Option<String>,
}

pub struct ShellAction {
    args: ShellArgs,
}

impl ShellAction {
    pub fn from_value(value: serde_json::Value) -> Result<Self, String> {
        check_reserved_argument_names(["command", "file", "environment", "cwd"])?;
        let args: ShellArgs = serde_json::from_value(value).map_err(|e| e.to_string())?;
        match (&args.command, &args.file) {
            (None, None) => return Err("Neither command nor file specified".into()),
            (Some(_), Some(_)) => return Err("Both command and file specified".into()),
            _ => {}
        }
        Ok(Self { args })
    }

    fn script(&self) -> String {
        let base = match &self.args.command {
            Some(command) => command.clone(),
            None => format!("source '{}'", self.args.file.as_deref().unwrap_or_default()),
        };
        if Config::global().shell_inject_yield_function {
            format!("{SHELL_SERVICE_FUNCTIONS_DEFINITIONS}\n{base}")
        } else {
            base
        }
    }
}

#[async_trait]
impl ActionBody for ShellAction {
    async fn run(&self, handle: &ActionHandle) -> Result<(), BodyOutcome> {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(self.script());
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(cwd) = &self.args.cwd {
            command.current_dir(cwd);
        }
        if let Some(environment) = &self.args.environment {
            command.envs(environment);
        }

        let mut child = command
            .spawn()
            .map_err(|e| handle.fail(format!("Failed to spawn shell: {e}")))?;
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let stdout_task = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut skipped = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    match scan_service_message_line(&line) {
                        ScannedLine::Plain(text) => handle.emit(text),
                        ScannedLine::Skip => {
                            if let Some(prefix) = service_message_prefix(&line) {
                                handle.emit(prefix);
                            }
                            skipped = true;
                        }
                        ScannedLine::YieldOutcome(key, value) => {
                            if let Some(prefix) = service_message_prefix(&line) {
                                handle.emit(prefix);
                            }
                            handle.yield_outcome(key, value).await;
                        }
                        ScannedLine::UnknownVerb(_) | ScannedLine::Malformed(_) => {}
                    }
                }
                skipped
            })
        };
        let stderr_task = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    handle.emit_stderr(line);
                }
            })
        };

        let (skipped, _) = tokio::join!(stdout_task, stderr_task);
        let skipped = skipped.unwrap_or(false);

        let status = child
            .wait()
            .await
            .map_err(|e| handle.fail(format!("Failed to wait for shell: {e}")))?;

        if skipped {
            return Err(handle.skip());
        }
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(handle.fail(format!("Exit code: {code}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_exactly_one_of_command_or_file() {
        assert!(ShellAction::from_value(serde_json::json!({})).is_err());
        assert!(ShellAction::from_value(serde_json::json!({"command": "echo hi", "file": "x.sh"})).is_err());
        assert!(ShellAction::from_value(serde_json::json!({"command": "echo hi"})).is_ok());
    }

    #[tokio::test]
    async fn successful_command_emits_stdout_and_succeeds() {
        use crate::action::{Action, ActionStatus, Severity};
        use indexmap::IndexMap;

        let body = ShellAction::from_value(serde_json::json!({"command": "echo hi"})).unwrap();
        let action = Action::new("sh-0", None, Severity::Normal, true, IndexMap::new(), Box::new(body));
        action.execute().await;
        assert_eq!(action.status().await, ActionStatus::Success);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_code() {
        use crate::action::{Action, ActionStatus, Severity};
        use indexmap::IndexMap;

        let body = ShellAction::from_value(serde_json::json!({"command": "exit 3"})).unwrap();
        let action = Action::new("sh-0", None, Severity::Normal, true, IndexMap::new(), Box::new(body));
        action.execute().await;
        assert_eq!(action.status().await, ActionStatus::Failure);
        let msg = action.error_message().await.unwrap();
        assert!(msg.contains('3'));
    }
}
