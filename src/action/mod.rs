//! Action runtime: the state machine of a single workflow unit.
//!
//! An [`Action`] wraps a kind-specific [`ActionBody`] with the shared
//! lifecycle every kind gets for free: status transitions, the outcome map,
//! the event stream, and the single-shot completion signal that strategies
//! wait on.

pub mod bundled;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::errors::{ActionError, RunError};

/// Field names the loader reserves for action metadata; a kind's argument
/// struct must not redeclare any of them.
pub const RESERVED_ARGUMENT_NAMES: &[&str] =
    &["name", "type", "description", "expects", "selectable", "severity"];

/// Returns an error message if `fields` collides with a reserved name.
pub fn check_reserved_argument_names(fields: impl IntoIterator<Item = impl AsRef<str>>) -> Result<(), String> {
    let reserved: HashSet<&str> = RESERVED_ARGUMENT_NAMES.iter().copied().collect();
    for field in fields {
        if reserved.contains(field.as_ref()) {
            return Err(format!("Reserved argument name: {:?}", field.as_ref()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Pending,
    Running,
    Success,
    Warning,
    Failure,
    Skipped,
    Omitted,
}

impl ActionStatus {
    /// Any of the seven states an action may end up resting in forever.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Low,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// An edge from a dependent action to one of its ancestors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dependency {
    pub strict: bool,
    pub external: bool,
}

/// A single event emitted by a running action, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventItem {
    Message(String),
    Stderr(String),
}

impl EventItem {
    pub fn text(&self) -> &str {
        match self {
            Self::Message(s) | Self::Stderr(s) => s,
        }
    }

    pub fn is_stderr(&self) -> bool {
        matches!(self, Self::Stderr(_))
    }
}

/// Outcome storage for one action: string key to string value.
pub type OutcomeMap = IndexMap<String, String>;

/// What an [`ActionBody::run`] body reports back to the runtime. Any other
/// error propagating out via `?` converts to `Other` and is treated the same
/// as an explicit `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum BodyOutcome {
    #[error("skipped")]
    Skipped,
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BodyOutcome {
    fn into_message(self) -> Option<String> {
        match self {
            Self::Skipped => None,
            Self::Failed(msg) => Some(msg),
            Self::Other(err) => Some(err.to_string()),
        }
    }
}

/// Handle passed to a running action body: the only way it may touch shared
/// state (emit events, yield outcomes, or construct a skip/fail outcome).
/// Cheaply cloned so a body can hand one to each of its own concurrent
/// readers (e.g. a shell body's stdout/stderr tasks) without sharing `&self`.
#[derive(Clone)]
pub struct ActionHandle {
    events_tx: mpsc::UnboundedSender<EventItem>,
    outcomes: Arc<Mutex<OutcomeMap>>,
}

impl ActionHandle {
    pub fn emit(&self, message: impl Into<String>) {
        let _ = self.events_tx.send(EventItem::Message(message.into()));
    }

    pub fn emit_stderr(&self, message: impl Into<String>) {
        let _ = self.events_tx.send(EventItem::Stderr(message.into()));
    }

    pub async fn yield_outcome(&self, key: impl Into<String>, value: impl Into<String>) {
        self.outcomes.lock().await.insert(key.into(), value.into());
    }

    /// Convenience constructor for `return Err(handle.fail(...).into())`.
    pub fn fail(&self, message: impl Into<String>) -> BodyOutcome {
        BodyOutcome::Failed(message.into())
    }

    pub fn skip(&self) -> BodyOutcome {
        BodyOutcome::Skipped
    }
}

/// Outcome of scanning one line of an emission-scanner action's stdout for
/// an embedded `##grana[...]##` service message (§4.1.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannedLine {
    /// No marker found, or text preceding a recognized marker: re-emitted
    /// as a normal message.
    Plain(String),
    Skip,
    YieldOutcome(String, String),
    /// A recognized marker with an unsupported verb: logged and discarded.
    UnknownVerb(String),
    /// A marker whose arguments failed base64 decoding: a warning, the
    /// whole line is discarded.
    Malformed(String),
}

static SERVICE_MESSAGE_PATTERN: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
    regex::Regex::new(r"^(.*?)##grana\[([A-Za-z0-9+/=\- ]+)\]##$").expect("valid service message pattern")
});

/// Shell prelude optionally injected ahead of a shell/container-shell
/// action's command, defining helper functions that emit service messages.
pub const SHELL_SERVICE_FUNCTIONS_DEFINITIONS: &str = r#"
yield_outcome() {
  echo "##grana[yield-outcome-b64 $(printf '%s' "$1" | base64 | tr -d '\n') $(printf '%s' "$2" | base64 | tr -d '\n')]##"
}
skip() {
  echo "##grana[skip]##"
}
"#;

/// Scans one line of stdout for a trailing service message marker. Content
/// preceding the marker is preserved verbatim as the `Plain` prefix when
/// the verb is recognized but otherwise routed through `Plain` unchanged.
pub fn scan_service_message_line(line: &str) -> ScannedLine {
    use base64::Engine as _;

    let Some(caps) = SERVICE_MESSAGE_PATTERN.captures(line) else {
        return ScannedLine::Plain(line.to_string());
    };
    let expression = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let mut parts = expression.split(' ').filter(|s| !s.is_empty());
    let verb = match parts.next() {
        Some(v) => v,
        None => return ScannedLine::Plain(line.to_string()),
    };
    let decode = |arg: &str| base64::engine::general_purpose::STANDARD.decode(arg).ok().and_then(|bytes| String::from_utf8(bytes).ok());

    match verb {
        "skip" => ScannedLine::Skip,
        "yield-outcome-b64" => {
            let args: Vec<&str> = parts.collect();
            match args.as_slice() {
                [key_b64, value_b64] => match (decode(key_b64), decode(value_b64)) {
                    (Some(key), Some(value)) => ScannedLine::YieldOutcome(key, value),
                    _ => ScannedLine::Malformed(line.to_string()),
                },
                _ => ScannedLine::Malformed(line.to_string()),
            }
        }
        other => ScannedLine::UnknownVerb(other.to_string()),
    }
}

/// The prefix text preceding a recognized marker on the same line, if any.
pub fn service_message_prefix(line: &str) -> Option<String> {
    let caps = SERVICE_MESSAGE_PATTERN.captures(line)?;
    let prefix = caps.get(1)?.as_str();
    if prefix.is_empty() {
        None
    } else {
        Some(prefix.to_string())
    }
}

/// The kind-specific behavior of an action. Everything else (status,
/// outcomes, events) lives in [`Action`] and is identical for every kind.
#[async_trait]
pub trait ActionBody: Send + Sync {
    async fn run(&self, handle: &ActionHandle) -> Result<(), BodyOutcome>;
}

struct ActionState {
    status: RwLock<ActionStatus>,
    enabled: RwLock<bool>,
    outcomes: Arc<Mutex<OutcomeMap>>,
    error_message: RwLock<Option<String>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<EventItem>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EventItem>>>,
    completion_tx: watch::Sender<bool>,
    completion_rx: watch::Receiver<bool>,
}

/// A named workflow unit: shared lifecycle plus a kind-specific body.
///
/// The body is behind a `Mutex` rather than a plain field so the
/// orchestrator can swap in a freshly re-rendered body right before
/// dispatch (§4.5.c: args are rendered again at each dispatch, not once
/// at load time) without disturbing the identity other components hold
/// an `Arc` to.
pub struct Action {
    pub name: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub selectable: bool,
    pub ancestors: IndexMap<String, Dependency>,
    body: Mutex<Box<dyn ActionBody>>,
    state: ActionState,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        severity: Severity,
        selectable: bool,
        ancestors: IndexMap<String, Dependency>,
        body: Box<dyn ActionBody>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = watch::channel(false);
        Self {
            name: name.into(),
            description,
            severity,
            selectable,
            ancestors,
            body: Mutex::new(body),
            state: ActionState {
                status: RwLock::new(ActionStatus::Pending),
                enabled: RwLock::new(true),
                outcomes: Arc::new(Mutex::new(OutcomeMap::new())),
                error_message: RwLock::new(None),
                events_tx: Mutex::new(Some(events_tx)),
                events_rx: Mutex::new(Some(events_rx)),
                completion_tx,
                completion_rx,
            },
        }
    }

    pub async fn status(&self) -> ActionStatus {
        *self.state.status.read().await
    }

    pub async fn enabled(&self) -> bool {
        *self.state.enabled.read().await
    }

    pub async fn done(&self) -> bool {
        self.state.status.read().await.is_terminal()
    }

    pub async fn error_message(&self) -> Option<String> {
        self.state.error_message.read().await.clone()
    }

    pub async fn outcomes(&self) -> OutcomeMap {
        self.state.outcomes.lock().await.clone()
    }

    /// A fresh handle on the completion signal, usable from any number of
    /// concurrent observers (e.g. several strategies waiting on the same
    /// workflow, or tests).
    pub fn subscribe_completion(&self) -> watch::Receiver<bool> {
        self.state.completion_rx.clone()
    }

    pub async fn await_completion(&self) -> Result<(), RunError> {
        let mut rx = self.subscribe_completion();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        match self.status().await {
            ActionStatus::Failure => {
                let msg = self.error_message().await.unwrap_or_default();
                Err(RunError(msg))
            }
            _ => Ok(()),
        }
    }

    /// Legal only while `PENDING`.
    pub async fn disable(&self) -> Result<(), ActionError> {
        let status = self.status().await;
        if status != ActionStatus::Pending {
            return Err(ActionError::CannotDisable(status));
        }
        *self.state.enabled.write().await = false;
        Ok(())
    }

    /// Drains buffered events until the action is done and the channel is
    /// closed. Single-consumer: calling this twice concurrently would race
    /// on the same receiver, which the API does not support.
    pub async fn next_event(&self) -> Option<EventItem> {
        let mut guard = self.state.events_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Forces a `SKIPPED` transition from `PENDING`. Idempotent: a no-op if
    /// the action already reached a terminal status.
    pub async fn force_skip(&self) {
        self.finish_if_pending(ActionStatus::Skipped, None).await;
    }

    /// Forces a `FAILURE` transition from `PENDING` without ever running the
    /// body — used when rendering or schema validation fails before
    /// dispatch (§4.5.c always fails these outright, regardless of
    /// severity).
    pub async fn force_fail(&self, message: impl Into<String>) {
        self.finish_if_pending(ActionStatus::Failure, Some(message.into())).await;
    }

    pub async fn omit(&self) {
        self.finish_if_pending(ActionStatus::Omitted, None).await;
    }

    /// Swaps the body that `execute` will run. Called by the orchestrator
    /// once per dispatch, after rendering the action's arguments against
    /// the current outcomes/context snapshot.
    pub async fn replace_body(&self, body: Box<dyn ActionBody>) {
        *self.body.lock().await = body;
    }

    async fn finish_if_pending(&self, status: ActionStatus, error: Option<String>) {
        let mut guard = self.state.status.write().await;
        if *guard != ActionStatus::Pending {
            return;
        }
        *guard = status;
        drop(guard);
        self.close(error).await;
    }

    async fn close(&self, error: Option<String>) {
        if let Some(msg) = error {
            *self.state.error_message.write().await = Some(msg);
        }
        if let Some(tx) = self.state.events_tx.lock().await.take() {
            drop(tx);
        }
        let _ = self.state.completion_tx.send(true);
    }

    /// Runs the action body to completion, driving the full status
    /// transition described by the lifecycle diagram.
    pub async fn execute(&self) {
        {
            let mut guard = self.state.status.write().await;
            debug_assert_eq!(*guard, ActionStatus::Pending);
            *guard = ActionStatus::Running;
        }
        let events_tx = {
            let guard = self.state.events_tx.lock().await;
            guard.clone().expect("events channel open while running")
        };
        let handle = ActionHandle {
            events_tx,
            outcomes: self.state.outcomes.clone(),
        };
        let result = self.body.lock().await.run(&handle).await;
        drop(handle);
        match result {
            Ok(()) => {
                let mut guard = self.state.status.write().await;
                *guard = ActionStatus::Success;
                drop(guard);
                self.close(None).await;
            }
            Err(BodyOutcome::Skipped) => {
                let mut guard = self.state.status.write().await;
                *guard = ActionStatus::Skipped;
                drop(guard);
                self.close(None).await;
            }
            Err(other) => {
                let message = other.into_message().unwrap_or_default();
                let terminal = match self.severity {
                    Severity::Normal => ActionStatus::Failure,
                    Severity::Low => ActionStatus::Warning,
                };
                let mut guard = self.state.status.write().await;
                *guard = terminal;
                drop(guard);
                self.close(Some(message)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Immediate;

    #[async_trait]
    impl ActionBody for Immediate {
        async fn run(&self, handle: &ActionHandle) -> Result<(), BodyOutcome> {
            handle.emit("hello");
            Ok(())
        }
    }

    struct Failing(Severity);

    #[async_trait]
    impl ActionBody for Failing {
        async fn run(&self, handle: &ActionHandle) -> Result<(), BodyOutcome> {
            Err(handle.fail("boom"))
        }
    }

    #[tokio::test]
    async fn success_path_emits_and_completes() {
        let action = Action::new(
            "a",
            None,
            Severity::Normal,
            true,
            IndexMap::new(),
            Box::new(Immediate),
        );
        action.execute().await;
        assert_eq!(action.status().await, ActionStatus::Success);
        assert!(action.done().await);
        assert_eq!(action.next_event().await, Some(EventItem::Message("hello".into())));
        assert_eq!(action.next_event().await, None);
        assert!(action.await_completion().await.is_ok());
    }

    #[tokio::test]
    async fn normal_severity_failure_is_failure_and_errors() {
        let action = Action::new(
            "a",
            None,
            Severity::Normal,
            true,
            IndexMap::new(),
            Box::new(Failing(Severity::Normal)),
        );
        action.execute().await;
        assert_eq!(action.status().await, ActionStatus::Failure);
        assert!(action.await_completion().await.is_err());
    }

    #[tokio::test]
    async fn low_severity_failure_is_warning_and_succeeds() {
        let action = Action::new(
            "a",
            None,
            Severity::Low,
            true,
            IndexMap::new(),
            Box::new(Failing(Severity::Low)),
        );
        action.execute().await;
        assert_eq!(action.status().await, ActionStatus::Warning);
        assert!(action.await_completion().await.is_ok());
    }

    #[tokio::test]
    async fn disable_only_legal_while_pending() {
        let action = Action::new(
            "a",
            None,
            Severity::Normal,
            true,
            IndexMap::new(),
            Box::new(Immediate),
        );
        action.execute().await;
        assert!(action.disable().await.is_err());
    }

    #[test]
    fn reserved_argument_names_rejected() {
        assert!(check_reserved_argument_names(["message", "severity"]).is_err());
        assert!(check_reserved_argument_names(["message"]).is_ok());
    }

    #[test]
    fn service_message_scanner_recognizes_verbs() {
        assert_eq!(scan_service_message_line("plain text"), ScannedLine::Plain("plain text".into()));
        assert_eq!(scan_service_message_line("##grana[skip]##"), ScannedLine::Skip);

        use base64::Engine as _;
        let key = base64::engine::general_purpose::STANDARD.encode("k");
        let value = base64::engine::general_purpose::STANDARD.encode("v");
        let line = format!("##grana[yield-outcome-b64 {key} {value}]##");
        assert_eq!(scan_service_message_line(&line), ScannedLine::YieldOutcome("k".into(), "v".into()));

        assert_eq!(
            scan_service_message_line("##grana[yield-outcome-b64 A B]##"),
            ScannedLine::Malformed("##grana[yield-outcome-b64 A B]##".into())
        );
        assert_eq!(
            scan_service_message_line("##grana[unknown-verb]##"),
            ScannedLine::UnknownVerb("unknown-verb".into())
        );
    }
}
