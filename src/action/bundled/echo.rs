//! Simple printer.

use async_trait::async_trait;
use serde::Deserialize;

use crate::action::{check_reserved_argument_names, ActionBody, ActionHandle, BodyOutcome};

#[derive(Debug, Deserialize)]
pub struct EchoArgs {
    pub message: String,
}

pub struct EchoAction {
    args: EchoArgs,
}

impl EchoAction {
    pub fn from_value(value: serde_json::Value) -> Result<Self, String> {
        check_reserved_argument_names(["message"])?;
        let args: EchoArgs = serde_json::from_value(value).map_err(|e| e.to_string())?;
        Ok(Self { args })
    }
}

#[async_trait]
impl ActionBody for EchoAction {
    async fn run(&self, handle: &ActionHandle) -> Result<(), BodyOutcome> {
        handle.emit(self.args.message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionStatus, EventItem, Severity};
    use indexmap::IndexMap;

    #[tokio::test]
    async fn emits_message_once_and_succeeds() {
        let action = EchoAction::from_value(serde_json::json!({"message": "foo"})).unwrap();
        let action = Action::new("echo-0", None, Severity::Normal, true, IndexMap::new(), Box::new(action));
        action.execute().await;
        assert_eq!(action.status().await, ActionStatus::Success);
        assert_eq!(action.next_event().await, Some(EventItem::Message("foo".into())));
        assert_eq!(action.next_event().await, None);
    }
}
