//! Evaluation-environment containers exposed to rendered expressions.
//!
//! Each container translates the missing-key policy from the container
//! semantics table into a Rhai indexer that either returns a value or
//! raises a typed render error, piggy-backing on Rhai's "fall back to the
//! indexer for unmatched property access" rule so `ctx.x` and `ctx["x"]`
//! reach the same code path.

use std::sync::Arc;

use indexmap::IndexMap;
use rhai::{Dynamic, EvalAltResult, ImmutableString};

use crate::action::{ActionStatus, OutcomeMap};
use crate::errors::RenderError;

use super::{eval_expression, render_string, ContextNode, TemplarShared};

const RENDER_ERROR_TAG: &str = "\u{1}grana-render-error\u{1}";

fn encode(err: &RenderError) -> String {
    match err {
        RenderError::ActionNotFound(n) => format!("{RENDER_ERROR_TAG}action_not_found\u{1}{n}"),
        RenderError::OutcomeKeyMissing(k) => format!("{RENDER_ERROR_TAG}outcome_key_missing\u{1}{k}"),
        RenderError::ContextKeyMissing(k) => format!("{RENDER_ERROR_TAG}context_key_missing\u{1}{k}"),
        RenderError::RestrictedBuiltin(n) => format!("{RENDER_ERROR_TAG}restricted_builtin\u{1}{n}"),
        RenderError::RecursionDepthExceeded => format!("{RENDER_ERROR_TAG}recursion_depth_exceeded\u{1}"),
        RenderError::Other(m) => format!("{RENDER_ERROR_TAG}other\u{1}{m}"),
    }
}

pub(super) fn decode(raw: &str) -> Option<RenderError> {
    let rest = raw.strip_prefix(RENDER_ERROR_TAG)?;
    let mut parts = rest.splitn(2, '\u{1}');
    let kind = parts.next()?;
    let payload = parts.next().unwrap_or_default().to_string();
    Some(match kind {
        "action_not_found" => RenderError::ActionNotFound(payload),
        "outcome_key_missing" => RenderError::OutcomeKeyMissing(payload),
        "context_key_missing" => RenderError::ContextKeyMissing(payload),
        "restricted_builtin" => RenderError::RestrictedBuiltin(payload),
        "recursion_depth_exceeded" => RenderError::RecursionDepthExceeded,
        _ => RenderError::Other(payload),
    })
}

/// Wraps a typed render error as a Rhai runtime error, tagged so the
/// top-level evaluator can recover the original `RenderError` afterwards.
pub(super) fn raise(err: RenderError) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(Dynamic::from(encode(&err)), rhai::Position::NONE))
}

pub(super) fn status_name(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Pending => "PENDING",
        ActionStatus::Running => "RUNNING",
        ActionStatus::Success => "SUCCESS",
        ActionStatus::Warning => "WARNING",
        ActionStatus::Failure => "FAILURE",
        ActionStatus::Skipped => "SKIPPED",
        ActionStatus::Omitted => "OMITTED",
    }
}

pub(super) fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(*b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Dynamic::from)
            .unwrap_or_else(|| Dynamic::from(n.as_f64().unwrap_or_default())),
        serde_json::Value::String(s) => Dynamic::from(s.clone()),
        serde_json::Value::Array(items) => Dynamic::from(items.iter().map(json_to_dynamic).collect::<rhai::Array>()),
        serde_json::Value::Object(map) => {
            let mut out = rhai::Map::new();
            for (k, v) in map {
                out.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(out)
        }
    }
}

/// Best-effort conversion back to JSON for an evaluated expression result.
/// Values with no natural JSON shape fall back to their display string.
pub(super) fn dynamic_to_json(value: Dynamic) -> serde_json::Value {
    if value.is_unit() {
        return serde_json::Value::Null;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return serde_json::Value::Bool(b);
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return serde_json::json!(i);
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return serde_json::json!(f);
    }
    if let Some(s) = value.clone().try_cast::<ImmutableString>() {
        return serde_json::Value::String(s.to_string());
    }
    if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        return serde_json::Value::Array(arr.into_iter().map(dynamic_to_json).collect());
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        let mut out = serde_json::Map::new();
        for (k, v) in map {
            out.insert(k.to_string(), dynamic_to_json(v));
        }
        return serde_json::Value::Object(out);
    }
    serde_json::Value::String(value.to_string())
}

/// Converts one loaded context node into the Dynamic an expression sees,
/// rendering deferred template/object-template leaves on demand.
pub(super) fn context_node_to_dynamic(
    shared: &Arc<TemplarShared>,
    node: &ContextNode,
) -> Result<Dynamic, Box<EvalAltResult>> {
    match node {
        ContextNode::Value(v) => Ok(json_to_dynamic(v)),
        ContextNode::Template(template) => {
            let rendered = render_string(shared, template).map_err(raise)?;
            Ok(Dynamic::from(rendered))
        }
        ContextNode::ObjectTemplate(expr) => {
            let evaluated = eval_expression(shared, expr).map_err(raise)?;
            let reloaded = super::reload_context_value(dynamic_to_json(evaluated));
            context_node_to_dynamic(shared, &reloaded)
        }
        ContextNode::List(items) => {
            let mut arr = rhai::Array::new();
            for item in items.iter() {
                arr.push(context_node_to_dynamic(shared, item)?);
            }
            Ok(Dynamic::from(arr))
        }
        ContextNode::Map(map) => Ok(Dynamic::from(ContextMapView { shared: shared.clone(), node: map.clone() })),
    }
}

#[derive(Clone)]
pub(super) struct OutcomesView {
    pub(super) shared: Arc<TemplarShared>,
}

impl OutcomesView {
    pub(super) fn get(&mut self, name: ImmutableString) -> Result<ActionOutcomeView, Box<EvalAltResult>> {
        match self.shared.outcomes.get(name.as_str()) {
            Some(map) => Ok(ActionOutcomeView { outcomes: map.clone(), strict: self.shared.strict_outcomes }),
            None => Err(raise(RenderError::ActionNotFound(name.to_string()))),
        }
    }
}

#[derive(Clone)]
pub(super) struct ActionOutcomeView {
    outcomes: OutcomeMap,
    strict: bool,
}

impl ActionOutcomeView {
    pub(super) fn get(&mut self, key: ImmutableString) -> Result<ImmutableString, Box<EvalAltResult>> {
        match self.outcomes.get(key.as_str()) {
            Some(value) => Ok(value.clone().into()),
            None if self.strict => Err(raise(RenderError::OutcomeKeyMissing(key.to_string()))),
            None => Ok("".into()),
        }
    }
}

#[derive(Clone)]
pub(super) struct StatusView {
    pub(super) shared: Arc<TemplarShared>,
}

impl StatusView {
    pub(super) fn get(&mut self, name: ImmutableString) -> Result<ImmutableString, Box<EvalAltResult>> {
        match self.shared.statuses.get(name.as_str()) {
            Some(status) => Ok(status_name(*status).into()),
            None => Err(raise(RenderError::ActionNotFound(name.to_string()))),
        }
    }
}

#[derive(Clone)]
pub(super) struct EnvironmentView {
    pub(super) shared: Arc<TemplarShared>,
}

impl EnvironmentView {
    pub(super) fn get(&mut self, name: ImmutableString) -> ImmutableString {
        self.shared.environment.get(name.as_str()).cloned().unwrap_or_default().into()
    }
}

#[derive(Clone)]
pub(super) struct ContextMapView {
    pub(super) shared: Arc<TemplarShared>,
    pub(super) node: Arc<IndexMap<String, ContextNode>>,
}

impl ContextMapView {
    pub(super) fn get(&mut self, key: ImmutableString) -> Result<Dynamic, Box<EvalAltResult>> {
        match self.node.get(key.as_str()) {
            Some(child) => context_node_to_dynamic(&self.shared, child),
            None => Err(raise(RenderError::ContextKeyMissing(key.to_string()))),
        }
    }
}
