//! The `@{...}` template renderer: a recursion-bounded expression language
//! over the workflow's live outcomes/statuses and its loaded context.
//!
//! Evaluation is delegated to an embedded `rhai` engine so the expression
//! grammar (arithmetic, string ops, indexing, `**` is unavailable in Rhai so
//! merges are expressed with its native map/array builtins instead) comes
//! for free; this module supplies the container types, the restricted
//! builtins, and the lazy context-loading/reload semantics around it.

mod containers;
mod tokenizing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};

use crate::action::{ActionStatus, OutcomeMap};
use crate::errors::RenderError;

use containers::{ContextMapView, EnvironmentView, OutcomesView, StatusView};

const DEFAULT_MAX_DEPTH: usize = 24;
const RESTRICTED_BUILTINS: &[&str] = &["exec", "eval", "compile", "setattr", "delattr"];

/// A value as loaded from a workflow document: action-arg trees and the
/// workflow context share this shape. `ObjectTemplate` is the `!@ <expr>`
/// tag; everything else mirrors a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    ObjectTemplate(String),
    List(Vec<DocValue>),
    Map(IndexMap<String, DocValue>),
}

impl DocValue {
    /// Converts a parsed YAML node, recognizing the `!@` object-template
    /// tag. `!import` is resolved by the loader before this is called.
    pub fn from_yaml(value: serde_yaml::Value) -> Result<Self, String> {
        match value {
            serde_yaml::Value::Null => Ok(Self::Null),
            serde_yaml::Value::Bool(b) => Ok(Self::Bool(b)),
            serde_yaml::Value::Number(n) => Ok(Self::Number(n.as_f64().unwrap_or_default())),
            serde_yaml::Value::String(s) => Ok(Self::String(s)),
            serde_yaml::Value::Sequence(seq) => {
                let items = seq.into_iter().map(Self::from_yaml).collect::<Result<Vec<_>, _>>()?;
                Ok(Self::List(items))
            }
            serde_yaml::Value::Mapping(mapping) => {
                let mut out = IndexMap::new();
                for (k, v) in mapping {
                    let key = k.as_str().ok_or("mapping keys must be strings")?.to_string();
                    out.insert(key, Self::from_yaml(v)?);
                }
                Ok(Self::Map(out))
            }
            serde_yaml::Value::Tagged(tagged) => {
                let tag = tagged.tag.to_string();
                if tag == "!@" {
                    match tagged.value {
                        serde_yaml::Value::String(expr) => Ok(Self::ObjectTemplate(expr)),
                        other => Err(format!("!@ requires a string expression, got {other:?}")),
                    }
                } else {
                    Err(format!("unsupported tag: {tag}"))
                }
            }
        }
    }

    fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => {
                Self::Map(map.iter().map(|(k, v)| (k.clone(), Self::from_json(v))).collect())
            }
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::json!(n),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::ObjectTemplate(_) => serde_json::Value::Null,
            Self::List(items) => serde_json::Value::Array(items.iter().map(DocValue::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
        }
    }
}

/// The loaded, lazily-evaluated shape of the workflow context. A `Template`
/// or `ObjectTemplate` leaf is re-evaluated on every access.
#[derive(Debug, Clone)]
pub(crate) enum ContextNode {
    Value(serde_json::Value),
    Template(String),
    ObjectTemplate(String),
    List(Arc<Vec<ContextNode>>),
    Map(Arc<IndexMap<String, ContextNode>>),
}

fn load_context_node(value: &DocValue) -> ContextNode {
    match value {
        DocValue::ObjectTemplate(expr) => ContextNode::ObjectTemplate(expr.clone()),
        DocValue::String(s) if s.contains("@{") => ContextNode::Template(s.clone()),
        DocValue::List(items) => ContextNode::List(Arc::new(items.iter().map(load_context_node).collect())),
        DocValue::Map(map) => {
            ContextNode::Map(Arc::new(map.iter().map(|(k, v)| (k.clone(), load_context_node(v))).collect()))
        }
        other => ContextNode::Value(other.to_json()),
    }
}

/// Re-applies context loading to a freshly evaluated object-template
/// result, so its string fields become templates again.
pub(crate) fn reload_context_value(value: serde_json::Value) -> ContextNode {
    load_context_node(&DocValue::from_json(&value))
}

/// State shared between the top-level renderer and every container a
/// rendered expression can reach, so a context proxy can recurse back into
/// `render`/`eval` without holding a borrow of the `Templar` itself.
pub(crate) struct TemplarShared {
    engine: Engine,
    strict_outcomes: bool,
    max_depth: usize,
    depth: AtomicUsize,
    outcomes: IndexMap<String, OutcomeMap>,
    statuses: IndexMap<String, ActionStatus>,
    environment: HashMap<String, String>,
    root_context: Arc<IndexMap<String, ContextNode>>,
}

struct DepthGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> DepthGuard<'a> {
    fn enter(counter: &'a AtomicUsize, max_depth: usize) -> Result<Self, RenderError> {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        if previous + 1 > max_depth {
            counter.fetch_sub(1, Ordering::SeqCst);
            return Err(RenderError::RecursionDepthExceeded);
        }
        Ok(Self { counter })
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn register_restricted(engine: &mut Engine, name: &'static str) {
    let err0 = move || -> Result<Dynamic, Box<EvalAltResult>> {
        Err(containers::raise(RenderError::RestrictedBuiltin(name.to_string())))
    };
    let err1 = move |_a: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
        Err(containers::raise(RenderError::RestrictedBuiltin(name.to_string())))
    };
    let err2 = move |_a: Dynamic, _b: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
        Err(containers::raise(RenderError::RestrictedBuiltin(name.to_string())))
    };
    let err3 = move |_a: Dynamic, _b: Dynamic, _c: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
        Err(containers::raise(RenderError::RestrictedBuiltin(name.to_string())))
    };
    engine.register_fn(name, err0);
    engine.register_fn(name, err1);
    engine.register_fn(name, err2);
    engine.register_fn(name, err3);
}

fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine.register_type_with_name::<OutcomesView>("Outcomes");
    engine.register_indexer_get(OutcomesView::get);
    engine.register_type_with_name::<containers::ActionOutcomeView>("ActionOutcome");
    engine.register_indexer_get(containers::ActionOutcomeView::get);
    engine.register_type_with_name::<StatusView>("Status");
    engine.register_indexer_get(StatusView::get);
    engine.register_type_with_name::<EnvironmentView>("Environment");
    engine.register_indexer_get(EnvironmentView::get);
    engine.register_type_with_name::<ContextMapView>("Context");
    engine.register_indexer_get(ContextMapView::get);
    for name in RESTRICTED_BUILTINS {
        register_restricted(&mut engine, name);
    }
    engine
}

fn build_scope(shared: &Arc<TemplarShared>) -> Scope<'static> {
    let mut scope = Scope::new();
    let outcomes = OutcomesView { shared: shared.clone() };
    let status = StatusView { shared: shared.clone() };
    let context = ContextMapView { shared: shared.clone(), node: shared.root_context.clone() };
    let environment = EnvironmentView { shared: shared.clone() };
    scope.push("outcomes", outcomes.clone());
    scope.push("out", outcomes);
    scope.push("status", status);
    scope.push("context", context.clone());
    scope.push("ctx", context);
    scope.push("environment", environment.clone());
    scope.push("env", environment);
    scope
}

pub(crate) fn eval_expression(shared: &Arc<TemplarShared>, source: &str) -> Result<Dynamic, RenderError> {
    let _guard = DepthGuard::enter(&shared.depth, shared.max_depth)?;
    let mut scope = build_scope(shared);
    shared
        .engine
        .eval_expression_with_scope::<Dynamic>(&mut scope, source)
        .map_err(|err| classify_eval_error(*err))
}

fn classify_eval_error(err: EvalAltResult) -> RenderError {
    if let EvalAltResult::ErrorRuntime(value, _) = &err {
        if let Some(tag) = value.clone().try_cast::<String>() {
            if let Some(render_error) = containers::decode(&tag) {
                return render_error;
            }
        }
    }
    RenderError::Other(err.to_string())
}

pub(crate) fn render_string(shared: &Arc<TemplarShared>, input: &str) -> Result<String, RenderError> {
    let lexemes = tokenizing::lex(input);
    let mut out = String::new();
    for lexeme in lexemes {
        match lexeme {
            tokenizing::Lexeme::Text(text) => out.push_str(&text),
            tokenizing::Lexeme::Expression { unterminated: true, .. } => {}
            tokenizing::Lexeme::Expression { source, unterminated: false } => {
                let value = eval_expression(shared, &source)?;
                out.push_str(&value.to_string());
            }
        }
    }
    Ok(out)
}

/// A renderer over one snapshot of outcomes/statuses and the workflow's
/// loaded context, instantiated fresh by the orchestrator for each action
/// it dispatches.
pub struct Templar {
    shared: Arc<TemplarShared>,
}

impl Templar {
    pub fn new(
        outcomes: IndexMap<String, OutcomeMap>,
        statuses: IndexMap<String, ActionStatus>,
        context: &IndexMap<String, DocValue>,
        environment: HashMap<String, String>,
        strict_outcomes: bool,
    ) -> Self {
        Self::with_max_depth(outcomes, statuses, context, environment, strict_outcomes, DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(
        outcomes: IndexMap<String, OutcomeMap>,
        statuses: IndexMap<String, ActionStatus>,
        context: &IndexMap<String, DocValue>,
        environment: HashMap<String, String>,
        strict_outcomes: bool,
        max_depth: usize,
    ) -> Self {
        let root_context = Arc::new(context.iter().map(|(k, v)| (k.clone(), load_context_node(v))).collect());
        let shared = Arc::new(TemplarShared {
            engine: build_engine(),
            strict_outcomes,
            max_depth,
            depth: AtomicUsize::new(0),
            outcomes,
            statuses,
            environment,
            root_context,
        });
        Self { shared }
    }

    pub fn render(&self, input: &str) -> Result<String, RenderError> {
        render_string(&self.shared, input)
    }

    pub fn recursive_render(&self, value: &DocValue) -> Result<serde_json::Value, RenderError> {
        match value {
            DocValue::String(s) => Ok(serde_json::Value::String(self.render(s)?)),
            DocValue::ObjectTemplate(expr) => {
                let evaluated = eval_expression(&self.shared, expr)?;
                Ok(containers::dynamic_to_json(evaluated))
            }
            DocValue::List(items) => {
                let rendered: Result<Vec<_>, _> = items.iter().map(|v| self.recursive_render(v)).collect();
                Ok(serde_json::Value::Array(rendered?))
            }
            DocValue::Map(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.recursive_render(v)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            other => Ok(other.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionStatus;

    fn templar(context: IndexMap<String, DocValue>, outcomes: IndexMap<String, OutcomeMap>, strict: bool) -> Templar {
        Templar::new(outcomes, IndexMap::new(), &context, HashMap::new(), strict)
    }

    #[test]
    fn plain_string_round_trips() {
        let t = templar(IndexMap::new(), IndexMap::new(), false);
        assert_eq!(t.render("hello world").unwrap(), "hello world");
    }

    #[test]
    fn double_at_escape_is_literal() {
        let t = templar(IndexMap::new(), IndexMap::new(), false);
        assert_eq!(t.render("@@{x}").unwrap(), "@@{x}");
    }

    #[test]
    fn unterminated_expression_renders_empty() {
        let t = templar(IndexMap::new(), IndexMap::new(), false);
        assert_eq!(t.render("a@{1+1").unwrap(), "a");
    }

    #[test]
    fn outcome_round_trip() {
        let mut a_outcomes = OutcomeMap::new();
        a_outcomes.insert("k".into(), "v".into());
        let mut outcomes = IndexMap::new();
        outcomes.insert("A".to_string(), a_outcomes);
        let t = templar(IndexMap::new(), outcomes, false);
        assert_eq!(t.render("@{outcomes.A.k}").unwrap(), "v");
    }

    #[test]
    fn strict_missing_outcome_key_errors() {
        let mut outcomes = IndexMap::new();
        outcomes.insert("A".to_string(), OutcomeMap::new());
        let t = templar(IndexMap::new(), outcomes, true);
        let err = t.render("@{outcomes.A.missing}").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn loose_missing_outcome_key_is_empty() {
        let mut outcomes = IndexMap::new();
        outcomes.insert("A".to_string(), OutcomeMap::new());
        let t = templar(IndexMap::new(), outcomes, false);
        assert_eq!(t.render("@{outcomes.A.missing}").unwrap(), "");
    }

    #[test]
    fn missing_action_in_status_is_render_error() {
        let t = templar(IndexMap::new(), IndexMap::new(), false);
        assert!(matches!(t.render("@{status.nope}").unwrap_err(), RenderError::ActionNotFound(_)));
    }

    #[test]
    fn object_template_merges_two_maps() {
        let mut a = IndexMap::new();
        a.insert("x".to_string(), DocValue::Number(1.0));
        let mut b = IndexMap::new();
        b.insert("y".to_string(), DocValue::Number(2.0));
        let mut context = IndexMap::new();
        context.insert("a".to_string(), DocValue::Map(a));
        context.insert("b".to_string(), DocValue::Map(b));
        context.insert(
            "merged".to_string(),
            DocValue::ObjectTemplate("let m = #{}; m.mixin(ctx.a); m.mixin(ctx.b); m".into()),
        );
        let t = templar(context, IndexMap::new(), false);
        assert_eq!(t.render("@{context.merged.x}").unwrap(), "1");
        assert_eq!(t.render("@{context.merged.y}").unwrap(), "2");
    }

    #[test]
    fn recursion_cap_catches_context_cycle() {
        let mut context = IndexMap::new();
        context.insert("a".to_string(), DocValue::String("@{context.b}".into()));
        context.insert("b".to_string(), DocValue::String("@{context.a}".into()));
        let t = Templar::with_max_depth(IndexMap::new(), IndexMap::new(), &context, HashMap::new(), false, 8);
        assert!(matches!(t.render("@{context.a}").unwrap_err(), RenderError::RecursionDepthExceeded));
    }

    #[test]
    fn restricted_builtin_is_rejected() {
        let t = templar(IndexMap::new(), IndexMap::new(), false);
        assert!(matches!(t.render("@{eval(\"1\")}").unwrap_err(), RenderError::RestrictedBuiltin(_)));
    }

    #[test]
    fn status_name_is_available_to_expressions() {
        let mut statuses = IndexMap::new();
        statuses.insert("A".to_string(), ActionStatus::Success);
        let t = Templar::new(IndexMap::new(), statuses, &IndexMap::new(), HashMap::new(), false);
        assert_eq!(t.render("@{status.A}").unwrap(), "SUCCESS");
    }
}
