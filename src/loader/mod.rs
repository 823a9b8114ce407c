//! Bundled YAML workflow loader.
//!
//! Parses a document with top-level keys `actions`, `context`, and
//! `configuration`. `!import <path>` pulls in another file restricted to
//! the same top-level key it appears under; `!@ <expr>` tags a scalar as
//! an object-template marker, handled by [`crate::rendering`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::action::bundled::build_action;
use crate::action::{check_reserved_argument_names, Action, Dependency, Severity};
use crate::errors::{LoadError, PackageRequirementError};
use crate::rendering::DocValue;

const TOP_LEVEL_KEYS: &[&str] = &["actions", "context", "configuration"];
const CONFIGURATION_KEYS: &[&str] = &["requires_packages"];

pub struct LoadedWorkflow {
    pub actions: IndexMap<String, std::sync::Arc<Action>>,
    /// The as-loaded argument tree per action, kept for re-rendering at
    /// each dispatch (the renderer always starts from this, not a
    /// previous render's output).
    pub raw_args: IndexMap<String, DocValue>,
    /// The `type:` field per action, needed to rebuild its body from the
    /// freshly rendered arguments at dispatch time.
    pub type_names: IndexMap<String, String>,
    pub context: IndexMap<String, DocValue>,
    pub configuration: IndexMap<String, DocValue>,
    /// `configuration.requires_packages`, normalized to a list of command
    /// names. Checked once by [`check_requirements`] before a run starts.
    pub required_packages: Vec<String>,
}

pub fn load_from_path(path: &Path) -> Result<LoadedWorkflow, LoadError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| LoadError::new(format!("cannot read {}: {e}", path.display())).with_source(path.display().to_string()))?;
    load_from_str(&text, path.parent().unwrap_or_else(|| Path::new(".")))
}

pub fn load_from_str(text: &str, base_dir: &Path) -> Result<LoadedWorkflow, LoadError> {
    let raw: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| LoadError::new(format!("invalid YAML: {e}")))?;
    let mapping = match raw {
        serde_yaml::Value::Mapping(m) if !m.is_empty() => m,
        serde_yaml::Value::Mapping(_) => return Err(LoadError::new("empty workflow document")),
        _ => return Err(LoadError::new("workflow document root must be a mapping")),
    };

    let known: HashSet<&str> = TOP_LEVEL_KEYS.iter().copied().collect();
    for key in mapping.keys() {
        let key = key.as_str().ok_or_else(|| LoadError::new("top-level keys must be strings"))?;
        if !known.contains(key) {
            return Err(LoadError::new(format!("unrecognized top-level key: {key:?}")));
        }
    }

    let action_docs = resolve_imports(mapping.get("actions").cloned(), base_dir, "actions")?;
    let context_docs = resolve_imports(mapping.get("context").cloned(), base_dir, "context")?;
    let configuration_doc = mapping.get("configuration").cloned().unwrap_or(serde_yaml::Value::Null);

    let mut raw_args = IndexMap::new();
    let mut type_names = IndexMap::new();
    let mut actions = IndexMap::new();
    for doc in action_docs {
        let (name, type_name, action, args) = build_action_entry(doc)?;
        if actions.contains_key(&name) {
            return Err(LoadError::new(format!("duplicate action name: {name:?}")));
        }
        raw_args.insert(name.clone(), args);
        type_names.insert(name.clone(), type_name);
        actions.insert(name, std::sync::Arc::new(action));
    }

    let mut context = IndexMap::new();
    for doc in context_docs {
        let entries = doc
            .as_mapping()
            .ok_or_else(|| LoadError::new("each context document must be a mapping"))?;
        for (k, v) in entries {
            let key = k.as_str().ok_or_else(|| LoadError::new("context keys must be strings"))?.to_string();
            context.insert(key, DocValue::from_yaml(v.clone()).map_err(LoadError::new)?);
        }
    }

    let configuration = match DocValue::from_yaml(configuration_doc).map_err(LoadError::new)? {
        DocValue::Map(map) => map,
        DocValue::Null => IndexMap::new(),
        _ => return Err(LoadError::new("configuration must be a mapping")),
    };
    let required_packages = parse_required_packages(&configuration)?;

    Ok(LoadedWorkflow { actions, raw_args, type_names, context, configuration, required_packages })
}

/// Validates `configuration` against its one recognized key and normalizes
/// `requires_packages` (a string or a list of strings) into a flat list of
/// command names.
fn parse_required_packages(configuration: &IndexMap<String, DocValue>) -> Result<Vec<String>, LoadError> {
    let known: HashSet<&str> = CONFIGURATION_KEYS.iter().copied().collect();
    for key in configuration.keys() {
        if !known.contains(key.as_str()) {
            return Err(LoadError::new(format!(
                "unrecognized configuration key: {key:?} (expected one of: {CONFIGURATION_KEYS:?})"
            )));
        }
    }

    let Some(value) = configuration.get("requires_packages") else {
        return Ok(Vec::new());
    };
    match value {
        DocValue::String(s) => Ok(vec![s.clone()]),
        DocValue::List(items) => items
            .iter()
            .map(|item| match item {
                DocValue::String(s) => Ok(s.clone()),
                other => Err(LoadError::new(format!(
                    "configuration.requires_packages entries must be strings, got {other:?}"
                ))),
            })
            .collect(),
        other => Err(LoadError::new(format!(
            "configuration.requires_packages must be a string or a list of strings, got {other:?}"
        ))),
    }
}

/// Checks that every name in `required_packages` resolves to an executable
/// on `PATH`. The Python original resolves installed-package version
/// constraints via `importlib.metadata`; the closest analogue for a runner
/// whose bundled actions only shell out is "is this command available",
/// so `requires_packages` names commands here, not crates.
pub fn check_requirements(required_packages: &[String]) -> Result<(), PackageRequirementError> {
    let path_dirs: Vec<PathBuf> = std::env::var_os("PATH").map(|p| std::env::split_paths(&p).collect()).unwrap_or_default();

    let missing: Vec<&str> = required_packages
        .iter()
        .map(String::as_str)
        .filter(|name| !path_dirs.iter().any(|dir| is_executable(&dir.join(name))))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }
    let mut lines = vec!["Following package requirements were not satisfied:".to_string()];
    for name in missing {
        lines.push(format!("    Requested {name:?}, not found on PATH"));
    }
    Err(PackageRequirementError(lines.join("\n")))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Expands `!import <path>` clauses under one top-level key into a flat
/// list of documents (each either the original inline mapping, for
/// `context`, or a single element of the `actions` sequence).
fn resolve_imports(
    value: Option<serde_yaml::Value>,
    base_dir: &Path,
    section: &str,
) -> Result<Vec<serde_yaml::Value>, LoadError> {
    let mut out = Vec::new();
    let Some(value) = value else { return Ok(out) };
    match value {
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                out.extend(resolve_one(item, base_dir, section)?);
            }
        }
        other => out.extend(resolve_one(other, base_dir, section)?),
    }
    Ok(out)
}

fn resolve_one(
    value: serde_yaml::Value,
    base_dir: &Path,
    section: &str,
) -> Result<Vec<serde_yaml::Value>, LoadError> {
    if let serde_yaml::Value::Tagged(tagged) = &value {
        if tagged.tag.to_string() == "!import" {
            let path = match &tagged.value {
                serde_yaml::Value::String(s) => s.clone(),
                other => return Err(LoadError::new(format!("!import requires a string path, got {other:?}"))),
            };
            return load_import(base_dir, &path, section);
        }
    }
    Ok(vec![value])
}

fn load_import(base_dir: &Path, relative: &str, section: &str) -> Result<Vec<serde_yaml::Value>, LoadError> {
    let full_path = base_dir.join(relative);
    let text = std::fs::read_to_string(&full_path)
        .map_err(|e| LoadError::new(format!("cannot read import {relative:?}: {e}")).with_source(relative.to_string()))?;
    let imported: serde_yaml::Value = serde_yaml::from_str(&text)
        .map_err(|e| LoadError::new(format!("invalid YAML in import {relative:?}: {e}")).with_source(relative.to_string()))?;
    let next_base = full_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    resolve_imports(Some(imported), &next_base, section).map_err(|e| e.with_source(relative.to_string()))
}

fn build_action_entry(doc: serde_yaml::Value) -> Result<(String, String, Action, DocValue), LoadError> {
    let mapping = doc.as_mapping().ok_or_else(|| LoadError::new("each action must be a mapping"))?;

    let get_str = |key: &str| -> Option<String> {
        mapping.get(key).and_then(|v| v.as_str()).map(str::to_string)
    };

    let name = get_str("name").ok_or_else(|| LoadError::new("action is missing a `name`"))?;
    let type_name = get_str("type").ok_or_else(|| LoadError::new(format!("action {name:?} is missing a `type`")))?;
    let description = get_str("description");
    let selectable = mapping.get("selectable").and_then(|v| v.as_bool()).unwrap_or(true);
    let severity = match get_str("severity").as_deref() {
        Some("low") => Severity::Low,
        Some("normal") | None => Severity::Normal,
        Some(other) => return Err(LoadError::new(format!("action {name:?} has unknown severity {other:?}"))),
    };

    let mut ancestors = IndexMap::new();
    if let Some(expects) = mapping.get("expects") {
        let list = expects.as_sequence().ok_or_else(|| LoadError::new(format!("action {name:?}: `expects` must be a list")))?;
        for entry in list {
            let (ancestor_name, dep) = parse_dependency(entry, &name)?;
            ancestors.insert(ancestor_name, dep);
        }
    }

    let reserved_keys = ["name", "type", "description", "expects", "selectable", "severity"];
    let arg_fields: Vec<String> = mapping
        .keys()
        .filter_map(|k| k.as_str().map(str::to_string))
        .filter(|k| !reserved_keys.contains(&k.as_str()))
        .collect();
    check_reserved_argument_names(arg_fields.iter().map(String::as_str))
        .map_err(|e| LoadError::new(format!("action {name:?}: {e}")))?;

    let mut args_mapping = serde_yaml::Mapping::new();
    for field in &arg_fields {
        if let Some(v) = mapping.get(field.as_str()) {
            args_mapping.insert(serde_yaml::Value::String(field.clone()), v.clone());
        }
    }
    let args_doc = DocValue::from_yaml(serde_yaml::Value::Mapping(args_mapping.clone()))
        .map_err(|e| LoadError::new(format!("action {name:?}: {e}")))?;
    let args_json: serde_json::Value = serde_yaml::from_value(serde_yaml::Value::Mapping(args_mapping))
        .map_err(|e| LoadError::new(format!("action {name:?}: {e}")))?;

    let action = build_action(&type_name, name.clone(), description, severity, selectable, ancestors, args_json)
        .map_err(|e| LoadError::new(format!("action {name:?}: {e}")))?;

    Ok((name, type_name, action, args_doc))
}

fn parse_dependency(entry: &serde_yaml::Value, action_name: &str) -> Result<(String, Dependency), LoadError> {
    match entry {
        serde_yaml::Value::String(s) => Ok((s.clone(), Dependency { strict: false, external: false })),
        serde_yaml::Value::Mapping(m) => {
            let name = m
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| LoadError::new(format!("action {action_name:?}: dependency entry missing `name`")))?
                .to_string();
            let strict = m.get("strict").and_then(|v| v.as_bool()).unwrap_or(false);
            let external = m.get("external").and_then(|v| v.as_bool()).unwrap_or(false);
            Ok((name, Dependency { strict, external }))
        }
        other => Err(LoadError::new(format!("action {action_name:?}: invalid dependency entry {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn loads_single_echo_action() {
        let yaml = r#"
actions:
  - name: echo-0
    type: echo
    message: foo
"#;
        let loaded = load_from_str(yaml, Path::new(".")).unwrap();
        assert!(loaded.actions.contains_key("echo-0"));
    }

    #[test]
    fn rejects_unrecognized_top_level_key() {
        let yaml = "bogus: {}\n";
        assert!(load_from_str(yaml, Path::new(".")).is_err());
    }

    #[test]
    fn strict_dependency_round_trips() {
        let yaml = r#"
actions:
  - name: a
    type: echo
    message: a
  - name: b
    type: echo
    message: b
    expects:
      - name: a
        strict: true
"#;
        let loaded = load_from_str(yaml, Path::new(".")).unwrap();
        assert!(loaded.actions["b"].ancestors["a"].strict);
    }
}
