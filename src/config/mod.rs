//! Runtime configuration: CLI flags, environment variables, and defaults,
//! resolved in that order of precedence.
//!
//! Mirrors the source's lazy-getter-chain constants: each knob is resolved
//! once, trying the CLI value first, then the matching `GRANA_*`
//! environment variable, then a hardcoded default.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

static GLOBAL: OnceCell<Config> = OnceCell::new();

/// CLI-sourced overrides, populated by the `clap` front-end before any
/// subcommand runs.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub log_level: Option<String>,
    pub display_name: Option<String>,
    pub strategy_name: Option<String>,
    pub interactive: Option<bool>,
    pub workflow_source: Option<String>,
}

/// Environment variables the runner consults. Documented here so `grana
/// info env-vars` can print this list.
pub const ENV_VARS_DOC: &str = "\
GRANA_LOG_LEVEL: Logging level. Default ERROR.
GRANA_LOG_FILE: Log file path. Defaults to the standard error stream.
GRANA_ENV_FILE: Dotenv file to load. Default .env in the current directory.
GRANA_WORKFLOW_FILE: Workflow file to use. Default: scan the current directory.
GRANA_DISPLAY_NAME: Display to use by name. Default prefixes.
GRANA_STRATEGY_NAME: Execution strategy. Default loose.
GRANA_FORCE_COLOR: Force colored (true) or plain (false) output.
GRANA_SHELL_INJECT_YIELD_FUNCTION: Inject yield_outcome/skip shell helpers. Default true.
GRANA_STRICT_OUTCOMES_RENDERING: Error (true) instead of empty string (false) on a missing outcome key. Default false.
";

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub env_file: PathBuf,
    pub context_directory: PathBuf,
    pub interactive: bool,
    pub workflow_source: Option<String>,
    pub display_name: String,
    pub strategy_name: String,
    pub use_color: bool,
    pub shell_inject_yield_function: bool,
    pub strict_outcomes_rendering: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "ERROR".into(),
            log_file: None,
            env_file: Path::new(".env").to_path_buf(),
            context_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            interactive: false,
            workflow_source: None,
            display_name: "prefixes".into(),
            strategy_name: "loose".into(),
            use_color: false,
            shell_inject_yield_function: true,
            strict_outcomes_rendering: false,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_string(name) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        None => default,
    }
}

impl Config {
    pub fn resolve(cli: &CliOverrides) -> Self {
        let defaults = Self::default();
        Self {
            log_level: cli
                .log_level
                .clone()
                .or_else(|| env_string("GRANA_LOG_LEVEL"))
                .unwrap_or(defaults.log_level),
            log_file: env_string("GRANA_LOG_FILE").map(PathBuf::from),
            env_file: env_string("GRANA_ENV_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.env_file),
            context_directory: defaults.context_directory,
            interactive: cli.interactive.unwrap_or(defaults.interactive),
            workflow_source: cli
                .workflow_source
                .clone()
                .or_else(|| env_string("GRANA_WORKFLOW_FILE")),
            display_name: cli
                .display_name
                .clone()
                .or_else(|| env_string("GRANA_DISPLAY_NAME"))
                .unwrap_or(defaults.display_name),
            strategy_name: cli
                .strategy_name
                .clone()
                .or_else(|| env_string("GRANA_STRATEGY_NAME"))
                .unwrap_or(defaults.strategy_name),
            use_color: env_string("GRANA_FORCE_COLOR")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or_else(|| is_stdout_tty()),
            shell_inject_yield_function: env_bool(
                "GRANA_SHELL_INJECT_YIELD_FUNCTION",
                defaults.shell_inject_yield_function,
            ),
            strict_outcomes_rendering: env_bool(
                "GRANA_STRICT_OUTCOMES_RENDERING",
                defaults.strict_outcomes_rendering,
            ),
        }
    }

    /// Installs `config` as the process-wide configuration. Only the first
    /// call has effect; later calls are ignored (mirrors a one-shot init).
    pub fn install(config: Config) {
        let _ = GLOBAL.set(config);
    }

    /// The process-wide configuration, falling back to defaults if `install`
    /// was never called (e.g. in unit tests exercising a single module).
    pub fn global() -> &'static Config {
        GLOBAL.get_or_init(Config::default)
    }
}

#[cfg(unix)]
fn is_stdout_tty() -> bool {
    use std::io::IsTerminal;
    std::io::stdout().is_terminal()
}

#[cfg(not(unix))]
fn is_stdout_tty() -> bool {
    false
}

/// Loads environment variables from a dotenv file, if present. A `HERE`
/// variable pointing at the file's directory is injected while loading
/// unless already set, matching the source's convenience variable.
pub fn load_dotenv(env_file: &Path) {
    let here_was_set = std::env::var("HERE").is_ok();
    if !here_was_set {
        if let Some(parent) = env_file.parent() {
            std::env::set_var("HERE", parent);
        }
    }
    if dotenvy::from_path(env_file).is_err() {
        tracing::debug!(path = %env_file.display(), "dotenv file not found");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_take_precedence_over_defaults() {
        let cli = CliOverrides {
            strategy_name: Some("strict".into()),
            ..Default::default()
        };
        let config = Config::resolve(&cli);
        assert_eq!(config.strategy_name, "strict");
        assert_eq!(config.display_name, "prefixes");
    }
}
