//! CLI entry point: `grana run`, `grana validate`, `grana info version`,
//! `grana info env-vars`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use grana::config::{load_dotenv, CliOverrides, Config};
use grana::errors::{BaseError, LoadError};
use grana::loader::{self, LoadedWorkflow};
use grana::runner::{self, RunOutcome};
use grana::workflow::Workflow;
use grana::{display, strategy};

#[derive(Parser)]
#[command(name = "grana", about = "Declarative, dependency-aware task runner", long_about = None)]
struct Cli {
    /// Logging level: error, warn, info, debug, trace.
    #[arg(short = 'l', long = "log-level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a workflow.
    Run {
        /// Execution strategy: free, sequential, strict-sequential, loose, strict.
        #[arg(short = 's', long = "strategy")]
        strategy: Option<String>,
        /// Display sink.
        #[arg(short = 'd', long = "display")]
        display: Option<String>,
        /// Interactively select which selectable actions to run.
        #[arg(short = 'i', long = "interactive")]
        interactive: bool,
        /// Workflow file, or `-` for stdin. Defaults to `GRANA_WORKFLOW_FILE`,
        /// then a `grana.yml`/`grana.yaml` in the current directory.
        workflow: Option<String>,
    },
    /// Loads and integrity-checks a workflow without running it.
    Validate { workflow: Option<String> },
    /// Informational subcommands.
    Info {
        #[command(subcommand)]
        command: InfoCommand,
    },
}

#[derive(Subcommand)]
enum InfoCommand {
    /// Prints the binary's version.
    Version,
    /// Prints the environment variables the runner consults.
    EnvVars,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match &cli.command {
        Command::Info { command } => {
            match command {
                InfoCommand::Version => println!("{}", env!("CARGO_PKG_VERSION")),
                InfoCommand::EnvVars => print!("{}", grana::config::ENV_VARS_DOC),
            }
            0
        }
        Command::Validate { workflow } => run_validate(cli.log_level.clone(), workflow.clone()).await,
        Command::Run { strategy, display, interactive, workflow } => {
            run_workflow(cli.log_level.clone(), strategy.clone(), display.clone(), *interactive, workflow.clone())
                .await
        }
    };

    std::process::exit(code);
}

fn init(cli: &CliOverrides) -> Config {
    let config = Config::resolve(cli);
    load_dotenv(&config.env_file);
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    Config::install(config.clone());
    config
}

fn resolve_workflow_source(explicit: Option<String>, config: &Config) -> Result<String, BaseError> {
    if let Some(source) = explicit {
        return Ok(source);
    }
    if let Some(source) = &config.workflow_source {
        return Ok(source.clone());
    }
    for candidate in ["grana.yml", "grana.yaml"] {
        if Path::new(candidate).is_file() {
            return Ok(candidate.to_string());
        }
    }
    Ok("-".to_string())
}

fn load_workflow(source: &str) -> Result<LoadedWorkflow, BaseError> {
    if source == "-" {
        use std::io::Read;
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .map_err(|e| LoadError::new(format!("cannot read stdin: {e}")))?;
        Ok(loader::load_from_str(&text, Path::new("."))?)
    } else {
        Ok(loader::load_from_path(&PathBuf::from(source))?)
    }
}

async fn run_validate(log_level: Option<String>, workflow: Option<String>) -> i32 {
    let cli = CliOverrides { log_level, workflow_source: workflow.clone(), ..Default::default() };
    let config = init(&cli);

    match validate(&config, workflow) {
        Ok(()) => {
            println!("Workflow is valid.");
            0
        }
        Err(err) => {
            eprintln!("{err}");
            err.code().0 as i32
        }
    }
}

fn validate(config: &Config, workflow: Option<String>) -> Result<(), BaseError> {
    let source = resolve_workflow_source(workflow, config)?;
    let loaded = load_workflow(&source)?;
    Workflow::new(loaded.actions, loaded.context)?;
    Ok(())
}

async fn run_workflow(
    log_level: Option<String>,
    strategy_name: Option<String>,
    display_name: Option<String>,
    interactive: bool,
    workflow: Option<String>,
) -> i32 {
    let cli = CliOverrides {
        log_level,
        strategy_name: strategy_name.clone(),
        display_name: display_name.clone(),
        interactive: Some(interactive),
        workflow_source: workflow.clone(),
    };
    let config = init(&cli);

    match run_inner(&config, workflow).await {
        Ok(()) => 0,
        Err(RunOutcome::Base(err)) => {
            eprintln!("{err}");
            err.code().0 as i32
        }
        Err(RunOutcome::ExecutionFailed(err)) => {
            eprintln!("{err}");
            1
        }
    }
}

async fn run_inner(config: &Config, workflow: Option<String>) -> Result<(), RunOutcome> {
    let source = resolve_workflow_source(workflow, config).map_err(RunOutcome::Base)?;
    let loaded = load_workflow(&source).map_err(RunOutcome::Base)?;
    let workflow = Arc::new(
        Workflow::new(loaded.actions, loaded.context).map_err(|e| RunOutcome::Base(BaseError::from(e)))?,
    );

    let display_sink = display::build(&config.display_name, config.use_color, config.interactive)
        .map_err(|e| RunOutcome::Base(BaseError::Source(grana::errors::SourceError(e))))?;
    let display_sink: Arc<dyn display::Display> = Arc::from(display_sink);

    if strategy::build(&config.strategy_name, workflow.clone()).is_err() {
        return Err(RunOutcome::Base(BaseError::Source(grana::errors::SourceError(format!(
            "Unrecognized strategy: {:?}",
            config.strategy_name
        )))));
    }

    runner::run(
        workflow,
        &loaded.raw_args,
        &loaded.type_names,
        &loaded.required_packages,
        display_sink,
        &config.strategy_name,
        config.strict_outcomes_rendering,
    )
    .await
}
