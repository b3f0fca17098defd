use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use swe_pipeline::config;
use swe_pipeline::coordinator::Coordinator;
use swe_pipeline::patterns::PatternStore;
use swe_pipeline::state::StateStore;

#[derive(Parser)]
#[command(name = "swe-pipeline")]
#[command(version, about = "Autonomous software-engineering pipeline coordinator")]
pub struct Cli {
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator loop until quiescence, documentation completion, or cancellation
    Run,
    /// Show current task/objective/phase progress
    Status,
    /// Inspect learned execution patterns
    Patterns {
        #[command(subcommand)]
        command: Option<PatternsCommands>,
    },
    /// View or validate `pipeline.ini`
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum PatternsCommands {
    /// Show a single pattern's signature, confidence, and occurrence count
    Show { signature: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the loaded configuration
    Show,
    /// Load `pipeline.ini` and report whether it is valid
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => match std::env::current_dir().context("failed to get current directory") {
            Ok(dir) => dir,
            Err(err) => {
                eprintln!("{err:#}");
                return ExitCode::from(2);
            }
        },
    };

    match run(&cli, project_dir).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: &Cli, project_dir: PathBuf) -> Result<u8> {
    match &cli.command {
        Commands::Run => cmd_run(project_dir).await,
        Commands::Status => cmd_status(&project_dir),
        Commands::Patterns { command } => cmd_patterns(&project_dir, command.clone()),
        Commands::Config { command } => cmd_config(&project_dir, command.clone()),
    }
}

async fn cmd_run(project_dir: PathBuf) -> Result<u8> {
    let config = config::load(&project_dir).context("failed to load pipeline.ini")?;
    init_logging(&config)?;
    swe_pipeline::signal::install_handlers().map_err(anyhow::Error::msg)?;

    let mut coordinator = Coordinator::new(config).context("failed to start coordinator")?;
    let outcome = coordinator.run().await.context("coordinator run failed")?;

    println!(
        "run finished after {} iterations: {:?} (exit {})",
        outcome.iterations, outcome.terminal_reason, outcome.exit_code
    );
    Ok(outcome.exit_code as u8)
}

fn init_logging(config: &config::RunConfig) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    std::fs::create_dir_all(&config.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "pipeline.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leak the guard: it must outlive every writer and the process exits
    // via ExitCode rather than dropping main's locals in order.
    std::mem::forget(guard);

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(non_blocking).json().init();
    Ok(())
}

fn cmd_status(project_dir: &std::path::Path) -> Result<u8> {
    let config = config::load(project_dir).context("failed to load pipeline.ini")?;
    let store = StateStore::load(&config.state_dir)?;
    let state = store.state();

    println!();
    println!("Pipeline status");
    println!("===============");
    println!("Iteration: {}", state.iteration);
    println!("Tasks:     {}", state.tasks.len());
    for (name, phase_state) in &state.phases {
        println!(
            "  {:<18} iterations={:<4} no_update_count={:<3} last_result={:?}",
            name, phase_state.iterations, phase_state.no_update_count, phase_state.last_result
        );
    }
    println!();
    Ok(0)
}

fn cmd_patterns(project_dir: &std::path::Path, command: Option<PatternsCommands>) -> Result<u8> {
    let config = config::load(project_dir).context("failed to load pipeline.ini")?;
    let store = StateStore::load(&config.state_dir)?;
    let patterns = PatternStore::from_patterns(store.state().patterns.clone());

    match command {
        None => {
            println!();
            for pattern in patterns.patterns() {
                println!(
                    "[{:?}] {} (confidence {:.2}, seen {} times)",
                    pattern.kind, pattern.signature, pattern.confidence, pattern.occurrences
                );
            }
            println!();
        }
        Some(PatternsCommands::Show { signature }) => match patterns.patterns().iter().find(|p| p.signature == signature) {
            Some(pattern) => {
                println!();
                println!("{:#?}", pattern);
                println!();
            }
            None => println!("no pattern with signature '{signature}'"),
        },
    }
    Ok(0)
}

fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<u8> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = config::load(project_dir).context("failed to load pipeline.ini")?;
            println!();
            println!("Pipeline configuration");
            println!("======================");
            println!("state_dir:            {}", config.state_dir.display());
            println!("ipc_dir:              {}", config.ipc_dir.display());
            println!("endpoints:            {}", config.endpoints.join(", "));
            println!("deny_tools:           {}", config.deny_tools.join(", "));
            println!("stagnation_threshold: {}", config.stagnation_threshold);
            println!("context_tokens:       {}", config.context_tokens);
            println!("tool_deadline_secs:   {}", config.tool_deadline_secs);
            println!("log_level:            {}", config.log_level);
            println!("model_assignments:    {} role(s)", config.model_assignments.len());
            println!();
        }
        Some(ConfigCommands::Validate) => match config::load(project_dir) {
            Ok(_) => println!("pipeline.ini is valid"),
            Err(err) => {
                println!("pipeline.ini is invalid: {err}");
                return Ok(2);
            }
        },
    }
    Ok(0)
}
