//! Topoform CLI entrypoint.
//!
//! This is the main entrypoint for the topoform command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use topoform::cli::{Cli, Commands, LogFormat, OutputFormat, OutputFormatter, StateCommands};
use topoform::config::{
    find_config_file, ConfigHasher, ConfigParser, ConfigValidator, StateBackend, TopologyConfig,
};
use topoform::error::{Result, StateError};
use topoform::graph::GraphBuilder;
use topoform::planner::{PlanExecutor, Planner};
use topoform::provider::SimulatedProvider;
use topoform::refresh::Refresher;
use topoform::state::{
    generate_holder_id, HistoryEntry, HistoryOperation, LocalStateStore, MemoryStateStore,
    StateStore, STATE_DIR,
};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `--verbose` forces debug output; otherwise `RUST_LOG` wins over the
/// default `info` level.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => cmd_validate(config, warnings),
        Commands::Graph { dot } => cmd_graph(config, dot, &formatter).map(|()| ExitCode::SUCCESS),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, parallelism } => {
            cmd_apply(config, yes, parallelism, cli.output, &formatter).await
        }
        Commands::Destroy { targets, yes } => {
            cmd_destroy(config, &targets, yes, cli.output, &formatter).await
        }
        Commands::Refresh { write } => cmd_refresh(config, write, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Topoform project in: {}", path.display());

    let config_path = path.join("topoform.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/topoform.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Topoform")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(STATE_DIR) {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit topoform.yaml with your resources");
    eprintln!("  2. Run 'topoform validate' to check your configuration");
    eprintln!("  3. Run 'topoform plan' to see what will change");
    eprintln!("  4. Run 'topoform apply' to materialize it");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    if !result.is_valid() {
        eprintln!("Configuration is invalid ({} errors):", result.error_count());
        for error in &result.errors {
            eprintln!("  - {}: {}", error.field, error.message);
        }
        return Ok(ExitCode::FAILURE);
    }

    let graph = GraphBuilder::new().build(&config.resources)?;
    eprintln!("Configuration is valid!");
    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    }

    eprintln!("\nConfiguration summary:");
    eprintln!("  Project: {}", config.project.name);
    eprintln!("  Environment: {}", config.project.environment);
    eprintln!("  Resources: {}", graph.len());
    eprintln!("  Dependencies: {}", graph.edges().len());
    eprintln!("  Graph depth: {}", graph.levels().len());

    Ok(ExitCode::SUCCESS)
}

/// Show the dependency graph.
fn cmd_graph(config_path: Option<&Path>, dot: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let graph = GraphBuilder::new().build(&config.resources)?;
    print!("{}", formatter.format_graph(&graph, dot));
    Ok(())
}

/// Show the execution plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store, _) = load_config_and_state(config_path)?;
    let state = store.load().await?;
    let plan = Planner::new(&config).plan(state.as_ref())?;

    println!("{}", formatter.format_plan(&plan, detailed));

    Ok(if plan.passes_guardrails {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Apply the execution plan.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    parallelism: Option<usize>,
    output: OutputFormat,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store, cloud) = load_config_and_state(config_path)?;
    let provider = open_provider(&config, cloud).await?;

    with_lock(store.as_ref(), "apply", async {
        let state = store.load().await?;
        let plan = Planner::new(&config).plan(state.as_ref())?;

        if !plan.has_changes() {
            eprintln!("No changes to apply.");
            return Ok(ExitCode::SUCCESS);
        }

        if output == OutputFormat::Text {
            println!("{}", formatter.format_plan(&plan, false));
        }

        if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }

        let mut executor = PlanExecutor::new(&provider, store.as_ref(), &config.engine)
            .with_cancellation(cancel_on_ctrl_c());
        if let Some(n) = parallelism {
            executor = executor.with_parallelism(n);
        }

        let report = executor.execute(&plan).await?;
        println!("{}", formatter.format_report(&report));

        Ok(if report.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    })
    .await
}

/// Destroy recorded resources.
async fn cmd_destroy(
    config_path: Option<&Path>,
    targets: &[String],
    auto_approve: bool,
    output: OutputFormat,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store, cloud) = load_config_and_state(config_path)?;
    let provider = open_provider(&config, cloud).await?;

    with_lock(store.as_ref(), "destroy", async {
        let Some(state) = store.load().await?.filter(|s| !s.is_empty()) else {
            eprintln!("No resources to destroy.");
            return Ok(ExitCode::SUCCESS);
        };

        let plan = Planner::new(&config).plan_destroy(&state, targets)?;
        if output == OutputFormat::Text {
            println!("{}", formatter.format_plan(&plan, false));
        }

        if !auto_approve
            && !confirm("This action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
        {
            eprintln!("Destruction cancelled.");
            return Ok(ExitCode::SUCCESS);
        }

        let report = PlanExecutor::new(&provider, store.as_ref(), &config.engine)
            .with_cancellation(cancel_on_ctrl_c())
            .with_history(HistoryOperation::Destroy)
            .execute(&plan)
            .await?;
        println!("{}", formatter.format_report(&report));

        Ok(if report.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    })
    .await
}

/// Check recorded resources for drift.
async fn cmd_refresh(
    config_path: Option<&Path>,
    write: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store, cloud) = load_config_and_state(config_path)?;
    let provider = open_provider(&config, cloud).await?;
    let config_hash = ConfigHasher::new().hash_config(&config);

    let refresher = Refresher::new(&provider, store.as_ref(), &config.engine)
        .with_write(write)
        .with_cancellation(cancel_on_ctrl_c());

    let report = if write {
        with_lock(store.as_ref(), "refresh", refresher.refresh(&config_hash)).await?
    } else {
        refresher.refresh(&config_hash).await?
    };

    println!("{}", formatter.format_drift(&report));
    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store, _) = load_config_and_state(config_path)?;

    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => println!("{}", formatter.format_state(&state)),
            None => eprintln!("No state found."),
        },
        StateCommands::List => match store.load().await? {
            Some(state) => print!("{}", formatter.format_state_list(&state)),
            None => eprintln!("No state found."),
        },
        StateCommands::Rm { name } => {
            let config_hash = ConfigHasher::new().hash_config(&config);
            with_lock(store.as_ref(), "state rm", async {
                let state = store.load().await?;
                if state.as_ref().and_then(|s| s.record(&name)).is_none() {
                    return Err(StateError::ResourceNotFound { name: name.clone() }.into());
                }
                store.delete_record(&name).await?;
                store
                    .append_history(HistoryEntry::new(
                        HistoryOperation::StateRm,
                        &config_hash,
                        vec![name.clone()],
                    ))
                    .await?;
                Ok(())
            })
            .await?;
            eprintln!("Removed '{name}' from state. The remote object was left untouched.");
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual").await?;
            eprintln!("State locked: {} (expires {})", lock.lock_id, lock.expires_at);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Directory holding the configuration file.
fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Loads, overrides and validates the configuration.
fn load_config(config_path: Option<&Path>) -> Result<(TopologyConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base = config_dir(&config_file);
    let parser = ConfigParser::new().with_base_path(&base);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    Ok((config, base))
}

/// Loads configuration and creates the configured state store.
///
/// Returns the configuration, the store and the file backing the simulated
/// cloud (`None` keeps it in memory).
fn load_config_and_state(
    config_path: Option<&Path>,
) -> Result<(TopologyConfig, Box<dyn StateStore>, Option<PathBuf>)> {
    let (config, base) = load_config(config_path)?;
    let state_dir = config.state.dir(&base);

    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => Box::new(
            LocalStateStore::with_base_dir(&state_dir)
                .for_project(&config.project.name, &config.project.environment),
        ),
        StateBackend::Memory => Box::new(MemoryStateStore::new(
            &config.project.name,
            &config.project.environment,
        )),
    };
    debug!("Using {} state backend", store.backend_type());

    let cloud = match (&config.simulator.path, config.state.backend) {
        (None, StateBackend::Memory) => None,
        _ => Some(config.simulator.cloud_path(&base, &state_dir)),
    };

    Ok((config, store, cloud))
}

/// Opens the simulated cloud, in memory when no backing file is given.
async fn open_provider(config: &TopologyConfig, cloud: Option<PathBuf>) -> Result<SimulatedProvider> {
    let latency = Duration::from_millis(config.simulator.latency_ms);
    let provider = match cloud {
        Some(path) => SimulatedProvider::persistent(path).await?,
        None => SimulatedProvider::new(),
    };
    Ok(provider.with_latency(latency))
}

/// Runs `work` while holding the state lock.
async fn with_lock<T>(
    store: &dyn StateStore,
    operation: &str,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let holder = generate_holder_id();
    let lock = store.acquire_lock(&holder, operation).await?;
    debug!("Acquired state lock {} for {operation}", lock.lock_id);

    let result = work.await;

    if let Err(e) = store.release_lock(&lock.lock_id).await {
        warn!("Failed to release state lock {}: {e}", lock.lock_id);
    }
    result
}

/// Returns a token cancelled on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, letting in-flight operations finish");
            trigger.cancel();
        }
    });
    token
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}
