//! Thot CLI entrypoint.
//!
//! This is the main entrypoint for the `thot` command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use thot_stack::cli::{Cli, Commands, OutputFormatter, StateCommands};
use thot_stack::config::{ConfigParser, ConfigValidator, StackConfig, find_config_file};
use thot_stack::deployer::{Deployer, create_backend, create_state_store};
use thot_stack::error::Result;
use thot_stack::graph::Scheduler;
use thot_stack::planner::CancelFlag;
use thot_stack::state::{STATE_DIR, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type StackDeployer = Deployer<Box<dyn StateStore>>;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, prune } => cmd_apply(config, yes, prune, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::Outputs { name } => cmd_outputs(config, name.as_deref(), &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new thot stack in: {}", path.display());

    let config_path = path.join("thot.stack.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/thot.stack.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# thot")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit thot.stack.yaml to describe your site");
    eprintln!("  2. Run 'thot validate' to check the stack file");
    eprintln!("  3. Run 'thot plan' to preview what will be provisioned");
    eprintln!("  4. Run 'thot apply' to provision the stack");

    Ok(())
}

/// Validate the stack file and its graph.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(config_path)?;

    let result = ConfigValidator::new().check(&config);
    for err in &result.errors {
        eprintln!("  ✗ {err}");
    }
    ConfigValidator::new().validate(&config)?;

    let stack = config.build_stack()?;
    let plan = Scheduler::schedule(&stack)?;

    if formatter.is_json() {
        let summary = serde_json::json!({
            "valid": true,
            "stack": config.stack.name,
            "environment": config.stack.environment,
            "resources": stack.len(),
            "outputs": stack.outputs().len(),
            "batches": plan.batches(),
            "warnings": result.warnings,
        });
        emit(&serde_json::to_string_pretty(&summary).unwrap_or_default());
        return Ok(());
    }

    eprintln!("Stack file is valid!");
    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    } else if result.warning_count() > 0 {
        eprintln!("{} warnings (use --warnings to show)", result.warning_count());
    }

    eprintln!("\nStack summary:");
    eprintln!("  Stack: {}", config.stack.name);
    eprintln!("  Environment: {}", config.stack.environment);
    eprintln!("  Resources: {}", stack.len());
    eprintln!("  Outputs: {}", stack.outputs().len());
    eprintln!("  Batches: {}", plan.batch_count());

    Ok(())
}

/// Show what an apply would do.
async fn cmd_plan(config_path: Option<&Path>, detailed: bool, formatter: &OutputFormatter) -> Result<()> {
    let deployer = load_deployer(config_path, CancelFlag::new()).await?;
    let plan = deployer.plan().await?;
    emit(&formatter.format_plan(&plan, detailed));
    Ok(())
}

/// Provision the stack.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    prune: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let cancel = CancelFlag::new();
    let deployer = load_deployer(config_path, cancel.clone()).await?;
    watch_ctrl_c(cancel);

    let plan = deployer.plan().await?;
    if !plan.has_changes() && !(prune && !plan.orphans.is_empty()) {
        eprintln!("No changes to apply.");
        if !plan.orphans.is_empty() {
            eprintln!("{} orphaned resources remain; run with --prune to delete them.", plan.orphans.len());
        }
        return Ok(());
    }

    if !formatter.is_json() {
        eprintln!("{}", formatter.format_plan(&plan, false));
    }

    if plan.has_changes() {
        if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }

        let outcome = deployer.apply().await?;
        emit(&formatter.format_apply(&outcome));

        if let Some(err) = outcome.report.error() {
            return Err(err.into());
        }
    }

    if prune {
        let orphans = deployer.orphans().await?;
        if orphans.is_empty() {
            return Ok(());
        }
        eprintln!("\nThe following orphaned resources will be deleted:");
        for orphan in &orphans {
            eprintln!("  - {} {} ({}): {}", orphan.kind, orphan.id, orphan.physical_id, orphan.reason);
        }
        if !auto_approve && !confirm("Delete them? [y/N]: ")? {
            eprintln!("Prune cancelled.");
            return Ok(());
        }

        let report = deployer.prune().await?;
        emit(&formatter.format_run(&report));
        if let Some(err) = report.error() {
            return Err(err.into());
        }
    }

    Ok(())
}

/// Delete every recorded resource.
async fn cmd_destroy(config_path: Option<&Path>, auto_approve: bool, formatter: &OutputFormatter) -> Result<()> {
    let cancel = CancelFlag::new();
    let deployer = load_deployer(config_path, cancel.clone()).await?;

    let Some(snapshot) = deployer.store().load().await? else {
        eprintln!("No state found, nothing to destroy.");
        return Ok(());
    };
    if snapshot.is_empty() {
        eprintln!("No resources recorded, nothing to destroy.");
        return Ok(());
    }

    eprintln!("The following resources will be destroyed:");
    for record in snapshot.resources.values().chain(snapshot.retired.iter()) {
        eprintln!("  - {} {} ({})", record.kind, record.id, record.physical_id);
    }

    if !auto_approve {
        eprint!("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ");
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if input.trim() != "destroy" {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }
    }

    watch_ctrl_c(cancel);
    let report = deployer.destroy().await?;
    emit(&formatter.format_run(&report));

    match report.error() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Show stack outputs.
async fn cmd_outputs(config_path: Option<&Path>, name: Option<&str>, formatter: &OutputFormatter) -> Result<()> {
    let deployer = load_deployer(config_path, CancelFlag::new()).await?;
    let outputs = deployer.outputs(name).await?;
    emit(&formatter.format_outputs(&outputs));

    // A single requested output must resolve.
    if name.is_some() {
        if let Some((_, Err(err))) = outputs.into_iter().next() {
            return Err(err.into());
        }
    }
    Ok(())
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let deployer = load_deployer(config_path, CancelFlag::new()).await?;
    let report = deployer.check_drift().await?;
    emit(&formatter.format_drift(&report));
    Ok(())
}

/// State management commands.
async fn cmd_state(config_path: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let (config, base_dir) = load_config(config_path)?;
    let store = create_state_store(&config, &base_dir).await?;

    match command {
        StateCommands::Show => {
            if let Some(snapshot) = store.load().await? {
                emit(&formatter.format_state(&snapshot, &store.location()));
            } else {
                eprintln!("No state found at {}.", store.location());
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or("")).await?;
            eprintln!("State locked: {} (holder: {})", lock.lock_id, lock.holder);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                warn!("Force unlocking state at {}", store.location());
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes a command result to stdout.
#[allow(clippy::print_stdout)]
fn emit(text: &str) {
    println!("{text}");
}

/// Prompts on stderr and reads a yes/no answer.
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Raises the cancellation flag on Ctrl-C.
///
/// Calls already in flight finish; nothing new is started.
fn watch_ctrl_c(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight calls before stopping");
            cancel.cancel();
        }
    });
}

/// Resolves the stack file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads `.env` and the stack file, returning the stack file's directory.
fn load_config(config_path: Option<&Path>) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading stack file from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    Ok((config, base_dir))
}

/// Loads and validates the stack, then wires its state store and backend.
async fn load_deployer(config_path: Option<&Path>, cancel: CancelFlag) -> Result<StackDeployer> {
    let (config, base_dir) = load_config(config_path)?;
    ConfigValidator::new().validate(&config)?;

    let store = create_state_store(&config, &base_dir).await?;
    let token = ConfigParser::backend_token().ok();
    let backend = create_backend(&config, &base_dir, token).await?;

    Ok(Deployer::new(config, store, backend)?.with_cancel_flag(cancel))
}
