//! HR portal backend maintenance
//!
//! Reconciles row-level-security policies on the hosted Postgres behind the
//! HR portal, and carries the other one-off maintenance jobs the portal
//! needs: running SQL scripts, seeding departments and checking that the
//! expected tables are exposed.
//!
//! Statements reach the database through the generic `exec_sql` RPC
//! function by default, or through a direct Postgres connection when
//! `DATABASE_URL` is set and `--direct` is given.

mod bootstrap;
mod config;
mod error;
mod executor;
mod health;
mod migration;
mod reconcile;
mod seed;
mod supabase;

use crate::bootstrap::{BootstrapOutcome, Bootstrapper};
use crate::config::Settings;
use crate::error::AppError;
use crate::executor::{PostgresTransport, RemoteExecutor, RpcTransport, Transport};
use crate::migration::{MigrationDescriptor, StatementSequencer};
use crate::reconcile::{ReconciliationDriver, SuccessCriterion};
use crate::supabase::SupabaseClient;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DESCRIPTOR: &str = "users-rls";

#[derive(Parser, Debug)]
#[command(name = "rls-reconciler", version, about = "HR portal backend maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replace a table's row-level-security policies (default: users-rls)
    Reconcile(ReconcileArgs),
    /// List built-in descriptors
    List,
    /// Run every statement of a SQL file, continuing past failures
    RunScript {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Make sure the generic execute function exists
    Bootstrap,
    /// Insert the default departments into an empty table
    SeedDepartments,
    /// Check connectivity and required tables
    Verify,
}

#[derive(Args, Debug, Clone)]
struct ReconcileArgs {
    /// Built-in descriptor name
    #[arg(default_value = DEFAULT_DESCRIPTOR)]
    descriptor: String,
    /// Load the descriptor from a YAML or JSON file instead
    #[arg(long, conflicts_with = "descriptor")]
    file: Option<PathBuf>,
    /// Print the plan without contacting the backend
    #[arg(long)]
    dry_run: bool,
    /// Run the whole plan in one transaction (needs --direct)
    #[arg(long, requires = "direct")]
    atomic: bool,
    /// Use the DATABASE_URL connection instead of the RPC function
    #[arg(long)]
    direct: bool,
    /// Print the batch report as JSON
    #[arg(long)]
    json: bool,
}

impl Default for ReconcileArgs {
    fn default() -> Self {
        Self {
            descriptor: DEFAULT_DESCRIPTOR.to_string(),
            file: None,
            dry_run: false,
            atomic: false,
            direct: false,
            json: false,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Commands::Reconcile(ReconcileArgs::default()));

    let success = match command {
        Commands::Reconcile(args) => reconcile(args).await?,
        Commands::List => list()?,
        Commands::RunScript { path, json } => run_script(&path, json).await?,
        Commands::Bootstrap => bootstrap().await?,
        Commands::SeedDepartments => seed_departments().await?,
        Commands::Verify => verify().await?,
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rls_reconciler=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .init();
}

/// Load settings, naming the missing variable before anything touches the network
fn load_settings() -> anyhow::Result<Settings> {
    match Settings::load() {
        Ok(settings) => {
            info!("📋 Configuration loaded successfully");
            Ok(settings)
        }
        Err(e) => {
            error!("❌ {}", e);
            error!("Make sure your .env file contains the Supabase URL and service role key");
            Err(e.into())
        }
    }
}

fn supabase_client(settings: &Settings) -> anyhow::Result<Arc<SupabaseClient>> {
    let client = SupabaseClient::new(&settings.supabase, settings.http_timeout)?;
    Ok(Arc::new(client))
}

/// Open the direct connection if one is configured.
///
/// When `required` is false a failed connection only costs the ability to
/// provision the execute function.
async fn direct_transport(settings: &Settings, required: bool) -> anyhow::Result<Option<Arc<PostgresTransport>>> {
    let Some(ref database) = settings.database else {
        if required {
            anyhow::bail!("--direct needs {} to be set", config::DATABASE_URL_VAR);
        }
        return Ok(None);
    };

    match PostgresTransport::connect(database).await {
        Ok(transport) => Ok(Some(Arc::new(transport))),
        Err(e) if required => Err(e).context("Failed to open direct database connection"),
        Err(e) => {
            warn!("⚠️  Direct database connection unavailable: {}", e);
            Ok(None)
        }
    }
}

async fn ensure_exec_function(
    settings: &Settings,
    rpc: &RpcTransport,
    direct: Option<&PostgresTransport>,
) -> anyhow::Result<BootstrapOutcome> {
    let direct = direct.map(|d| d as &dyn Transport);
    let outcome = Bootstrapper::new(rpc, direct, &settings.exec_function)
        .ensure()
        .await?;
    Ok(outcome)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_plan(descriptor: &MigrationDescriptor) {
    println!(
        "{} v{} on {} (fingerprint {})",
        descriptor.name,
        descriptor.version,
        descriptor.table,
        descriptor.fingerprint()
    );
    if let Some(ref description) = descriptor.description {
        println!("  {}", description.trim());
    }
    for (i, statement) in StatementSequencer::plan(descriptor).iter().enumerate() {
        let phase = statement
            .phase()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:>3}. [{:<9}] {}", i + 1, phase, statement.text);
    }
}

async fn reconcile(args: ReconcileArgs) -> anyhow::Result<bool> {
    let descriptor = match args.file {
        Some(ref path) => MigrationDescriptor::load_file(path)?,
        None => MigrationDescriptor::builtin(&args.descriptor)?,
    };

    // Only the direct connection has transactions; refuse before bootstrap sends anything
    if args.atomic && !args.direct {
        return Err(AppError::Unsupported(
            "--atomic needs --direct; the RPC function cannot run a plan in one transaction".to_string(),
        )
        .into());
    }

    if args.dry_run {
        info!("🧪 Dry run, nothing will be sent");
        print_plan(&descriptor);
        return Ok(true);
    }

    let settings = load_settings()?;
    let client = supabase_client(&settings)?;
    let rpc = Arc::new(RpcTransport::new(client, settings.exec_function.clone()));
    let direct = direct_transport(&settings, args.direct).await?;

    let transport: Arc<dyn Transport> = match direct {
        Some(ref direct) if args.direct => direct.clone(),
        _ => {
            ensure_exec_function(&settings, &rpc, direct.as_deref()).await?;
            rpc
        }
    };

    let executor = RemoteExecutor::new(transport);
    let driver = ReconciliationDriver::new(&executor);
    let report = if args.atomic {
        driver.reconcile_atomic(&descriptor).await?
    } else {
        driver.reconcile(&descriptor).await
    };

    if args.json {
        print_json(&report)?;
    }
    Ok(report.overall_success)
}

fn list() -> anyhow::Result<bool> {
    for descriptor in MigrationDescriptor::builtins()? {
        println!(
            "{:<16} v{:<3} {:<24} drops {:>2}, creates {:>2}",
            descriptor.name,
            descriptor.version,
            descriptor.table.to_string(),
            descriptor.drop.len(),
            descriptor.create.len()
        );
    }
    Ok(true)
}

async fn run_script(path: &Path, json: bool) -> anyhow::Result<bool> {
    let script = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let statements = StatementSequencer::split_script(&script);
    if statements.is_empty() {
        warn!("⚠️  {} contains no statements", path.display());
        return Ok(true);
    }
    info!("📄 {} statements in {}", statements.len(), path.display());

    let settings = load_settings()?;
    let client = supabase_client(&settings)?;
    let rpc = Arc::new(RpcTransport::new(client, settings.exec_function.clone()));
    let direct = direct_transport(&settings, false).await?;
    ensure_exec_function(&settings, &rpc, direct.as_deref()).await?;

    let executor = RemoteExecutor::new(rpc);
    let report = ReconciliationDriver::new(&executor)
        .run_statements(&path.display().to_string(), statements, SuccessCriterion::NoFailures)
        .await;

    if json {
        print_json(&report)?;
    }
    Ok(report.overall_success)
}

async fn bootstrap() -> anyhow::Result<bool> {
    let settings = load_settings()?;
    let client = supabase_client(&settings)?;
    let rpc = RpcTransport::new(client, settings.exec_function.clone());
    let direct = direct_transport(&settings, false).await?;

    match ensure_exec_function(&settings, &rpc, direct.as_deref()).await? {
        BootstrapOutcome::AlreadyPresent => info!("Nothing to do"),
        BootstrapOutcome::Provisioned => info!("🔧 {} is ready", rpc.function()),
    }
    Ok(true)
}

async fn seed_departments() -> anyhow::Result<bool> {
    let settings = load_settings()?;
    let client = supabase_client(&settings)?;

    let report = seed::seed_departments(client.as_ref()).await?;
    if !report.failed.is_empty() {
        warn!("⚠️  {} departments could not be added", report.failed.len());
    }
    Ok(true)
}

async fn verify() -> anyhow::Result<bool> {
    let settings = load_settings()?;
    let client = supabase_client(&settings)?;

    let report = health::check(client.as_ref()).await;
    let missing = report.missing();
    if !missing.is_empty() {
        error!("❌ Missing tables: {}", missing.join(", "));
    }
    Ok(report.healthy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_means_default_reconcile() {
        let cli = Cli::try_parse_from(["rls-reconciler"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["rls-reconciler", "reconcile"]).unwrap();
        match cli.command {
            Some(Commands::Reconcile(args)) => {
                assert_eq!(args.descriptor, DEFAULT_DESCRIPTOR);
                assert!(!args.dry_run && !args.atomic && !args.direct);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_reconcile_flags() {
        let cli = Cli::try_parse_from([
            "rls-reconciler",
            "reconcile",
            "--file",
            "policies.yaml",
            "--atomic",
            "--direct",
            "--json",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Reconcile(args)) => {
                assert_eq!(args.file, Some(PathBuf::from("policies.yaml")));
                assert!(args.atomic && args.direct && args.json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_atomic_requires_direct_flag() {
        let err = Cli::try_parse_from(["rls-reconciler", "reconcile", "--atomic"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_atomic_over_rpc_refused_before_loading_settings() {
        let args = ReconcileArgs {
            atomic: true,
            ..ReconcileArgs::default()
        };
        let err = tokio_test::block_on(reconcile(args)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AppError>(),
            Some(AppError::Unsupported(_))
        ));
    }

    #[test]
    fn test_dry_run_needs_no_credentials() {
        let args = ReconcileArgs {
            dry_run: true,
            ..ReconcileArgs::default()
        };
        assert!(tokio_test::block_on(reconcile(args)).unwrap());
    }

    #[test]
    fn test_unknown_descriptor_fails_before_connecting() {
        let args = ReconcileArgs {
            descriptor: "payroll-rls".to_string(),
            dry_run: true,
            ..ReconcileArgs::default()
        };
        assert!(tokio_test::block_on(reconcile(args)).is_err());
    }

    #[test]
    fn test_empty_script_is_a_noop() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "-- nothing here\n").unwrap();
        assert!(tokio_test::block_on(run_script(file.path(), false)).unwrap());
    }
}
