//! `pacpctl` — operator CLI for the privileged-access control plane.
//!
//! Talks directly to the Store and the CA Pool, the same way the daemon's
//! own startup path does, rather than through the HTTP API — handy for
//! break-glass operations when the daemon itself is down.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pacpctl")]
#[command(about = "Privileged-access control plane operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute a layered config hash and print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> operator-override...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Operation queue inspection
    Operations {
        #[command(subcommand)]
        cmd: OperationsCmd,
    },

    /// Sync schedule and trigger commands
    Sync {
        #[command(subcommand)]
        cmd: SyncCmd,
    },

    /// Certificate authority pool commands
    Ca {
        #[command(subcommand)]
        cmd: CaCmd,
    },

    /// Pipeline configuration commands
    Pipeline {
        #[command(subcommand)]
        cmd: PipelineCmd,
    },

    /// Unified operations + sync job feed
    Activity {
        #[arg(long)]
        instance: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum OperationsCmd {
    /// List the most recent operations, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show a single operation by id
    Get { id: String },
    /// Cancel a pending or processing operation
    Cancel { id: String },
    /// Print aggregated stats for a date range
    Stats {
        #[arg(long)]
        start_date: chrono::DateTime<chrono::Utc>,
        #[arg(long)]
        end_date: chrono::DateTime<chrono::Utc>,
    },
}

#[derive(Subcommand)]
enum SyncCmd {
    /// List every configured sync schedule
    Schedules,
    /// Trigger an immediate high-priority sync, bypassing the interval check
    Trigger {
        instance: String,
        #[arg(value_parser = parse_sync_type)]
        entity: pacp_schemas::SyncType,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Disable every configured sync schedule
    PauseAll,
    /// Re-enable every configured sync schedule
    ResumeAll,
}

#[derive(Subcommand)]
enum CaCmd {
    /// List trusted certificate authorities
    List,
    /// Register a new certificate authority from a PEM file
    Add {
        name: String,
        #[arg(long)]
        pem_file: String,
    },
    /// Force-rebuild the trust store from the database
    Refresh,
}

#[derive(Subcommand)]
enum PipelineCmd {
    /// Print the current pipeline configuration
    Show,
}

fn parse_sync_type(s: &str) -> Result<pacp_schemas::SyncType, String> {
    pacp_schemas::SyncType::parse(s).ok_or_else(|| format!("invalid sync entity '{s}' (want users|groups|safes)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => run_db(cmd).await?,
        Commands::ConfigHash { paths } => run_config_hash(paths)?,
        Commands::Operations { cmd } => run_operations(cmd).await?,
        Commands::Sync { cmd } => run_sync(cmd).await?,
        Commands::Ca { cmd } => run_ca(cmd).await?,
        Commands::Pipeline { cmd } => run_pipeline(cmd).await?,
        Commands::Activity { instance, limit } => run_activity(instance, limit).await?,
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}

async fn run_db(cmd: DbCmd) -> Result<()> {
    let pool = pacp_db::connect_from_env().await?;
    match cmd {
        DbCmd::Status => {
            let s = pacp_db::status(&pool).await?;
            println!("connected={} operations_table_present={}", s.connected, s.operations_table_present);
        }
        DbCmd::Migrate => {
            pacp_db::migrate(&pool).await?;
            println!("migrations_applied=true");
        }
    }
    Ok(())
}

fn run_config_hash(paths: Vec<String>) -> Result<()> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = pacp_config::load_layered_yaml(&path_refs)?;
    println!("config_hash={}", loaded.config_hash);
    println!("{}", loaded.canonical_json);
    Ok(())
}

async fn run_operations(cmd: OperationsCmd) -> Result<()> {
    let pool = pacp_db::connect_from_env().await?;
    match cmd {
        OperationsCmd::List { status, limit } => {
            let filters = pacp_schemas::OperationFilters {
                status: status.as_deref().and_then(pacp_schemas::OperationStatus::parse),
                ..Default::default()
            };
            let page = pacp_schemas::Page { page: 1, page_size: limit.clamp(1, 100) };
            let ops = pacp_db::list_operations(
                &pool,
                &filters,
                pacp_schemas::SortField::CreatedAt,
                pacp_schemas::SortOrder::Desc,
                &page,
            )
            .await?;
            for op in ops {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    op.id,
                    op.operation_type.as_str(),
                    op.priority.as_str(),
                    op.status.as_str(),
                    op.created_at
                );
            }
        }
        OperationsCmd::Get { id } => {
            let op = pacp_db::get_operation(&pool, &id).await?.context("operation not found")?;
            println!("{}", serde_json::to_string_pretty(&op)?);
        }
        OperationsCmd::Cancel { id } => {
            let cancelled = pacp_db::cancel_operation(&pool, &id).await?;
            println!("cancelled={cancelled}");
        }
        OperationsCmd::Stats { start_date, end_date } => {
            let stats = pacp_db::get_operation_stats(&pool, start_date, end_date).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

async fn run_sync(cmd: SyncCmd) -> Result<()> {
    let pool = pacp_db::connect_from_env().await?;
    match cmd {
        SyncCmd::Schedules => {
            let schedules = pacp_db::list_all_sync_configs(&pool).await?;
            for s in schedules {
                println!(
                    "{}\t{}\tenabled={}\tinterval_minutes={}\tlast_sync_at={:?}",
                    s.upstream_instance_id, s.sync_type.as_str(), s.enabled, s.interval_minutes, s.last_sync_at
                );
            }
        }
        SyncCmd::Trigger { instance, entity, created_by } => {
            let op = pacp_sync::trigger_manual_sync(&pool, &instance, entity, created_by).await?;
            println!("operation_id={}", op.id);
        }
        SyncCmd::PauseAll => {
            let n = pacp_db::set_all_sync_configs_enabled(&pool, false).await?;
            println!("paused={n}");
        }
        SyncCmd::ResumeAll => {
            let n = pacp_db::set_all_sync_configs_enabled(&pool, true).await?;
            println!("resumed={n}");
        }
    }
    Ok(())
}

async fn run_ca(cmd: CaCmd) -> Result<()> {
    let pool = pacp_db::connect_from_env().await?;
    match cmd {
        CaCmd::List => {
            let cas = pacp_db::list_certificate_authorities(&pool).await?;
            for ca in cas {
                println!(
                    "{}\t{}\t{}\tactive={}\tnot_after={}",
                    ca.id, ca.name, ca.fingerprint, ca.is_active, ca.not_after
                );
            }
        }
        CaCmd::Add { name, pem_file } => {
            let pem = std::fs::read_to_string(&pem_file)
                .with_context(|| format!("read {pem_file}"))?;
            let parsed = pacp_capool::parse_ca_pem(&pem)?;
            let ca = pacp_db::create_certificate_authority(
                &pool,
                pacp_db::NewCertificateAuthority {
                    name,
                    fingerprint: parsed.fingerprint,
                    pem,
                    subject: parsed.subject,
                    issuer: parsed.issuer,
                    not_before: parsed.not_before,
                    not_after: parsed.not_after,
                    is_root: parsed.is_root,
                    is_intermediate: parsed.is_intermediate,
                    chain_info: parsed.chain_info,
                },
            )
            .await?;
            let capool = pacp_capool::CaPool::new(pool.clone())?;
            capool.force_refresh().await?;
            println!("ca_id={} fingerprint={}", ca.id, ca.fingerprint);
        }
        CaCmd::Refresh => {
            let capool = pacp_capool::CaPool::new(pool.clone())?;
            capool.force_refresh().await?;
            let snapshot = capool.current_snapshot();
            println!(
                "refreshed=true active_ca_count={} skipped_count={}",
                snapshot.active_ca_count, snapshot.skipped_count
            );
        }
    }
    Ok(())
}

async fn run_activity(instance: Option<String>, limit: u32) -> Result<()> {
    let pool = pacp_db::connect_from_env().await?;
    let filters = pacp_activity::ActivityFilters { upstream_instance_id: instance, ..Default::default() };
    let items = pacp_activity::list_activity(&pool, &filters, 1, limit.clamp(1, 100)).await?;
    for item in items {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            item.created_at,
            item.kind.as_str(),
            item.label,
            item.upstream_instance_id.as_deref().unwrap_or("-"),
            item.status
        );
    }
    Ok(())
}

async fn run_pipeline(cmd: PipelineCmd) -> Result<()> {
    let pool = pacp_db::connect_from_env().await?;
    match cmd {
        PipelineCmd::Show => {
            let cfg = pacp_db::get_pipeline_config(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
    }
    Ok(())
}
