// ABOUTME: CLI entry point for table-cloner
// ABOUTME: Parses commands, builds the clone job and reports the outcome

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use table_cloner::config::{load_job_file, JobConfig, JobOverrides};
use table_cloner::utils::redact_url;
use table_cloner::Cloner;

#[derive(Parser)]
#[command(name = "table-cloner")]
#[command(about = "Clone a single table between relational databases", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct JobArgs {
    /// Source connection string (postgresql://... or sqlite://path)
    #[arg(long, env = "SOURCE_URL")]
    source: Option<String>,
    /// Target connection string (postgresql://... or sqlite://path)
    #[arg(long, env = "TARGET_URL")]
    target: Option<String>,
    /// Source table as [owner.]name; the owner defaults to the session's schema
    #[arg(long = "source-object")]
    source_object: Option<String>,
    /// Target table as [owner.]name; the name defaults to the source table's
    #[arg(long = "target-object")]
    target_object: Option<String>,
    /// Selection query replacing SELECT * FROM <source table>
    #[arg(long)]
    select: Option<String>,
    /// Delete all target rows before copying
    #[arg(long)]
    truncate: bool,
    /// Create the target table from the source DDL when it does not exist
    #[arg(long = "create-if-not-exists")]
    create_if_not_exists: bool,
    /// Tablespace for a created target table (omit to strip the clause)
    #[arg(long)]
    tablespace: Option<String>,
    /// Path to a TOML job file; command-line flags override its values
    #[arg(long = "config")]
    config_path: Option<PathBuf>,
}

impl JobArgs {
    fn overrides(&self) -> JobOverrides {
        JobOverrides {
            source_url: self.source.clone(),
            target_url: self.target.clone(),
            source_object: self.source_object.clone(),
            target_object: self.target_object.clone(),
            select: self.select.clone(),
            tablespace: self.tablespace.clone(),
            truncate: self.truncate,
            create_if_not_exists: self.create_if_not_exists,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Copy rows of one table to the target, creating it first if requested
    Clone {
        #[command(flatten)]
        job: JobArgs,
    },
    /// Print the DDL that would create the target table, without running it
    Ddl {
        #[command(flatten)]
        job: JobArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    // Logs go to stderr so `ddl` output can be piped
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    // Initialize TLS policy using thread-safe OnceLock
    table_cloner::endpoint::postgres::init_tls_policy(cli.allow_self_signed_certs);

    match cli.command {
        Commands::Clone { job } => run_clone(job).await,
        Commands::Ddl { job } => run_ddl(job).await,
    }
}

async fn build_cloner(args: &JobArgs) -> anyhow::Result<Cloner> {
    let mut config = match &args.config_path {
        Some(path) => load_job_file(path).await?,
        None => JobConfig::default(),
    };
    config.apply_overrides(&args.overrides());

    let job = config.resolve()?;
    tracing::debug!(
        "Job: {} at '{}' -> {} at '{}'",
        job.source_object,
        redact_url(&job.source_url),
        job.target_object,
        redact_url(&job.target_url)
    );
    job.into_cloner().context("Invalid clone job")
}

async fn run_clone(args: JobArgs) -> anyhow::Result<()> {
    let mut cloner = build_cloner(&args).await?;

    let result = cloner.clone().await;
    // Close both endpoints even on failure; uncommitted work is rolled back
    let closed = cloner.close().await;
    let stats = result.context("Clone failed")?;
    if let Err(e) = closed {
        tracing::warn!("Failed to close connections cleanly: {:#}", e);
    }

    println!();
    println!("========================================");
    println!("Clone complete");
    println!("========================================");
    println!("  Source: {}", cloner.source_object());
    println!("  Target: {}", cloner.target_object());
    println!("  Rows copied: {}", stats.rows);
    println!("  Batches: {}", stats.batches);
    println!("  Elapsed: {:.2?}", stats.elapsed);

    Ok(())
}

async fn run_ddl(args: JobArgs) -> anyhow::Result<()> {
    let mut cloner = build_cloner(&args).await?;

    let result = cloner.target_ddl().await;
    let closed = cloner.close().await;
    let ddl = result.context("Failed to build target DDL")?;
    closed?;

    println!("{}", ddl);
    Ok(())
}
