mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "rehome",
    version,
    about = "Chunked SFTP file reorganisation with audited cleanup"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration job
    Run {
        /// Path to job YAML file
        job: PathBuf,
        /// Name recorded on the audit instead of the configured job name
        #[arg(long)]
        job_name: Option<String>,
        /// Run parameter recorded on the audit (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = commands::run::parse_param)]
        params: Vec<(String, String)>,
    },
    /// Validate job configuration and connectivity
    Check {
        /// Path to job YAML file
        job: PathBuf,
    },
    /// Load file records from a JSON-lines index export
    Import {
        /// Path to job YAML file
        job: PathBuf,
        /// JSON-lines file, one record per line
        records: PathBuf,
        /// Records inserted per batch
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
    },
    /// Query execution audits
    Audit {
        /// Path to job YAML file
        job: PathBuf,
        #[command(subcommand)]
        query: commands::audit::AuditCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            job,
            job_name,
            params,
        } => commands::run::execute(&job, job_name.as_deref(), params).await,
        Commands::Check { job } => commands::check::execute(&job).await,
        Commands::Import {
            job,
            records,
            batch_size,
        } => commands::import::execute(&job, &records, batch_size),
        Commands::Audit { job, query } => commands::audit::execute(&job, &query),
    }
}
