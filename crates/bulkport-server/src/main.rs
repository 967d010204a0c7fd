use clap::{Parser, Subcommand};

use bulkport_server::ServerBuilder;
use bulkport_server::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use bulkport_server::export::SweepPass;
use bulkport_server::server::{build_sweeper, connect_storage};

#[derive(Parser)]
#[command(name = "bulkport-server", version, about = "Bulk FHIR $export job orchestrator")]
struct Cli {
    /// Configuration file (defaults to bulkport.toml when present)
    #[arg(long, short, global = true, env = "BULKPORT_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the export API (default)
    Serve,
    /// Run the retention sweeper once and exit
    Sweep {
        #[arg(long, value_enum, default_value = "all")]
        pass: SweepPass,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    bulkport_server::observability::init_tracing();

    let cli = Cli::parse();
    let cfg = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(
        path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH),
        tier = ?cfg.export.tier,
        "Configuration loaded"
    );
    bulkport_server::observability::apply_logging_level(&cfg.logging.level);

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg).await,
        Command::Sweep { pass } => sweep(cfg, pass).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "bulkport-server exited with error");
        std::process::exit(1);
    }
}

async fn serve(cfg: bulkport_server::AppConfig) -> anyhow::Result<()> {
    let server = ServerBuilder::new().with_config(cfg).build().await?;
    server.run().await
}

async fn sweep(cfg: bulkport_server::AppConfig, pass: SweepPass) -> anyhow::Result<()> {
    let (store, queue) = connect_storage(&cfg.storage).await?;
    let report = build_sweeper(&cfg, store, queue).run(pass).await?;
    tracing::info!(
        archived = report.archived,
        expired = report.expired,
        failed_expired = report.failed_expired,
        cancelled_expired = report.cancelled_expired,
        unpublished_deleted = report.unpublished_deleted,
        "Sweep finished"
    );
    report.into_result()?;
    Ok(())
}
