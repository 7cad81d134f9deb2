use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use mailbox_pipeline::{Config, LogProcessor, Pipeline, PipelineState, SqlStore, db, init_logger};

#[derive(Parser, Debug)]
#[command(
    name = "mailbox-pipeline",
    about = "Stream every mailbox's users through the processor"
)]
struct Args {
    /// YAML configuration file. Environment and defaults are used when it is missing.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Database driver (`sqlite`, `sqlite3`, `postgres`, `postgresql`).
    #[arg(long)]
    driver: Option<String>,

    /// Database file path or connection URL.
    #[arg(long)]
    database: Option<String>,

    /// Apply schema migrations before running.
    #[arg(long)]
    migrate: bool,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();

    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    config.apply_cli_overrides(args.driver, args.database);
    config.validate()?;

    log::info!(
        "starting mailbox pipeline ({} store, {} connections, channel capacity {})",
        config.database.driver,
        config.database.max_connections,
        config.pipeline.channel_capacity
    );

    let store = match SqlStore::from_config(&config).await {
        Ok(store) => store,
        Err(err) => {
            log::error!("failed to open store: {}", err);
            writeln!(io::stderr(), "error: {err}")?;
            std::process::exit(1);
        }
    };

    if args.migrate {
        db::run_migrations(store.pool()).await?;
    }

    let pipeline = Pipeline::new(store.clone(), LogProcessor);
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let result = pipeline.run().await;
    store.close().await;

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            writeln!(io::stderr(), "error: {err}")?;
            std::process::exit(1);
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if report.state == PipelineState::Cancelled {
        std::process::exit(130);
    }
    Ok(())
}
