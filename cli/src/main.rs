use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use syncstores::AdapterConfig;
use syncstores_cli::command::load_config;
use syncstores_cli::{execute, open_group, Args, CliError, SqliteStorage};

async fn run(args: Args) -> Result<(), CliError> {
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => AdapterConfig::default(),
    };
    let area = Arc::new(SqliteStorage::open(&args.db)?);
    let group = open_group(area.clone(), &config)?;

    for line in execute(&args.command, &group, area.as_ref()).await? {
        println!("{line}");
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("syncstores: {e}");
            ExitCode::FAILURE
        }
    }
}
