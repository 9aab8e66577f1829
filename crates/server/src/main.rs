use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod api;
mod check;
mod config;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "flowpilot")]
#[command(about = "FlowPilot - DAG workflow execution engine", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "FLOWPILOT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine and the HTTP API (default)
    Serve(ServeArgs),
    /// Validate a workflow definition file and print its execution layers
    Check {
        /// JSON file in the shape accepted by POST /api/workflows
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "flowpilot.toml", env = "FLOWPILOT_CONFIG")]
    config: PathBuf,

    /// Data directory for the run store and event log
    #[arg(short, long, default_value = "./data", env = "FLOWPILOT_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "flowpilot=info,flowpilot_core=info,tower_http=debug".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true);
    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    tracing::info!("Starting FlowPilot workflow engine");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;

    let addr = format!("{}:{}", args.host, args.port);
    api::serve(&addr, config).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Some(Command::Check { path }) => {
            let workflow = check::load(&path)?;
            print!("{}", check::render(&workflow)?);
            Ok(())
        }
        Some(Command::Serve(args)) => serve(args).await,
        None => serve(cli.serve).await,
    }
}
