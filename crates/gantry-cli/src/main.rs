//! Gantry CLI entrypoint.
//!
//! Exit codes: 0 when every node succeeded or was skipped, 1 when any node
//! failed, timed out or was cancelled, 2 for configuration errors.

use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;

mod commands;
mod handlers;

use commands::Commands;
use handlers::RunArgs;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Single-run pipeline orchestration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            file,
            branch,
            event,
            format,
            workspace,
            vars,
            cache_dir,
        } => {
            handlers::run(RunArgs {
                file,
                branch,
                event: event.into(),
                format,
                workspace,
                vars,
                cache_dir,
            })
            .await
        }
        Commands::Validate { file } => handlers::validate(&file).await.map(|()| 0),
        Commands::Plan {
            file,
            branch,
            event,
        } => handlers::plan(&file, branch, event.into()).await.map(|()| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", style("✗").red(), e);
            std::process::exit(2);
        }
    }
}
