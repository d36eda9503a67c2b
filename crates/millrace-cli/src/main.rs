mod simulate_cmd;
mod validate_cmd;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "millrace", about = "Distributed dataflow orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a flow definition file
    Validate {
        /// Path to the flow definition TOML file
        file: String,
    },
    /// Run a flow from a definition file with echo task bodies
    /// (every task returns its node_args), printing the finished-node map
    Simulate {
        /// Path to the flow definition TOML file
        file: String,
        /// Name of the flow to run
        flow: String,
        /// Initial node_args as a JSON value
        #[arg(long)]
        args: Option<String>,
        /// Initial re-enqueue delay in seconds
        #[arg(long, default_value_t = 2)]
        start_retry: u64,
        /// Back-off cap in seconds
        #[arg(long, default_value_t = 120)]
        max_retry: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate { file } => validate_cmd::run_validate(&file),
        Commands::Simulate {
            file,
            flow,
            args,
            start_retry,
            max_retry,
        } => simulate_cmd::run_simulate(&file, &flow, args.as_deref(), start_retry, max_retry).await,
    };

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
