mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "rowflow",
    version,
    about = "Row-oriented streaming pipeline engine"
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
    /// Run a pipeline to completion
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Override the copy count of a step, as `step=copies` (repeatable)
        #[arg(long = "parallelism", value_name = "STEP=COPIES")]
        parallelism: Vec<String>,
    },
    /// Validate a pipeline and build its wiring without running it
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// List built-in step types
    Steps,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            pipeline,
            parallelism,
        } => commands::run::execute(&pipeline, &parallelism).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline),
        Commands::Steps => {
            commands::steps::execute();
            Ok(())
        }
    }
}
