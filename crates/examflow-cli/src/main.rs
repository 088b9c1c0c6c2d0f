//! examflow CLI: validate, inspect and simulate timed exams.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "examflow", version, about = "Timed exam-delivery engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a test definition and its order table
    Validate {
        /// Test definition JSON
        #[arg(long)]
        test: PathBuf,

        /// Order table JSON
        #[arg(long)]
        order: Option<PathBuf>,
    },

    /// Show groups, parts and question numbers
    Inspect {
        /// Test definition JSON
        #[arg(long)]
        test: PathBuf,

        /// Order table JSON
        #[arg(long)]
        order: Option<PathBuf>,
    },

    /// Run a headless session end to end
    Simulate {
        /// Test definition JSON
        #[arg(long)]
        test: PathBuf,

        /// Order table JSON (fetched from the API when omitted and online)
        #[arg(long)]
        order: Option<PathBuf>,

        /// Answers JSON: {"<question number>": "<letter>"}
        #[arg(long)]
        answers: Option<PathBuf>,

        /// Use in-memory media and submission instead of the network
        #[arg(long)]
        offline: bool,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the submission payload here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Session store directory (defaults to the configured store_dir)
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("examflow=info".parse().expect("static directive")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate { test, order } => commands::validate::execute(test, order),
        Commands::Inspect { test, order } => commands::inspect::execute(test, order),
        Commands::Simulate {
            test,
            order,
            answers,
            offline,
            config,
            output,
            store,
        } => {
            commands::simulate::execute(commands::simulate::SimulateArgs {
                test,
                order,
                answers,
                offline,
                config,
                output,
                store,
            })
            .await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
