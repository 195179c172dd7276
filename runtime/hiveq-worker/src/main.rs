use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use hiveq_db::Drivers;
use hiveq_worker::{HiveConfig, HiveService, frame, logging};

#[derive(Parser)]
#[command(name = "hiveq-worker")]
#[command(about = "Run Hive queries into newline-delimited JSON result files", long_about = None)]
struct Cli {
    /// Properties file with datasource and service settings
    #[arg(long, global = true, default_value = "hiveq.properties")]
    config: PathBuf,

    /// Worker pool width (overrides hive.worker.threads)
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Async backlog capacity (overrides hive.worker.max-queue)
    #[arg(long, global = true)]
    max_queue: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve framed requests on stdin/stdout (the default)
    Serve,
    /// Execute one query synchronously and print its summary
    Run {
        #[arg(long)]
        datasource: String,

        #[arg(long, default_value = "hiveq")]
        user: String,

        /// Row cap for the summary; defaults to select.limit
        #[arg(long)]
        limit: Option<usize>,

        /// Skip the history row
        #[arg(long, default_value_t = false)]
        no_history: bool,

        sql: String,
    },
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "hiveq-worker failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = HiveConfig::load(&cli.config)?;
    if let Some(threads) = cli.threads {
        config = config.with("hive.worker.threads", threads);
    }
    if let Some(max_queue) = cli.max_queue {
        config = config.with("hive.worker.max-queue", max_queue);
    }
    let service = HiveService::open(config, Drivers::builtin())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let stdin = io::stdin();
            frame::serve(&service, &mut stdin.lock(), io::stdout())?;
        }
        Commands::Run {
            datasource,
            user,
            limit,
            no_history,
            sql,
        } => {
            let limit = limit.unwrap_or(service.select_limit());
            let result = service.submit_sync(&datasource, &sql, &user, !no_history, limit)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}
