use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use envconfig::Envconfig;
use serde::Deserialize;

use queuectl_common::store::{JobState, NewJob, Store};
use queuectl_worker::config::WorkerConfig;
use queuectl_worker::supervisor;

use crate::error::CliError;

#[derive(Parser)]
#[command(name = "queuectl", version, about = "CLI job queue with retries and a dead-letter queue")]
pub struct Cli {
    /// Path to the SQLite database
    #[arg(
        long,
        env = "QUEUECTL_DB",
        default_value = "queuectl.db",
        global = true
    )]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Enqueue a job from a JSON string, e.g. '{"id":"j1","command":"echo hi"}'
    Enqueue {
        /// JSON object with required `id`, `command`; optional `max_retries`
        json: String,
    },

    /// Worker management
    Worker {
        #[command(subcommand)]
        cmd: WorkerCommand,
    },

    /// Show a summary of job states and registered workers
    Status,

    /// List jobs, oldest first, optionally filtered by state
    List {
        /// One of: pending, processing, completed, failed
        #[arg(long)]
        state: Option<String>,
    },

    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        cmd: DlqCommand,
    },

    /// Durable configuration stored in the queue database
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Start one or more workers in the foreground
    Start {
        /// Number of workers
        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Stop workers (if supervised elsewhere)
    Stop,
}

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List dead-lettered jobs, most recent first
    List,

    /// Move a dead-lettered job back into the queue as fresh pending work
    Retry { id: String },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print a config value (empty output when the key is unset)
    Get { key: String },

    /// Set a config value; workers pick it up on their next job
    Set { key: String, value: String },
}

/// The enqueue payload. Unknown keys are tolerated and ignored.
#[derive(Debug, Deserialize)]
struct JobSpec {
    id: String,
    command: String,
    max_retries: Option<i64>,
}

impl Cli {
    pub async fn run() -> Result<(), CliError> {
        Cli::parse().execute().await
    }

    async fn execute(self) -> Result<(), CliError> {
        // Every command initializes the schema on the way in, so the first
        // queuectl invocation against a fresh path just works.
        let store = Store::open(&self.db).await?;

        match self.command {
            Commands::Enqueue { json } => {
                let spec = parse_job_spec(&json)?;
                let id = spec.id.clone();
                store
                    .enqueue(NewJob {
                        id: spec.id,
                        command: spec.command,
                        max_retries: spec.max_retries,
                    })
                    .await?;
                println!("Enqueued job {id}");
            }

            Commands::Worker { cmd } => match cmd {
                WorkerCommand::Start { count } => {
                    if count == 0 {
                        return Err(CliError::invalid_input("--count must be at least 1"));
                    }
                    let config = WorkerConfig::init_from_env().map_err(|error| {
                        CliError::invalid_input(format!("worker configuration: {error}"))
                    })?;
                    supervisor::run(count, &self.db, config).await?;
                }
                WorkerCommand::Stop => {
                    println!("Workers run in the foreground: use Ctrl+C to stop them.");
                }
            },

            Commands::Status => {
                let counts = store.status().await?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&counts)
                        .expect("status counts serialize to JSON")
                );
            }

            Commands::List { state } => {
                let state = state
                    .as_deref()
                    .map(JobState::from_str)
                    .transpose()
                    .map_err(|error| CliError::invalid_input(error.to_string()))?;
                let jobs = store.list_jobs(state).await?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&jobs).expect("jobs serialize to JSON")
                );
            }

            Commands::Dlq { cmd } => match cmd {
                DlqCommand::List => {
                    let entries = store.dlq_list().await?;
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&entries)
                            .expect("dead letters serialize to JSON")
                    );
                }
                DlqCommand::Retry { id } => {
                    store.dlq_retry(&id).await?;
                    println!("Moved {id} from DLQ to pending.");
                }
            },

            Commands::Config { cmd } => match cmd {
                ConfigCommand::Get { key } => {
                    println!("{}", store.get_config(&key).await?.unwrap_or_default());
                }
                ConfigCommand::Set { key, value } => {
                    store.set_config(&key, &value).await?;
                    println!("Set {key}={value}");
                }
            },
        }

        Ok(())
    }
}

/// Validate the enqueue payload before any store mutation.
fn parse_job_spec(json: &str) -> Result<JobSpec, CliError> {
    let spec: JobSpec = serde_json::from_str(json)
        .map_err(|error| CliError::invalid_input(format!("job JSON: {error}")))?;

    if spec.id.is_empty() {
        return Err(CliError::invalid_input("job JSON must carry a non-empty 'id'"));
    }
    if spec.command.is_empty() {
        return Err(CliError::invalid_input(
            "job JSON must carry a non-empty 'command'",
        ));
    }
    if spec.max_retries.is_some_and(|max_retries| max_retries < 0) {
        return Err(CliError::invalid_input("'max_retries' must be non-negative"));
    }

    Ok(spec)
}
