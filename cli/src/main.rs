//! Command-line interface for blob artifacts.
//!
//! Exit codes: 0 on success, 65 when data corruption was detected, 70 for
//! internal or protocol errors.  Usage errors exit with clap's own code.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slog::{o, Drain, Logger};
use std::future::Future;
use std::path::PathBuf;
use taskcluster_artifact::{Client, Error, Queue, DEFAULT_CHUNK_SIZE, DEFAULT_PART_SIZE};
use tokio::fs::File;

const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;

#[derive(Parser)]
#[command(name = "artifact", about = "interact with taskcluster artifacts", version)]
struct Cli {
    /// Root URL of the deployment whose queue should be used
    #[arg(long, env = "TASKCLUSTER_ROOT_URL")]
    root_url: String,

    /// I/O chunk size in KB
    #[arg(long, env = "ARTIFACT_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE / 1024)]
    chunk_size: usize,

    /// Multipart part size in MB
    #[arg(long, env = "ARTIFACT_PART_SIZE", default_value_t = DEFAULT_PART_SIZE / 1024 / 1024)]
    part_size: usize,

    /// Suppress debugging output
    #[arg(long, short)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload an artifact
    #[command(visible_alias = "u")]
    Upload {
        task_id: String,
        run_id: String,
        /// Artifact name, e.g. public/build/target.tar.gz
        name: String,

        /// FILENAME to read the artifact from
        #[arg(long, short, env = "ARTIFACT_INPUT")]
        input: PathBuf,

        /// Gzip-encode the artifact for transfer
        #[arg(long)]
        gzip: bool,

        /// Upload the artifact in multiple parts
        #[arg(long)]
        multipart: bool,
    },

    /// Download an artifact
    #[command(visible_alias = "d")]
    Download {
        /// taskId of the task that created the artifact
        #[arg(required_unless_present = "url")]
        task_id: Option<String>,

        /// Artifact name
        #[arg(required_unless_present = "url")]
        name: Option<String>,

        /// runId to download from; the latest run is used when omitted
        #[arg(long)]
        run_id: Option<String>,

        /// Exact queue artifact URL to download instead of resolving
        /// taskId/runId/name
        #[arg(long, conflicts_with_all = ["task_id", "name", "run_id"])]
        url: Option<String>,

        /// FILENAME to write output to; standard output when "-"
        #[arg(long, short, env = "ARTIFACT_OUTPUT", default_value = "-")]
        output: String,

        /// Allow artifacts served over plain http
        #[arg(long)]
        allow_insecure: bool,
    },

    /// Record that an artifact could not be produced
    CreateError {
        task_id: String,
        run_id: String,
        name: String,

        /// Machine-readable reason slug
        #[arg(long)]
        reason: String,

        /// Human-readable explanation
        #[arg(long)]
        message: String,
    },

    /// Create an artifact that redirects to content stored elsewhere
    CreateReference {
        task_id: String,
        run_id: String,
        name: String,

        /// URL the artifact should redirect to
        #[arg(long)]
        url: String,
    },
}

fn terminal_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Run an operation, aborting it cleanly if the user interrupts.
async fn cancellable<F>(operation: F) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    tokio::select! {
        result = operation => result,
        _ = tokio::signal::ctrl_c() => Err(Error::Canceled),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let logger = if cli.quiet {
        Logger::root(slog::Discard, o!())
    } else {
        terminal_logger()
    };

    let queue = Queue::new(&cli.root_url)?;
    let mut client = Client::with_logger(queue, logger)?;
    client.set_internal_sizes(cli.chunk_size * 1024, cli.part_size * 1024 * 1024)?;

    match cli.command {
        Command::Upload {
            task_id,
            run_id,
            name,
            input,
            gzip,
            multipart,
        } => {
            let mut input_file = File::open(&input)
                .await
                .with_context(|| format!("opening {}", input.display()))?;
            let mut staging =
                File::from_std(tempfile::tempfile().context("creating the staging temp file")?);
            cancellable(client.upload(
                &task_id,
                &run_id,
                &name,
                &mut input_file,
                &mut staging,
                gzip,
                multipart,
            ))
            .await?;
        }

        Command::Download {
            task_id,
            name,
            run_id,
            url,
            output,
            allow_insecure,
        } => {
            client.allow_insecure = allow_insecure;
            if output == "-" {
                let mut sink = tokio::io::stdout();
                cancellable(download(&client, task_id, run_id, name, url, &mut sink)).await?;
            } else {
                let mut sink = File::create(&output)
                    .await
                    .with_context(|| format!("creating {}", output))?;
                cancellable(download(&client, task_id, run_id, name, url, &mut sink)).await?;
            }
        }

        Command::CreateError {
            task_id,
            run_id,
            name,
            reason,
            message,
        } => {
            client
                .create_error(&task_id, &run_id, &name, &reason, &message)
                .await?;
        }

        Command::CreateReference {
            task_id,
            run_id,
            name,
            url,
        } => {
            client.create_reference(&task_id, &run_id, &name, &url).await?;
        }
    }

    Ok(())
}

async fn download<W: taskcluster_artifact::DownloadSink>(
    client: &Client<Queue>,
    task_id: Option<String>,
    run_id: Option<String>,
    name: Option<String>,
    url: Option<String>,
    sink: &mut W,
) -> Result<(), Error> {
    if let Some(url) = url {
        return client.download_url(&url, sink).await;
    }
    // clap guarantees these are present when --url is absent
    let task_id = task_id.unwrap_or_default();
    let name = name.unwrap_or_default();
    match run_id {
        Some(run_id) => client.download(&task_id, &run_id, &name, sink).await,
        None => client.download_latest(&task_id, &name, sink).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            if let Some(artifact_err) = err.downcast_ref::<Error>() {
                eprintln!("artifact error:{}", artifact_err.error_chain());
                match artifact_err {
                    Error::Corrupt => EX_DATAERR,
                    _ => EX_SOFTWARE,
                }
            } else {
                eprintln!("artifact error: {:#}", err);
                EX_SOFTWARE
            }
        }
    };
    std::process::exit(code);
}
