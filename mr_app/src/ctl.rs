use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mr::{rpc, wait_for_operation, Job};
use tarpc::context;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Submits map/reduce jobs and checks on them", long_about = None)]
struct Args {
    /// Unix socket of the master
    #[arg(short, long, default_value = "/tmp/mr-master.sock")]
    master: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a job and wait for it to finish
    Submit {
        /// Directory holding one input file per map task
        #[arg(short, long)]
        input: PathBuf,
        /// Directory the reduce output is written to
        #[arg(short, long)]
        output: PathBuf,
        /// Processor name, as registered on the workers
        #[arg(short, long)]
        processor: String,
        /// Number of reduce tasks
        #[arg(short, long, default_value_t = 1)]
        reduces: usize,
        /// Shared directory for intermediate files
        #[arg(short, long, default_value = ".")]
        work_dir: PathBuf,
        /// Fan tasks out over every registered worker
        #[arg(short, long)]
        distributed: bool,
        /// Status poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },
    /// Print the current state of an operation
    Status { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mr_app::init_tracing();
    let args = Args::parse();
    let client = rpc::connect_master(&args.master)
        .await
        .with_context(|| format!("connecting to master {}", args.master))?;

    match args.command {
        Command::Submit {
            input,
            output,
            processor,
            reduces,
            work_dir,
            distributed,
            poll_ms,
        } => {
            // the master and the workers resolve paths against their own cwd
            let job = Job::new(absolute(&input)?, absolute(&output)?, processor, reduces)
                .with_work_dir(absolute(&work_dir)?);
            let operation = client
                .submit_job(context::current(), job, distributed)
                .await??;
            info!(operation = %operation.id, "job submitted");

            let operation =
                wait_for_operation(&client, &operation.id, Duration::from_millis(poll_ms)).await?;
            if let Some(err) = operation.error {
                bail!("job {} failed: {err}", operation.id);
            }
            println!("{}", operation.id);
        }
        Command::Status { id } => {
            let operation = client.get_operation(context::current(), id).await??;
            match operation.error {
                Some(err) => println!("{} done={} error={err}", operation.id, operation.done),
                None => println!("{} done={}", operation.id, operation.done),
            }
        }
    }
    Ok(())
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolving {}", path.display()))
}
