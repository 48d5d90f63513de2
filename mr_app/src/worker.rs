use clap::Parser;
use mr::Worker;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Runs a map/reduce worker", long_about = None)]
struct Args {
    /// Unix socket the worker listens on
    #[arg(short, long)]
    address: String,
    /// Unix socket of the master to register with
    #[arg(short, long, default_value = "/tmp/mr-master.sock")]
    master: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mr_app::init_tracing();
    let args = Args::parse();

    let worker = Worker::new(args.address, args.master, mr_app::processors::registry());
    info!("{worker} started");
    let server = worker.start().await?;
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await
}
