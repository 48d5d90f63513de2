use clap::Parser;
use mr::Master;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Runs the map/reduce master", long_about = None)]
struct Args {
    /// Unix socket the master listens on
    #[arg(short, long, default_value = "/tmp/mr-master.sock")]
    address: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mr_app::init_tracing();
    let args = Args::parse();

    let server = Master::new(args.address).start().await?;
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await
}
