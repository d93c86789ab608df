use clap::Parser;
use duet_sync::{common::box_error::BoxError, relay_server::RelayServer};
use log::info;

/// Run the duet signaling relay
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// address to listen on
    #[arg(short, long, default_value = "0.0.0.0:9002")]
    listen: String,
}

fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();
    info!("starting duet relay on {}", args.listen);
    RelayServer::bind(&args.listen)?.run()
}
