use clap::Parser;
use log::{error, info};
use std::process;
use tokio::net::TcpListener;

use commitlog::net::RaftClient;
use commitlog::{ConfigFile, DistributedLog, StreamLayer};

#[derive(Parser)]
#[command(name = "commitlog-node")]
#[command(about = "A replicated commit log node")]
#[command(version = "0.1.0")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let file = match ConfigFile::from_file(&args.config) {
        Ok(file) => file,
        Err(err) => {
            error!("failed to load configuration from {}: {err}", args.config);
            process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&file.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {err}", file.bind_addr);
            process::exit(1);
        }
    };
    let layer = StreamLayer::new(listener, None, None);
    let advertise_addr = match layer.local_addr() {
        Ok(addr) => addr.to_string(),
        Err(err) => {
            error!("listener has no local address: {err}");
            process::exit(1);
        }
    };

    let mut config = file.to_config();
    config.raft.stream_layer = Some(layer.clone());

    let log = match DistributedLog::new(&file.data_dir, config) {
        Ok(log) => log,
        Err(err) => {
            error!("failed to open node {}: {err}", file.node_id);
            process::exit(1);
        }
    };
    info!("node {} serving at {advertise_addr}", file.node_id);

    // A fresh node reaches the cluster through any existing member, which
    // forwards nothing: the member must be the leader.
    if let Some(join_addr) = &file.join_addr {
        let client = RaftClient::new(layer);
        match client.join(join_addr, &file.node_id, &advertise_addr).await {
            Ok(()) => info!("joined cluster through {join_addr}"),
            Err(err) => {
                error!("failed to join cluster through {join_addr}: {err}");
                process::exit(1);
            }
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("signal handler failed: {err}");
    }
    info!("node {} shutting down", file.node_id);
    if let Err(err) = log.close().await {
        error!("shutdown error: {err}");
        process::exit(1);
    }
}
