//! Runs one CANopen device stack against a SocketCAN interface until interrupted.
//!
//! Usage: `canopen-node -i can0 -p device.eds -n 5`

use std::path::PathBuf;
use std::process::ExitCode;

use canopen_node::{Node, NodeError};
use clap::Parser;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("reading EDS file {}: {source}", path.display()))]
    ReadEds { path: PathBuf, source: std::io::Error },

    #[snafu(display("{source}"))]
    Node { source: NodeError },
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// SocketCAN interface to run on (e.g. "can0", "vcan0")
    #[arg(short, long)]
    interface: String,

    /// Path to the EDS file describing this device's object dictionary
    #[arg(short = 'p', long)]
    eds: PathBuf,

    /// CANopen node id (1-127)
    #[arg(short, long)]
    node_id: u8,
}

#[cfg(target_os = "linux")]
async fn open_transport(interface: &str) -> Result<canopen_node::bus::SocketCanTransport, NodeError> {
    canopen_node::bus::SocketCanTransport::open(interface)
        .map_err(|source| NodeError::Bus { source })
}

#[cfg(not(target_os = "linux"))]
async fn open_transport(_interface: &str) -> Result<std::convert::Infallible, NodeError> {
    panic!("canopen-cli requires SocketCAN, which is only available on Linux");
}

async fn run(args: Args) -> Result<(), CliError> {
    let eds_str = std::fs::read_to_string(&args.eds).context(ReadEdsSnafu { path: args.eds.clone() })?;

    let transport = open_transport(&args.interface).await.context(NodeSnafu)?;
    let node = Node::new(&eds_str, args.node_id, transport).await.context(NodeSnafu)?;
    log::info!("node {} running on {}, state {:?}", node.node_id(), args.interface, node.state());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_task = tokio::spawn(node.run(shutdown_rx));

    tokio::signal::ctrl_c().await.expect("failed to install ctrl_c handler");
    log::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = run_task.await;

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("canopen-node: {e}");
            ExitCode::FAILURE
        }
    }
}
