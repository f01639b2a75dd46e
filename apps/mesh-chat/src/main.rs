mod input;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mesh_transport::LoopbackNetwork;
use peer_mesh::{telemetry, MeshConfig, MeshHandle, MeshSnapshot, PlatformProfile, SessionStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::info;

use crate::input::{ChatCommand, HELP};

/// Terminal chat over an in-process mesh. Node 0 is driven from stdin; the
/// other nodes only join the mesh so there is someone to talk to.
#[derive(Debug, Parser)]
#[command(name = "mesh-chat", version, about)]
struct Cli {
    /// Number of mesh nodes to start on the loopback network.
    #[arg(long, env = "MESH_CHAT_NODES", default_value_t = 3)]
    nodes: usize,

    /// Platform profile used to resolve tuning; overrides MESH_PLATFORM.
    #[arg(long)]
    profile: Option<PlatformProfile>,

    #[arg(long, env = "MESH_LOG", default_value = "warn,peer_mesh=info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);

    let config = match cli.profile {
        Some(profile) => MeshConfig::from_lookup(|key| {
            if key == "MESH_PLATFORM" {
                Some(profile.to_string())
            } else {
                std::env::var(key).ok()
            }
        }),
        None => MeshConfig::from_env(),
    };
    info!(profile = %config.profile, nodes = cli.nodes, "starting mesh chat");

    let network = LoopbackNetwork::new();
    let nodes: Vec<MeshHandle> = (0..cli.nodes.max(1))
        .map(|_| {
            MeshHandle::spawn(
                config.clone(),
                Arc::new(network.clone()),
                Arc::new(network.clone()),
            )
        })
        .collect();
    let local = nodes[0].clone();
    let printer = tokio::spawn(print_updates(local.subscribe()));

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match input::parse(&line) {
            ChatCommand::Say(text) => {
                if let Some(report) = local.send_broadcast(text).await? {
                    if !report.failed.is_empty() {
                        println!("! not delivered to {}", report.failed.join(", "));
                    }
                }
            }
            ChatCommand::Peers => print_peers(&local.snapshot()),
            ChatCommand::Status => {
                println!("{}", serde_json::to_string_pretty(&local.snapshot())?);
            }
            ChatCommand::Refresh => local.force_refresh()?,
            ChatCommand::Reconnect => local.reconnect_now()?,
            ChatCommand::Clear => local.clear_log()?,
            ChatCommand::Connect(peer) => local.connect_to(peer)?,
            ChatCommand::Help => println!("{HELP}"),
            ChatCommand::Quit => break,
            ChatCommand::Unknown(message) => println!("! {message}"),
        }
    }

    for node in &nodes {
        node.shutdown().await.ok();
    }
    printer.abort();
    Ok(())
}

fn print_peers(snapshot: &MeshSnapshot) {
    if snapshot.peers.is_empty() {
        println!("no peers yet");
        return;
    }
    for peer in &snapshot.peers {
        println!("{:<32} {:?} ({:?})", peer.peer_id, peer.phase, peer.direction);
    }
}

/// Echo status changes, roster changes and new log entries as they happen.
async fn print_updates(mut updates: watch::Receiver<MeshSnapshot>) {
    let mut status = SessionStatus::Uninitialized;
    let mut roster: Vec<String> = Vec::new();
    let mut printed = 0;
    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();
        if snapshot.status != status {
            status = snapshot.status;
            match (&snapshot.local_id, snapshot.terminal_failure) {
                (_, true) => println!("* {status:?}: gave up reconnecting, type /reconnect"),
                (Some(id), false) => println!("* {status:?} as {id}"),
                (None, false) => println!("* {status:?}"),
            }
        }
        if snapshot.roster != roster {
            roster = snapshot.roster.clone();
            println!("* {} peer(s) connected", roster.len());
        }
        if snapshot.log.len() < printed {
            printed = 0;
        }
        for entry in &snapshot.log[printed..] {
            println!("{entry}");
        }
        printed = snapshot.log.len();
    }
}
