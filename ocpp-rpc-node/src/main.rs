//! OCPP RPC Node - CLI networking node
//!
//! Hosts one OCPP 2.1 node: serves WebSocket links, connects to an
//! upstream node, or runs an in-process multi-hop demo.
//!
//! # Usage
//!
//! ```bash
//! # CSMS side
//! ocpp-rpc-node --node-id CSMS serve --listen 127.0.0.1:9000
//!
//! # Charging station connecting to it, heartbeat every 10 s
//! ocpp-rpc-node --node-id CS001 connect --url ws://127.0.0.1:9000/ocpp --peer CSMS --heartbeat 10
//!
//! # Three nodes A-B-C in one process, Heartbeat source-routed from A to C
//! ocpp-rpc-node demo
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use ocpp_rpc::actions::{
    BootNotificationRequest, BootNotificationResponse, BootReason, ChargingStationInfo,
    DataTransferRequest, DataTransferResponse, DataTransferStatus, HeartbeatRequest,
    HeartbeatResponse, RegistrationStatus,
};
use ocpp_rpc::transport::{link, ws};
use ocpp_rpc::{LinkError, Node, NodeConfig, NodeId, RoutingError, SourceRouting};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP 2.1 networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Identity of this node on the overlay
    #[arg(short, long, default_value = "EK3-001")]
    node_id: String,

    /// Default call timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Uplink used for destinations without a direct connection
    #[arg(long)]
    default_route: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept WebSocket links from other nodes
    Serve {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:9000")]
        listen: String,
    },

    /// Connect to an upstream node and keep the link up
    Connect {
        /// Base WebSocket URL; the node id is appended
        #[arg(long)]
        url: String,

        /// Node id of the upstream peer
        #[arg(long, default_value = "CSMS")]
        peer: String,

        /// Heartbeat interval in seconds (0 disables)
        #[arg(long, default_value = "60")]
        heartbeat: u64,
    },

    /// Run three in-process nodes A-B-C and route a Heartbeat from A to C
    Demo,
}

#[derive(Debug, Error)]
enum NodeError {
    #[error("Invalid listen address {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("Demo call failed: {0}")]
    Demo(String),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = NodeConfig::new(args.node_id.as_str())
        .with_request_timeout(Duration::from_secs(args.timeout));
    if let Some(uplink) = &args.default_route {
        config = config.with_default_route(uplink.as_str());
    }

    match args.command {
        Command::Serve { listen } => serve(config, &listen).await?,
        Command::Connect {
            url,
            peer,
            heartbeat,
        } => connect(config, url, NodeId::new(peer), heartbeat).await?,
        Command::Demo => demo().await?,
    }

    Ok(())
}

fn register_handlers(node: &Node) {
    node.dispatcher()
        .register_typed::<HeartbeatRequest, _, _>(|ctx, _request| async move {
            info!("Heartbeat from {} via {}", ctx.from, ctx.network_path);
            Ok(HeartbeatResponse {
                current_time: Utc::now(),
            })
        });

    node.dispatcher()
        .register_typed::<BootNotificationRequest, _, _>(|ctx, request| async move {
            info!(
                "BootNotification from {}: {} {} ({:?})",
                ctx.from,
                request.charging_station.vendor_name,
                request.charging_station.model,
                request.reason
            );
            Ok(BootNotificationResponse {
                current_time: Utc::now(),
                interval: 300,
                status: RegistrationStatus::Accepted,
                status_info: None,
            })
        });

    node.dispatcher()
        .register_typed::<DataTransferRequest, _, _>(|ctx, request| async move {
            info!("DataTransfer from {} for vendor {}", ctx.from, request.vendor_id);
            Ok(DataTransferResponse {
                status: DataTransferStatus::Accepted,
                status_info: None,
                data: request.data,
            })
        });
}

async fn serve(config: NodeConfig, listen: &str) -> Result<(), NodeError> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| NodeError::InvalidAddress(listen.to_string()))?;

    let node = Node::new(config);
    register_handlers(&node);
    info!("Node {} serving OCPP 2.1 on {}", node.id(), addr);

    ws::listen(node, addr).await?;
    Ok(())
}

async fn connect(
    config: NodeConfig,
    url: String,
    peer: NodeId,
    heartbeat: u64,
) -> Result<(), NodeError> {
    let node = Node::new(config);
    register_handlers(&node);

    let link = tokio::spawn(ws::connect_with_retry(node.clone(), url, peer.clone()));

    while node.routes().get(&peer).is_none() {
        if link.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let boot = BootNotificationRequest {
        charging_station: ChargingStationInfo {
            model: "EK3-OCPP".to_string(),
            vendor_name: "Elektrokombinacija".to_string(),
            serial_number: None,
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        },
        reason: BootReason::PowerUp,
    };
    let response = node.send(SourceRouting::direct(peer.clone()), &boot).await;
    match response.into_result() {
        Ok(accepted) => info!("Boot {:?}, interval {}s", accepted.status, accepted.interval),
        Err(outcome) => warn!("BootNotification failed: {}", outcome),
    }

    if heartbeat > 0 {
        let mut interval = tokio::time::interval(Duration::from_secs(heartbeat));
        loop {
            interval.tick().await;
            if link.is_finished() {
                break;
            }
            let response = node
                .send(SourceRouting::direct(peer.clone()), &HeartbeatRequest {})
                .await;
            match response.into_result() {
                Ok(beat) => info!("Heartbeat acknowledged at {}", beat.current_time),
                Err(outcome) => warn!("Heartbeat failed: {}", outcome),
            }
        }
    }

    match link.await {
        Ok(result) => result?,
        Err(e) => error!("Link task failed: {}", e),
    }
    Ok(())
}

async fn demo() -> Result<(), NodeError> {
    let a = Node::new(NodeConfig::new("A"));
    let b = Node::new(NodeConfig::new("B"));
    let c = Node::new(NodeConfig::new("C"));

    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    c.dispatcher()
        .register_typed::<HeartbeatRequest, _, _>(move |ctx, _request| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(ctx.network_path.clone());
                Ok(HeartbeatResponse {
                    current_time: Utc::now(),
                })
            }
        });

    let ab = link(&a, &b);
    let bc = link(&b, &c);

    let route = SourceRouting::path(["A", "B", "C"])?;
    println!();
    println!("Heartbeat A -> C via {}", route);

    let response = a.send(route, &HeartbeatRequest {}).await;
    println!("  request id:   {}", response.request_id);
    println!("  outcome:      {}", response.outcome);
    println!("  runtime:      {:?}", response.runtime);

    let beat = response
        .into_result()
        .map_err(|outcome| NodeError::Demo(outcome.to_string()))?;
    println!("  current time: {}", beat.current_time);

    if let Some(path) = seen.recv().await {
        println!("  path at C:    {}", path);
    }
    println!();

    ab.close();
    bc.close();
    Ok(())
}
