//! Tabcast demo - runs one parent and several children on an in-process bus.
//!
//! The children start first and probe for a parent that only appears after
//! `--parent-delay-ms`. Once a child sees `connection.online` it issues an
//! `app.compute` request that the parent answers.

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use std::time::Duration;
use tabcast_core::{Connection, LocalBus, RequestBody, Role};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tabcast-demo")]
#[command(about = "Parent/child liveness demo on an in-process broadcast bus")]
struct Args {
    /// Broadcast channel name
    #[arg(long, default_value = "tabcast-demo")]
    channel: String,

    /// Number of child connections
    #[arg(short, long, default_value = "3")]
    children: usize,

    /// Delay before the parent starts
    #[arg(long, default_value = "2000")]
    parent_delay_ms: u64,

    /// Stop the parent after this many ms to show children going offline
    #[arg(long)]
    parent_lifetime_ms: Option<u64>,

    /// Total run time
    #[arg(long, default_value = "12")]
    run_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting tabcast demo on channel {}", args.channel);

    let bus = LocalBus::new();

    let parent = Connection::builder(&args.channel)
        .instance_id("parent")
        .role(Role::Parent)
        .build(&bus)?;
    let responder = parent.clone();
    parent.on_request("app", "compute", move |payload| {
        let Ok(body) = serde_json::from_value::<RequestBody>(payload.clone()) else {
            return;
        };
        let n = body.data.get("n").and_then(|n| n.as_i64()).unwrap_or(0);
        if let Err(e) = responder.respond("app", "compute", &body.id, json!({ "square": n * n })) {
            warn!("Failed to answer compute request: {}", e);
        }
    });

    let mut children = Vec::with_capacity(args.children);
    for index in 0..args.children {
        let child = Connection::builder(&args.channel)
            .instance_id(format!("child-{}", index))
            .role(Role::Child)
            .build(&bus)?;

        let handle = child.clone();
        child.on("connection", "online", move |_| {
            info!("{} sees the parent", handle.instance_id());
            let conn = handle.clone();
            tokio::spawn(async move {
                let n = index as i64 + 2;
                match conn.request("app", "compute", json!({ "n": n })).await {
                    Ok(answer) => info!("{} computed {} -> {}", conn.instance_id(), n, answer),
                    Err(e) => warn!("{} request failed: {}", conn.instance_id(), e),
                }
            });
        });
        let handle = child.clone();
        child.on("connection", "offline", move |_| {
            info!("{} lost the parent", handle.instance_id());
        });

        child.start();
        children.push(child);
    }

    tokio::time::sleep(Duration::from_millis(args.parent_delay_ms)).await;
    info!("Starting parent");
    parent.start();

    let run = tokio::time::sleep(Duration::from_secs(args.run_secs));
    tokio::pin!(run);

    if let Some(lifetime) = args.parent_lifetime_ms {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(lifetime)) => {
                info!("Stopping parent");
                parent.stop();
            }
            _ = &mut run => {}
        }
    }

    tokio::select! {
        _ = &mut run => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    for child in &children {
        info!(
            "{}: connected={} peers={:?}",
            child.instance_id(),
            child.is_connected(),
            child.peers()
        );
        child.stop();
    }
    parent.stop();

    Ok(())
}
