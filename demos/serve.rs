//! Stream server demo backed by a synthetic capture device
//!
//! Run with: cargo run --example serve [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example serve                  # binds to 0.0.0.0:5555
//!   cargo run --example serve 127.0.0.1:6000   # binds to 127.0.0.1:6000
//!
//! A trigger listener runs on the stream port + 1 and logs each trigger.
//!
//! ## Consuming a stream
//!
//! Send a u32 little-endian length followed by a JSON request, e.g.
//! `{"format": "mjpeg", "resize": "640x480"}`, then read size-prepended
//! frames until a zero length arrives.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use camshare::device::{Resolution, SyntheticDevice};
use camshare::pool::{ChannelPool, PoolConfig};
use camshare::server::{ServerConfig, StreamServer, TriggerConfig, TriggerHandler, TriggerServer};

/// Handler that logs trigger events
struct LogTrigger {
    count: AtomicU64,
}

#[async_trait]
impl TriggerHandler for LogTrigger {
    async fn trigger(&self) {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(count, "Trigger received");
    }

    async fn detrigger(&self) {
        tracing::info!("Trigger released");
    }
}

fn print_usage() {
    eprintln!("Usage: serve [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:5555)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let config = match args.get(1) {
        Some(addr) => match addr.parse::<SocketAddr>() {
            Ok(addr) => ServerConfig::with_addr(addr),
            Err(e) => {
                eprintln!("Error: invalid bind address '{}': {}", addr, e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("camshare=debug".parse()?)
                .add_directive("serve=debug".parse()?),
        )
        .init();

    let device = Arc::new(SyntheticDevice::new(Resolution::new(1280, 720)));
    let pool = ChannelPool::new(PoolConfig::default());

    let mut trigger_addr = config.bind_addr;
    trigger_addr.set_port(trigger_addr.port().wrapping_add(1));
    let trigger = Arc::new(
        TriggerServer::bind(
            TriggerConfig::default().bind(trigger_addr),
            LogTrigger {
                count: AtomicU64::new(0),
            },
        )
        .await?,
    );

    let server = StreamServer::bind(config, Arc::clone(&pool), device).await?;
    println!("Streaming on {}", server.local_addr());
    println!("Trigger on   {}", trigger.local_addr());

    let trigger_task = {
        let trigger = Arc::clone(&trigger);
        tokio::spawn(async move { trigger.run().await })
    };

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    trigger.shutdown();
    trigger_task.await??;
    pool.shutdown().await;
    Ok(())
}
