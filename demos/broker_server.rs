//! IPC bus broker example
//!
//! Run with: cargo run --example broker_server [ADDRESS]
//!
//! Examples:
//!   cargo run --example broker_server                        # listens on 127.0.0.1:42024
//!   cargo run --example broker_server 5000                   # listens on 127.0.0.1:5000
//!   cargo run --example broker_server 0.0.0.0:5000           # listens on all interfaces
//!   cargo run --example broker_server /tmp/ipc-bus.sock      # local socket (unix)
//!   cargo run --example broker_server -- --bus-path=5000     # same flag the clients read
//!
//! Then start one or more `echo_service` examples against the same address.
//!
//! Set `RUST_LOG=ipc_bus=trace` to see every frame.

use std::time::Duration;

use ipc_bus::{BrokerConfig, BusAddress, IpcBusBroker};

fn print_usage() {
    eprintln!("Usage: broker_server [ADDRESS | --bus-path=ADDRESS]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  ADDRESS    host:port, bare port, or socket path (default: 127.0.0.1:42024)");
}

fn parse_address(args: &[String]) -> ipc_bus::Result<BusAddress> {
    if let Some(address) = BusAddress::from_args(args)? {
        return Ok(address);
    }
    match args.get(1) {
        Some(arg) => arg.parse(),
        None => Ok(BusAddress::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let address = match parse_address(&args) {
        Ok(address) => address,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ipc_bus=debug".parse()?)
                .add_directive("broker_server=debug".parse()?),
        )
        .init();

    let broker = IpcBusBroker::new(BrokerConfig::with_address(address));
    let status = broker.start(None).await?;

    println!("Broker {} on {}", status, broker.bus_address());
    println!("Peer name: {}", broker.config().peer_name);
    println!();
    println!("Clients connect with --bus-path={}", broker.bus_address());
    println!();

    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = broker.stats();
                println!(
                    "connections: {} active / {} total, routed: {} (x{:.1} fan-out), replies: {} ok / {} dropped",
                    stats.connections_active,
                    stats.connections_accepted,
                    stats.messages_routed,
                    stats.fan_out_ratio(),
                    stats.replies_routed,
                    stats.replies_dropped,
                );
                for row in broker.query_state() {
                    println!("  {:<24} {:<20} x{}", row.channel, row.peer_name, row.count);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    broker.stop().await;
    Ok(())
}
