//! Echo service example
//!
//! Run with: cargo run --example echo_service -- --bus-path=ADDRESS
//!
//! Connects to a running `broker_server`, answers requests on `echo`,
//! prints everything published on `news`, then exercises the bus itself:
//! a broadcast, a request to its own echo channel, a request nobody answers
//! and a state query.

use std::time::Duration;

use ipc_bus::{ClientConfig, IpcBusClient};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ipc_bus=info".parse()?)
                .add_directive("echo_service=debug".parse()?),
        )
        .init();

    let config = ClientConfig::from_cmdline()?;
    println!("Connecting to {} as {}", config.address, config.peer_name);
    let client = IpcBusClient::connect(config).await?;

    client.on("echo", |event, args| {
        if let Some(request) = &event.request {
            println!("[echo] request from {}: {:?}", event.sender.peer_name, args);
            request.resolve(json!(args));
        }
    })?;

    client.on("news", |event, args| {
        println!("[news] {} says {:?}", event.sender.peer_name, args);
    })?;

    client.send("news", vec![json!(format!("{} joined", client.peer_name()))])?;

    let reply = client
        .request("echo", vec![json!("ping"), json!(1)], Duration::from_secs(1))
        .await?;
    println!("echo replied: {} (from {})", reply.payload, reply.event.sender.peer_name);

    match client
        .request("nobody/home", vec![], Duration::from_millis(200))
        .await
    {
        Ok(reply) => println!("unexpected reply: {}", reply.payload),
        Err(e) => println!("as expected: {}", e),
    }

    for row in client.query_state(Duration::ZERO).await? {
        println!("  {:<24} {:<20} x{}", row.channel, row.peer_name, row.count);
    }

    println!();
    println!("Serving echo requests, Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    client.close().await;
    Ok(())
}
