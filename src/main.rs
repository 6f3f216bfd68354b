//! stdio-rpc - demo driver for the weather / URL shortener tool server.
//!
//! Spawns the configured peer, waits for it to signal readiness, calls each
//! tool once, prints the parsed payloads, and always shuts the peer down.
//!
//! Usage: `stdio-rpc [config.json]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stdio_rpc::tools::{self, Coordinates, ShortenUrlParams, ToolResult};
use stdio_rpc::{ClientConfig, RpcClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the payloads.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "stdio_rpc=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    info!("Starting stdio-rpc v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ClientConfig::resolve(config_path.as_deref())?;

    let client = RpcClient::start(&config)
        .await
        .with_context(|| format!("Failed to start tool server '{}'", config.command))?;
    info!("Tool server is ready (pid {:?})", client.pid());

    if let Err(e) = run_tools(&client).await {
        error!("An error occurred during tool calls: {:#}", e);
    }

    info!("All operations finished; terminating tool server");
    match client.terminate().await {
        Ok(code) => info!("Tool server exited with code {:?}", code),
        Err(e) => warn!("Failed to terminate tool server: {}", e),
    }
    Ok(())
}

async fn run_tools(client: &RpcClient) -> Result<()> {
    call_tool(
        client,
        "Current weather",
        tools::GET_WEATHER,
        serde_json::to_value(Coordinates::new(40.7128, -74.0060))?,
    )
    .await?;

    call_tool(
        client,
        "Forecast",
        tools::FORECAST,
        serde_json::to_value(Coordinates::new(34.0522, -118.2437))?,
    )
    .await?;

    call_tool(
        client,
        "Shortened URL",
        tools::SHORTEN_URL,
        serde_json::to_value(ShortenUrlParams {
            url: "https://www.example.com".to_string(),
            url_name: Some("aman-site-ts".to_string()),
        })?,
    )
    .await?;

    Ok(())
}

/// Invoke one tool and print its payload. Format surprises are logged, not fatal.
async fn call_tool(client: &RpcClient, label: &str, tool: &str, params: Value) -> Result<()> {
    info!("Calling {}", tool);
    let raw = client
        .invoke(tool, params)
        .await
        .with_context(|| format!("Tool '{}' failed", tool))?;

    let payload = ToolResult::from_value(raw.clone()).and_then(|result| result.payload());
    match payload {
        Ok(data) => println!("{}:\n{}", label, serde_json::to_string_pretty(&data)?),
        Err(e) => {
            warn!("{} response has an unexpected format: {}", label, e);
            println!("{} (raw):\n{}", label, serde_json::to_string_pretty(&raw)?);
        }
    }
    Ok(())
}
