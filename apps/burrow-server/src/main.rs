#![forbid(unsafe_code)]

use std::net::SocketAddr;

use burrow_server::{build_router, init_tracing, AppConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let database_url = std::env::var("BURROW_DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("BURROW_DATABASE_URL is required for runtime"))?;
    let gateway_outbound_queue = std::env::var("BURROW_GATEWAY_OUTBOUND_QUEUE").map_or_else(
        |_| Ok(AppConfig::default().gateway_outbound_queue),
        |value| {
            value.parse::<usize>().map_err(|e| {
                anyhow::anyhow!("invalid BURROW_GATEWAY_OUTBOUND_QUEUE value {value:?}: {e}")
            })
        },
    )?;
    let max_group_room_members = std::env::var("BURROW_MAX_GROUP_ROOM_MEMBERS").map_or_else(
        |_| Ok(AppConfig::default().max_group_room_members),
        |value| {
            value.parse::<usize>().map_err(|e| {
                anyhow::anyhow!("invalid BURROW_MAX_GROUP_ROOM_MEMBERS value {value:?}: {e}")
            })
        },
    )?;
    let app_config = AppConfig {
        gateway_outbound_queue,
        max_group_room_members,
        database_url: Some(database_url),
        ..AppConfig::default()
    };
    let app = build_router(&app_config)?;
    let addr = std::env::var("BURROW_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid BURROW_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "burrow-server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
