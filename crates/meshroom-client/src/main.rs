use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshroom::media::RtpMediaDevices;
use meshroom::network::WebSocketTransport;
use meshroom::peer::WebRtcConnectionFactory;
use meshroom::{ClientConfig, RoomHandle, RoomSession};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = ClientConfig::load()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Meshroom client...");

    let room = config
        .room()
        .ok_or_else(|| anyhow!("No room configured; set MESHROOM_ROOM_ID"))?;

    let session = RoomSession::new(
        Arc::new(WebSocketTransport::new()),
        Arc::new(RtpMediaDevices::default()),
        Arc::new(WebRtcConnectionFactory::new()?),
        config.ice_servers(),
    );
    let handle = RoomHandle::spawn(session);

    handle.connect_transport(config.credentials()).await?;
    handle.join(room).await?;

    if let Some(name) = &config.display_name {
        tracing::info!("Joined as {}", name);
    }

    // Log roster changes until Ctrl-C
    let mut updates = handle.subscribe();
    let mut last_error = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                tracing::debug!(
                    "Room {:?}: {} ({} participants)",
                    snapshot.room_id,
                    snapshot.state,
                    snapshot.participants.len()
                );
                if snapshot.last_error != last_error {
                    if let Some(err) = &snapshot.last_error {
                        tracing::warn!("{}", err);
                    }
                    last_error = snapshot.last_error;
                }
            }
            _ = &mut ctrl_c => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    handle.leave().await?;
    handle.shutdown().await;

    Ok(())
}
