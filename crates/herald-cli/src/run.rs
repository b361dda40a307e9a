//! Connect, subscribe and log until interrupted.

use crate::config::CliConfig;
use anyhow::{Context, Result};
use herald_client::{Channel, Client, ConnectionState, STATE_CHANGE};
use herald_protocol::events;
use std::time::Duration;
use tracing::{info, warn};

/// Time given to a graceful disconnect on shutdown.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Run the client until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the client cannot be started or a configured channel
/// is invalid.
pub async fn run(config: CliConfig) -> Result<()> {
    let client = Client::new(config.client).context("Failed to start client")?;
    bind_logging(&client);

    if config.channels.is_empty() {
        warn!("No channels configured, only connection events will be logged");
    }
    for name in &config.channels {
        let channel = client
            .subscribe(name)
            .with_context(|| format!("Failed to subscribe to {name}"))?;
        bind_subscription_logging(&channel);
    }

    client.connect()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    client.disconnect()?;
    if tokio::time::timeout(DISCONNECT_GRACE, client.wait_for_state(ConnectionState::Disconnected))
        .await
        .is_err()
    {
        warn!("Timed out waiting for disconnect");
    }
    client.shutdown();
    Ok(())
}

fn bind_logging(client: &Client) {
    client.bind_global(|channel, event, data| {
        info!(%channel, %event, %data, "Event");
    });
    client.bind_connection(STATE_CHANGE, |data| {
        info!(
            previous = data["previous"].as_str().unwrap_or_default(),
            current = data["current"].as_str().unwrap_or_default(),
            "Connection state changed"
        );
    });
    client.bind_connection(events::CONNECTION_ESTABLISHED, |data| {
        info!(socket_id = data["socket_id"].as_str().unwrap_or_default(), "Connection established");
    });
    client.bind_connection(events::ERROR, |data| {
        warn!(%data, "Service error");
    });
}

fn bind_subscription_logging(channel: &Channel) {
    let name = channel.name().to_string();
    channel.bind(events::SUBSCRIPTION_SUCCEEDED, move |_| {
        info!(channel = %name, "Subscribed");
    });
    let name = channel.name().to_string();
    channel.bind(events::SUBSCRIPTION_ERROR, move |data| {
        warn!(channel = %name, %data, "Subscription failed");
    });
}
