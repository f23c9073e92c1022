//! rumqttc glue: the [`Bus`] implementation for `AsyncClient` and the task
//! that polls the event loop and turns its events into lifecycle signals.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::config::BrokerSettings;
use crate::connection::{Bus, ConnectionManager, ConnectionStatus};
use crate::state::SharedState;

/// Capacity of the rumqttc request channel.
const REQUEST_CAP: usize = 64;

/// Pause before polling again after a connection error. Reconnect itself is
/// rumqttc's job; this only keeps a dead broker from spinning the loop.
const ERROR_PAUSE: Duration = Duration::from_secs(2);

#[async_trait]
impl Bus for AsyncClient {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        AsyncClient::subscribe(self, topic, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("subscribe {topic}"))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, retain, payload)
            .await
            .with_context(|| format!("publish {topic}"))
    }
}

pub fn client(settings: &BrokerSettings) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    if let Some((user, pass)) = &settings.credentials {
        options.set_credentials(user, pass);
    }
    AsyncClient::new(options, REQUEST_CAP)
}

/// Poll the event loop until an outgoing disconnect.
///
/// Subscriptions triggered by a ConnAck run on their own task (see
/// [`ConnectionManager::on_lifecycle`]): they push into the same request
/// channel this loop drains, so awaiting them here could deadlock once the
/// channel fills.
pub async fn drive(mut eventloop: EventLoop, manager: Arc<ConnectionManager>, shared: SharedState) {
    let mut connected_before = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                manager.dispatch(&p.topic, &p.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let status = if connected_before {
                    ConnectionStatus::Reconnected
                } else {
                    ConnectionStatus::Connected
                };
                connected_before = true;
                info!(%status, "mqtt connack");
                transition(&manager, &shared, status).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("broker sent disconnect");
                transition(&manager, &shared, ConnectionStatus::Closed).await;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("mqtt connection closed");
                transition(&manager, &shared, ConnectionStatus::Closed).await;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                transition(&manager, &shared, ConnectionStatus::Error).await;
                shared.write().await.record_error(format!("mqtt error: {e}"));
                sleep(ERROR_PAUSE).await;
            }
        }
    }
}

async fn transition(manager: &Arc<ConnectionManager>, shared: &SharedState, status: ConnectionStatus) {
    manager.on_lifecycle(status);
    shared.write().await.record_connection(status);
}

// ---------------------------------------------------------------------------
// Recording fake
// ---------------------------------------------------------------------------
