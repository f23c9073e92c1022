//! Bus side of the logger: subscribe to every configured filter on each
//! ConnAck and hand decoded publishes to the writer.

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::message::{EventRecord, TopicMap};
use crate::writer::dead_letter;

const REQUEST_CAP: usize = 64;
const ERROR_PAUSE: Duration = Duration::from_secs(2);

/// Build the client. `None` when no broker host is configured.
pub fn client(settings: &Settings) -> Option<(AsyncClient, EventLoop)> {
    let host = settings.mqtt_host.as_deref()?;
    let mut options = MqttOptions::new(&settings.mqtt_client_id, host, settings.mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    if let Some((user, pass)) = &settings.credentials {
        options.set_credentials(user, pass);
    }
    Some(AsyncClient::new(options, REQUEST_CAP))
}

/// Turn one publish into a record, or `None` (with a warning) when the
/// topic is unmapped or the payload is not JSON.
pub fn handle_publish(
    topics: &TopicMap,
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Option<EventRecord> {
    let Some(event_type) = topics.event_type_for(topic) else {
        debug!(%topic, "no event type for topic");
        return None;
    };
    match EventRecord::decode(topic, payload, event_type, received_at) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(%topic, bytes = payload.len(), "dropping malformed payload: {e}");
            None
        }
    }
}

/// Queue a record for the writer without waiting on it. When the queue is
/// full the record is dead-lettered instead, so the poll loop keeps running
/// (and keep-alives keep flowing) through a storage outage. Returns `false`
/// once the writer is gone.
pub async fn forward(
    records: &mpsc::Sender<EventRecord>,
    record: EventRecord,
    dead_letter_path: Option<&Path>,
) -> bool {
    match records.try_send(record) {
        Ok(()) => true,
        Err(TrySendError::Full(record)) => {
            dead_letter(dead_letter_path, &record, "writer queue full").await;
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Poll until an outgoing disconnect or until the writer goes away.
pub async fn run(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Arc<TopicMap>,
    records: mpsc::Sender<EventRecord>,
    dead_letter_path: Option<PathBuf>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(filters = topics.entries().len(), "logger connected to mqtt");
                // Subscribing enqueues on the channel this loop drains.
                tokio::spawn(subscribe_all(client.clone(), topics.clone()));
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(record) = handle_publish(&topics, &p.topic, &p.payload, Utc::now()) else {
                    continue;
                };
                if !forward(&records, record, dead_letter_path.as_deref()).await {
                    error!("writer stopped; leaving mqtt loop");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("mqtt connection closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                sleep(ERROR_PAUSE).await;
            }
        }
    }
}

async fn subscribe_all(client: AsyncClient, topics: Arc<TopicMap>) {
    for filter in topics.filters() {
        match client.subscribe(filter, QoS::AtLeastOnce).await {
            Ok(()) => info!(%filter, "subscribed"),
            Err(e) => error!(%filter, "subscribe failed: {e}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
