//! MQTT message fabric.
//!
//! One broker connection per process. A driver task owns the rumqttc event
//! loop: it routes inbound publishes to per-subscription bounded channels and
//! re-issues every subscription after a reconnect. Commands between city
//! managers and post workers travel at QoS 1; vehicle-facing status traffic
//! at QoS 0, where dropping on a full channel is acceptable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{CgridError, CgridResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const REQUEST_QUEUE_CAPACITY: usize = 64;

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

struct SubEntry {
    id: u64,
    filter: String,
    qos: QoS,
    tx: mpsc::Sender<InboundMessage>,
}

/// Handle to the shared broker connection.
#[derive(Clone)]
pub struct Fabric {
    client: AsyncClient,
    subs: Arc<Mutex<Vec<SubEntry>>>,
    next_sub_id: Arc<AtomicU64>,
}

impl Fabric {
    /// Connect to the broker and spawn the driver task.
    ///
    /// Fails if the broker does not acknowledge the session within the
    /// connect timeout; callers treat that as fatal at boot.
    pub async fn connect(broker_url: &str, client_id: &str) -> CgridResult<Self> {
        let (host, port) = parse_broker_url(broker_url)?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);

        let handshake = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => break Ok(()),
                    Ok(_) => continue,
                    Err(e) => break Err(CgridError::Mqtt(e.to_string())),
                }
            }
        })
        .await;

        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CgridError::Mqtt(format!(
                    "timed out connecting to broker {broker_url}"
                )))
            }
        }
        info!("connected to mqtt broker {broker_url} as {client_id}");

        let fabric = Self {
            client,
            subs: Arc::new(Mutex::new(Vec::new())),
            next_sub_id: Arc::new(AtomicU64::new(1)),
        };
        fabric.spawn_driver(eventloop);
        Ok(fabric)
    }

    fn spawn_driver(&self, mut eventloop: EventLoop) {
        let subs = self.subs.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        let targets: Vec<(String, mpsc::Sender<InboundMessage>)> = {
                            let entries = subs.lock();
                            entries
                                .iter()
                                .filter(|e| topic_matches(&e.filter, &publish.topic))
                                .map(|e| (e.filter.clone(), e.tx.clone()))
                                .collect()
                        };
                        if targets.is_empty() {
                            debug!("no subscriber for topic {}", publish.topic);
                        }
                        for (filter, tx) in targets {
                            if tx.try_send(message.clone()).is_err() {
                                warn!(
                                    "inbound channel full for {filter}, dropping message on {}",
                                    publish.topic
                                );
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // Reconnected: the broker session is clean, so every
                        // live subscription must be re-issued.
                        let filters: Vec<(String, QoS)> = {
                            let entries = subs.lock();
                            entries.iter().map(|e| (e.filter.clone(), e.qos)).collect()
                        };
                        info!("mqtt reconnected, resuming {} subscriptions", filters.len());
                        for (filter, qos) in filters {
                            if let Err(e) = client.subscribe(filter.clone(), qos).await {
                                warn!("failed to resubscribe to {filter}: {e}");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("mqtt connection error: {e}, retrying");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        });
    }

    /// Subscribe to a topic filter; inbound messages arrive on a bounded
    /// channel of the given capacity.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        capacity: usize,
    ) -> CgridResult<Subscription> {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().push(SubEntry {
            id,
            filter: filter.to_string(),
            qos,
            tx,
        });

        if let Err(e) = self.client.subscribe(filter.to_string(), qos).await {
            self.subs.lock().retain(|e| e.id != id);
            return Err(CgridError::Mqtt(format!("subscribe {filter}: {e}")));
        }
        debug!("subscribed to {filter}");

        Ok(Subscription {
            id,
            filter: filter.to_string(),
            rx,
            subs: self.subs.clone(),
            client: self.client.clone(),
        })
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        qos: QoS,
        value: &T,
    ) -> CgridResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| CgridError::Mqtt(format!("publish {topic}: {e}")))
    }
}

/// One live subscription; dropping it unsubscribes when no other
/// subscription shares the filter.
pub struct Subscription {
    id: u64,
    filter: String,
    rx: mpsc::Receiver<InboundMessage>,
    subs: Arc<Mutex<Vec<SubEntry>>>,
    client: AsyncClient,
}

impl Subscription {
    /// Await the next inbound message. `None` means the fabric shut down.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut entries = self.subs.lock();
        entries.retain(|e| e.id != self.id);
        let shared = entries.iter().any(|e| e.filter == self.filter);
        drop(entries);
        if !shared {
            let _ = self.client.try_unsubscribe(&self.filter);
        }
    }
}

/// Accepts `tcp://host:port`, `mqtt://host:port` or bare `host:port`;
/// the port defaults to 1883.
fn parse_broker_url(url: &str) -> CgridResult<(String, u16)> {
    let stripped = url
        .trim()
        .trim_start_matches("tcp://")
        .trim_start_matches("mqtt://");
    if stripped.is_empty() {
        return Err(CgridError::InvalidConfig(format!(
            "invalid mqtt broker url: {url}"
        )));
    }

    match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| {
                CgridError::InvalidConfig(format!("invalid mqtt broker port in {url}"))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((stripped.to_string(), 1883)),
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
