use crate::config::BrokerConfig;
use crate::error::TransportError;
use crate::transport::{
    Deliveries, Delivery, Qos, Transport, TransportFuture, DELIVERY_CHANNEL_CAPACITY,
};
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pending client requests the event loop buffers before `publish` waits.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Grace period for the event loop to flush DISCONNECT before it is aborted.
const PUMP_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Room for the fixed header, topic and JSON fields around the request filler.
const PACKET_OVERHEAD: usize = 1024;

/// MQTT transport backed by a `rumqttc` client.
///
/// `connect` waits for CONNACK, then a pump task owns the event loop and
/// forwards every incoming PUBLISH into the delivery channel.
pub struct MqttTransport {
    options: MqttOptions,
    max_packet_size: usize,
    endpoint: String,
    connect_timeout: Duration,
    client: Mutex<Option<AsyncClient>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    pub fn new(config: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }
        options.set_max_packet_size(config.max_packet_bytes, config.max_packet_bytes);

        Self {
            options,
            max_packet_size: config.max_packet_bytes,
            endpoint: format!("{}:{}", config.host, config.port),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            client: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    /// Raise the packet limit so requests carrying `payload_bytes` of filler
    /// (and their echoes) fit. Oversized packets would otherwise end the
    /// session on the first send.
    pub fn with_payload_capacity(mut self, payload_bytes: usize) -> Self {
        let needed = payload_bytes.saturating_add(PACKET_OVERHEAD);
        if needed > self.max_packet_size {
            debug!(
                "Raising max packet size from {} to {} bytes",
                self.max_packet_size, needed
            );
            self.max_packet_size = needed;
            self.options.set_max_packet_size(needed, needed);
        }
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.client.lock().clone().ok_or(TransportError::Closed)
    }
}

impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn connect(&self) -> TransportFuture<'_, Deliveries> {
        Box::pin(async move {
            let (client, mut eventloop) =
                AsyncClient::new(self.options.clone(), REQUEST_CHANNEL_CAPACITY);

            let handshake = async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                        Ok(_) => continue,
                        Err(e) => return Err(e),
                    }
                }
            };

            match tokio::time::timeout(self.connect_timeout, handshake).await {
                Ok(Ok(ack)) => info!("Connected to {} ({:?})", self.endpoint, ack.code),
                Ok(Err(e)) => {
                    return Err(TransportError::Connection {
                        endpoint: self.endpoint.clone(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(TransportError::Connection {
                        endpoint: self.endpoint.clone(),
                        reason: format!("no CONNACK within {:?}", self.connect_timeout),
                    })
                }
            }

            let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
            *self.pump.lock() = Some(tokio::spawn(pump(eventloop, tx)));
            *self.client.lock() = Some(client);
            Ok(rx)
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str, qos: Qos) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.client()?
                .subscribe(topic, to_rumqtt(qos))
                .await
                .map_err(|e| TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;
            info!("Subscribed to {} (QoS={})", topic, qos);
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Bytes,
        qos: Qos,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.client()?
                .publish_bytes(topic, to_rumqtt(qos), false, payload)
                .await
                .map_err(|e| TransportError::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
        })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let client = self.client.lock().take();
            let pump = self.pump.lock().take();

            let result = match client {
                Some(client) => client
                    .disconnect()
                    .await
                    .map_err(|e| TransportError::Disconnect(e.to_string())),
                None => Ok(()),
            };

            if let Some(mut pump) = pump {
                if tokio::time::timeout(PUMP_SHUTDOWN_GRACE, &mut pump)
                    .await
                    .is_err()
                {
                    debug!("Event loop did not stop in time, aborting");
                    pump.abort();
                }
            }
            result
        })
    }
}

async fn pump(mut eventloop: EventLoop, tx: mpsc::Sender<Delivery>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let delivery = Delivery {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: from_rumqtt(publish.qos),
                };
                if tx.send(delivery).await.is_err() {
                    debug!("Delivery consumer dropped, stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!("SUBACK pkid={} codes={:?}", ack.pkid, ack.return_codes);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT event loop stopped: {}", e);
                break;
            }
        }
    }
}

fn to_rumqtt(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_rumqtt(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}
