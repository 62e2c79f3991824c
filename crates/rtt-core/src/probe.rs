use crate::config::{Config, SendErrorPolicy};
use crate::error::{DecodeError, Result, RttError};
use crate::stats;
use crate::tracker::{CorrelationTracker, Summary};
use crate::transport::{Deliveries, Qos, Transport};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Log the running mean every this many matched responses.
pub const PROGRESS_EVERY: usize = 10;

/// Wire payload of a single probe request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub id: String,
    pub seq: u64,
    /// Wall-clock send time in seconds since the Unix epoch. Informational
    /// only, RTT uses the monotonic clock.
    pub ts: f64,
    pub blob: String,
}

impl ProbeRequest {
    pub fn new(id: String, seq: u64, blob: String) -> Self {
        let ts = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        Self { id, seq, ts, blob }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseId {
    id: Option<serde_json::Value>,
}

/// Pull the correlation id out of a response payload.
pub fn decode_response_id(payload: &[u8]) -> Result<String, DecodeError> {
    let response: ResponseId = serde_json::from_slice(payload)?;
    match response.id {
        Some(serde_json::Value::String(id)) => Ok(id),
        _ => Err(DecodeError::MissingId),
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Topic or URL requests are published to
    pub request_target: String,
    /// Topic responses arrive on
    pub response_target: String,
    pub qos: Qos,
    pub message_count: u64,
    pub payload_size: usize,
    pub pacing_interval: Duration,
    pub settle_delay: Duration,
    pub completion_timeout: Duration,
    pub on_send_error: SendErrorPolicy,
}

impl ProbeSettings {
    pub fn mqtt(config: &Config) -> Self {
        Self {
            request_target: config.topics.request(),
            response_target: config.topics.response(),
            qos: config.run.qos,
            message_count: config.run.messages,
            payload_size: config.run.payload_bytes,
            pacing_interval: config.run.pacing(),
            settle_delay: config.run.settle(),
            completion_timeout: config.run.completion_timeout(),
            on_send_error: config
                .run
                .on_send_error
                .unwrap_or(SendErrorPolicy::Continue),
        }
    }

    /// Responses come back inside each request, so there is nothing to
    /// settle and stragglers are bounded by the request timeout.
    pub fn http(config: &Config) -> Self {
        Self {
            request_target: config.http.url.clone(),
            response_target: config.http.url.clone(),
            qos: Qos::AtMostOnce,
            message_count: config.run.messages,
            payload_size: config.run.payload_bytes,
            pacing_interval: config.run.pacing(),
            settle_delay: Duration::ZERO,
            completion_timeout: Duration::from_millis(config.http.request_timeout_ms),
            on_send_error: config.run.on_send_error.unwrap_or(SendErrorPolicy::Abort),
        }
    }
}

/// Run one measurement: connect, send `message_count` requests at the
/// configured pacing, wait for stragglers, disconnect and summarize.
///
/// Only connect and subscribe failures are returned as errors. Everything
/// else degrades the received count.
pub async fn run_probe(
    transport: &dyn Transport,
    tracker: Arc<CorrelationTracker>,
    settings: &ProbeSettings,
) -> Result<Summary> {
    info!(
        "Probing {} via {} ({} messages, {} filler bytes, QoS={})",
        transport.endpoint(),
        transport.name(),
        settings.message_count,
        settings.payload_size,
        settings.qos
    );

    let deliveries = transport.connect().await?;
    if let Err(e) = transport
        .subscribe(&settings.response_target, settings.qos)
        .await
    {
        let _ = transport.disconnect().await;
        return Err(e.into());
    }

    let consumer = spawn_consumer(deliveries, tracker.clone());

    if !settings.settle_delay.is_zero() {
        sleep(settings.settle_delay).await;
    }

    let outcome = send_requests(transport, &tracker, settings).await;

    if let Ok(sent) = &outcome {
        if *sent > 0 {
            info!(
                "Waiting up to {:?} for {} outstanding responses",
                settings.completion_timeout,
                tracker.outstanding_count()
            );
        }
        if !tracker.wait_drained(settings.completion_timeout).await {
            debug!(
                "Completion timeout elapsed with {} responses outstanding",
                tracker.outstanding_count()
            );
        }
    }

    tracker.close();
    consumer.abort();
    if let Err(e) = transport.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }

    let sent = outcome?;
    Ok(tracker.summarize(sent))
}

/// Issue the requests; returns how many were sent.
async fn send_requests(
    transport: &dyn Transport,
    tracker: &CorrelationTracker,
    settings: &ProbeSettings,
) -> Result<u64> {
    let blob = "x".repeat(settings.payload_size);
    let mut sent = 0u64;

    for seq in 0..settings.message_count {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_vec(&ProbeRequest::new(id.clone(), seq, blob.clone()))
            .map_err(RttError::Encode)?;

        if let Err(e) = tracker.begin(id.clone()) {
            warn!("Skipping request seq={}: {}", seq, e);
            continue;
        }
        sent += 1;

        if let Err(e) = transport
            .publish(&settings.request_target, Bytes::from(payload), settings.qos)
            .await
        {
            tracker.abandon(&id);
            match settings.on_send_error {
                SendErrorPolicy::Continue => {
                    warn!("Send failed for seq={}: {}", seq, e);
                }
                SendErrorPolicy::Abort => {
                    warn!("Send failed for seq={}, stopping: {}", seq, e);
                    break;
                }
            }
        }

        sleep(settings.pacing_interval).await;
    }

    Ok(sent)
}

fn spawn_consumer(mut deliveries: Deliveries, tracker: Arc<CorrelationTracker>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let id = match decode_response_id(&delivery.payload) {
                Ok(id) => id,
                Err(e) => {
                    debug!("Discarding response on {}: {}", delivery.topic, e);
                    continue;
                }
            };

            match tracker.complete(&id) {
                Some(sample) if sample.ordinal % PROGRESS_EVERY == 0 => {
                    info!(
                        "[{}] running mean RTT: {:.2} ms",
                        sample.ordinal,
                        stats::as_millis_f64(sample.running_mean)
                    );
                }
                Some(_) => {}
                None => debug!("Ignoring response for unknown or late id {}", id),
            }
        }
    })
}
