use crate::config::Config;
use crate::error::{Result, TransportError};
use crate::transport::{Delivery, Qos, Transport};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EchoSettings {
    pub request_topic: String,
    pub response_topic: String,
    pub qos: Qos,
}

impl EchoSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_topic: config.topics.request(),
            response_topic: config.topics.response(),
            qos: config.run.qos,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoStats {
    pub received: u64,
    pub echoed: u64,
    pub failed: u64,
}

/// Republish every request verbatim on the response topic until `shutdown`
/// resolves or the delivery stream ends.
pub async fn run_echo<F>(
    transport: &dyn Transport,
    settings: &EchoSettings,
    shutdown: F,
) -> Result<EchoStats>
where
    F: Future<Output = ()>,
{
    let mut deliveries = transport.connect().await?;
    if let Err(e) = transport
        .subscribe(&settings.request_topic, settings.qos)
        .await
    {
        let _ = transport.disconnect().await;
        return Err(e.into());
    }
    info!(
        "Echoing {} -> {} (QoS={})",
        settings.request_topic, settings.response_topic, settings.qos
    );

    let mut stats = EchoStats::default();
    tokio::pin!(shutdown);

    loop {
        let delivery = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            next = deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => {
                    info!("Delivery stream closed");
                    break;
                }
            },
        };

        stats.received += 1;
        match echo_one(transport, settings, delivery).await {
            Ok(()) => stats.echoed += 1,
            Err(e) => {
                stats.failed += 1;
                warn!("Echo publish failed: {}", e);
            }
        }
    }

    if let Err(e) = transport.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    info!(
        "Echo stopped: received={} echoed={} failed={}",
        stats.received, stats.echoed, stats.failed
    );
    Ok(stats)
}

async fn echo_one(
    transport: &dyn Transport,
    settings: &EchoSettings,
    delivery: Delivery,
) -> std::result::Result<(), TransportError> {
    // Never answer with a stronger guarantee than the request came with.
    let qos = settings.qos.min(delivery.qos);
    let payload = delivery.payload;
    debug!(
        "Echoing {} bytes from {} at QoS={}",
        payload.len(),
        delivery.topic,
        qos
    );
    transport
        .publish(&settings.response_topic, payload, qos)
        .await
}
