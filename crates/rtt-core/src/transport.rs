use crate::error::TransportError;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Capacity of the inbound delivery channel shared by all adapters.
pub const DELIVERY_CHANNEL_CAPACITY: usize = 1024;

pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Inbound messages of a connected session.
pub type Deliveries = mpsc::Receiver<Delivery>;

/// Delivery guarantee class of a pub/sub message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2 (got {other})")),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// A message handed from the transport to its consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
}

/// Request/response transport driven by the probe and echo loops.
///
/// `connect` hands back the channel every inbound message arrives on; the
/// consumer owns it, so no callback holds references into the caller.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Human-readable endpoint identity for logs and reports.
    fn endpoint(&self) -> String;

    fn connect(&self) -> TransportFuture<'_, Deliveries>;

    fn subscribe<'a>(&'a self, topic: &'a str, qos: Qos) -> TransportFuture<'a, ()>;

    fn publish<'a>(&'a self, topic: &'a str, payload: Bytes, qos: Qos)
        -> TransportFuture<'a, ()>;

    fn disconnect(&self) -> TransportFuture<'_, ()>;
}

/// In-process transport that echoes every publish back after a fixed delay.
///
/// With an `echo_limit` only the first N publishes are echoed; the rest are
/// silently dropped, which makes loss reproducible.
pub struct LoopbackTransport {
    delay: Duration,
    echo_limit: Option<usize>,
    published: AtomicUsize,
    sender: Mutex<Option<mpsc::Sender<Delivery>>>,
    subscribed: Mutex<Option<String>>,
}

impl LoopbackTransport {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            echo_limit: None,
            published: AtomicUsize::new(0),
            sender: Mutex::new(None),
            subscribed: Mutex::new(None),
        }
    }

    pub fn with_echo_limit(mut self, limit: usize) -> Self {
        self.echo_limit = Some(limit);
        self
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn endpoint(&self) -> String {
        "loopback".to_string()
    }

    fn connect(&self) -> TransportFuture<'_, Deliveries> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
            *self.sender.lock() = Some(tx);
            Ok(rx)
        })
    }

    fn subscribe<'a>(&'a self, topic: &'a str, _qos: Qos) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if self.sender.lock().is_none() {
                return Err(TransportError::Closed);
            }
            *self.subscribed.lock() = Some(topic.to_string());
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
            let sender = self.sender.lock().clone().ok_or(TransportError::Closed)?;
            let index = self.published.fetch_add(1, Ordering::Relaxed);
            if self.echo_limit.is_some_and(|limit| index >= limit) {
                return Ok(());
            }

            let topic = self
                .subscribed
                .lock()
                .clone()
                .unwrap_or_else(|| topic.to_string());
            let delay = self.delay;
            tokio::spawn(async move {
                sleep(delay).await;
                // Receiver may be gone once the run is over.
                let _ = sender
                    .send(Delivery {
                        topic,
                        payload,
                        qos,
                    })
                    .await;
            });
            Ok(())
        })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.sender.lock().take();
            Ok(())
        })
    }
}
