use crate::error::TransportError;
use crate::transport::{
    Deliveries, Delivery, Qos, Transport, TransportFuture, DELIVERY_CHANNEL_CAPACITY,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// HTTP POST transport.
///
/// The exchange is synchronous, so each response is pushed into the
/// delivery channel as soon as `publish` reads it. Echo services such as
/// httpbin wrap the posted document under a `json` field; that inner object
/// is delivered so responses decode like an MQTT echo.
pub struct HttpTransport {
    client: reqwest::Client,
    url: url::Url,
    sender: Mutex<Option<mpsc::Sender<Delivery>>>,
}

impl HttpTransport {
    pub fn new(url: url::Url, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Connection {
                endpoint: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            url,
            sender: Mutex::new(None),
        })
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }

    fn connect(&self) -> TransportFuture<'_, Deliveries> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
            *self.sender.lock() = Some(tx);
            Ok(rx)
        })
    }

    fn subscribe<'a>(&'a self, _topic: &'a str, _qos: Qos) -> TransportFuture<'a, ()> {
        // Responses come back on the request itself.
        Box::pin(async move { Ok(()) })
    }

    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Bytes,
        qos: Qos,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let sender = self.sender.lock().clone().ok_or(TransportError::Closed)?;

            let response = self
                .client
                .post(topic)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload)
                .send()
                .await
                .map_err(|source| TransportError::Request {
                    url: topic.to_string(),
                    source,
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status {
                    url: topic.to_string(),
                    status: status.as_u16(),
                });
            }

            let body = response
                .bytes()
                .await
                .map_err(|source| TransportError::Request {
                    url: topic.to_string(),
                    source,
                })?;

            let delivery = Delivery {
                topic: topic.to_string(),
                payload: unwrap_echo_envelope(body),
                qos,
            };
            if sender.send(delivery).await.is_err() {
                debug!("Response for {} arrived after the consumer stopped", topic);
            }
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

/// Extract the posted document from an echo service envelope, or return the
/// body unchanged.
pub fn unwrap_echo_envelope(body: Bytes) -> Bytes {
    let inner = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(serde_json::Value::Object(mut map)) => match map.remove("json") {
            Some(json @ serde_json::Value::Object(_)) => json,
            _ => return body,
        },
        _ => return body,
    };
    match serde_json::to_vec(&inner) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body,
    }
}
