use crate::error::ConfigError;
use crate::transport::Qos;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub http: HttpConfig,
    pub run: RunConfig,
    pub echo: EchoConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path` if given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.host must not be empty".into()));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Invalid("broker.port must not be 0".into()));
        }
        if self.broker.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "broker.client_id must not be empty".into(),
            ));
        }
        if self.broker.password.is_some() && self.broker.username.is_none() {
            return Err(ConfigError::Invalid(
                "broker.password requires broker.username".into(),
            ));
        }
        if self.echo.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("echo.client_id must not be empty".into()));
        }
        self.http.parsed_url()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Time allowed for CONNACK before the connection is declared failed
    pub connect_timeout_ms: u64,
    /// Largest MQTT packet accepted or sent; raised to fit the request
    /// filler when smaller
    pub max_packet_bytes: usize,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.emqx.io".to_string(),
            port: 1883,
            client_id: "rtt-client".to_string(),
            keep_alive_secs: 30,
            connect_timeout_ms: 10_000,
            max_packet_bytes: 1024 * 1024,
            username: None,
            password: None,
        }
    }
}

/// Settings of the echo responder that must differ from the prober's.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// Client id of the responder; sharing the prober's id makes the broker
    /// drop one of the two sessions
    pub client_id: String,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            client_id: "echo-server".to_string(),
        }
    }
}

/// Request/response topic pair derived from a common base.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub base: String,
}

impl TopicConfig {
    pub fn request(&self) -> String {
        format!("{}/echo/req", self.base)
    }

    pub fn response(&self) -> String {
        format!("{}/echo/resp", self.base)
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            base: "serverMQTT/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub url: String,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl HttpConfig {
    pub fn parsed_url(&self) -> Result<url::Url, ConfigError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| ConfigError::Invalid(format!("http.url {}: {e}", self.url)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::Invalid(format!(
                "http.url must be http:// or https:// (got {other}://)"
            ))),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: "https://httpbin.org/post".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

/// What the sending loop does when a single publish fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendErrorPolicy {
    /// Log and keep sending; the request is counted as lost.
    Continue,
    /// Stop sending, then wait for stragglers and report as usual.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub messages: u64,
    /// Filler bytes appended to every request
    pub payload_bytes: usize,
    pub pacing_ms: u64,
    /// Wait after subscribing before the first send
    pub settle_ms: u64,
    /// Wait for stragglers after the last send
    pub completion_timeout_ms: u64,
    pub qos: Qos,
    /// Unset means the mode's default: continue for MQTT, abort for HTTP
    pub on_send_error: Option<SendErrorPolicy>,
}

impl RunConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            messages: 50,
            payload_bytes: 32,
            pacing_ms: 20,
            settle_ms: 1_000,
            completion_timeout_ms: 10_000,
            qos: Qos::AtLeastOnce,
            on_send_error: None,
        }
    }
}

/// Convert a seconds value taken from the command line into whole milliseconds.
pub fn secs_to_millis(secs: f64) -> Result<u64, ConfigError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::Invalid(format!(
            "duration must be a non-negative number of seconds (got {secs})"
        )));
    }
    Ok((secs * 1000.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde() {
        let config_str = r#"
[broker]
host = "test.mosquitto.org"
port = 1884
client_id = "probe-1"

[topics]
base = "lab/group01"

[http]
url = "https://postman-echo.com/post"
request_timeout_ms = 2000

[run]
messages = 100
payload_bytes = 256
pacing_ms = 5
completion_timeout_ms = 3000
qos = 2
on_send_error = "abort"
        "#;

        let config: Config = toml::from_str(config_str).unwrap();
        assert_eq!(config.broker.host, "test.mosquitto.org");
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.broker.client_id, "probe-1");
        assert_eq!(config.broker.keep_alive_secs, 30);
        assert_eq!(config.topics.request(), "lab/group01/echo/req");
        assert_eq!(config.topics.response(), "lab/group01/echo/resp");
        assert_eq!(config.http.request_timeout_ms, 2000);
        assert_eq!(config.run.messages, 100);
        assert_eq!(config.run.payload_bytes, 256);
        assert_eq!(config.run.settle_ms, 1_000);
        assert_eq!(config.run.qos, Qos::ExactlyOnce);
        assert_eq!(config.run.on_send_error, Some(SendErrorPolicy::Abort));
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.broker.host, "broker.emqx.io");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.topics.request(), "serverMQTT//echo/req");
        assert_eq!(config.run.messages, 50);
        assert_eq!(config.run.pacing(), Duration::from_millis(20));
        assert_eq!(config.run.completion_timeout(), Duration::from_secs(10));
        assert_eq!(config.run.qos, Qos::AtLeastOnce);
        assert_eq!(config.run.on_send_error, None);
        assert_eq!(config.broker.max_packet_bytes, 1024 * 1024);
        assert_eq!(config.echo.client_id, "echo-server");
        config.validate().unwrap();
    }

    #[test]
    fn test_example_file_keeps_client_ids_apart() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/example.toml");
        let config = Config::from_file(path).unwrap();
        config.validate().unwrap();

        assert_eq!(config.broker.client_id, "rtt-client");
        assert_eq!(config.echo.client_id, "echo-server");
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let result: Result<Config, _> = toml::from_str("[run]\nqos = 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.broker.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.broker.client_id = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.http.url = "ftp://example.com/post".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.broker.password = Some("secret".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.echo.client_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secs_to_millis() {
        assert_eq!(secs_to_millis(0.02).unwrap(), 20);
        assert_eq!(secs_to_millis(10.0).unwrap(), 10_000);
        assert!(secs_to_millis(-1.0).is_err());
        assert!(secs_to_millis(f64::NAN).is_err());
    }
}
