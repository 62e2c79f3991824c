use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rtt_core::{
    secs_to_millis, Config, CorrelationTracker, HttpTransport, LoopbackTransport, MqttTransport,
    ProbeSettings, Qos, Report, Summary, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Mqtt,
    Http,
    Mock,
}

#[derive(Parser, Debug)]
#[command(name = "rtt-prober")]
#[command(about = "Measure round-trip time and loss against an MQTT echo or an HTTP endpoint")]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Transport to probe: mqtt, http or mock
    #[arg(long, value_enum, default_value = "mqtt")]
    mode: Mode,

    /// Broker host
    #[arg(long, env = "MQTT_HOST")]
    host: Option<String>,

    /// Broker port
    #[arg(long, env = "MQTT_PORT")]
    port: Option<u16>,

    /// Base topic; requests go to {base}/echo/req, responses to {base}/echo/resp
    #[arg(long, env = "MQTT_BASE")]
    base_topic: Option<String>,

    /// Delivery level (0, 1 or 2)
    #[arg(long, env = "MQTT_QOS")]
    qos: Option<u8>,

    /// MQTT client identifier
    #[arg(long, env = "MQTT_ID")]
    client_id: Option<String>,

    /// Endpoint for --mode http
    #[arg(long, env = "HTTP_URL")]
    url: Option<String>,

    /// Number of requests to send
    #[arg(long, env = "N")]
    messages: Option<u64>,

    /// Filler bytes added to every request
    #[arg(long, env = "BYTES")]
    bytes: Option<usize>,

    /// Pause between requests, in seconds
    #[arg(long, env = "SLEEP")]
    sleep: Option<f64>,

    /// Seconds to wait for stragglers (per-request timeout in http mode)
    #[arg(long, env = "TIMEOUT")]
    timeout: Option<f64>,

    /// Simulated round trip for --mode mock, in milliseconds
    #[arg(long, default_value = "5")]
    mock_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    apply_overrides(&mut config, &args)?;
    config.validate().context("Invalid configuration")?;

    let tracker = Arc::new(CorrelationTracker::new());

    let report = match args.mode {
        Mode::Mqtt => {
            let transport = MqttTransport::new(&config.broker)
                .with_payload_capacity(config.run.payload_bytes);
            let summary = probe(&transport, tracker, ProbeSettings::mqtt(&config)).await?;
            Report::mqtt(&config, summary)
        }
        Mode::Http => {
            let url = config.http.parsed_url()?;
            let timeout = Duration::from_millis(config.http.request_timeout_ms);
            let transport =
                HttpTransport::new(url, timeout).context("Failed to create HTTP client")?;
            let summary = probe(&transport, tracker, ProbeSettings::http(&config)).await?;
            Report::http(&config, summary)
        }
        Mode::Mock => {
            let transport = LoopbackTransport::new(Duration::from_millis(args.mock_delay_ms));
            let summary = probe(&transport, tracker, ProbeSettings::mqtt(&config)).await?;
            Report::mock(summary)
        }
    };

    println!();
    print!("{report}");
    Ok(())
}

async fn probe(
    transport: &dyn Transport,
    tracker: Arc<CorrelationTracker>,
    settings: ProbeSettings,
) -> Result<Summary> {
    info!("Using transport: {}", transport.name());
    rtt_core::run_probe(transport, tracker, &settings)
        .await
        .with_context(|| format!("Measurement against {} failed", transport.endpoint()))
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(host) = &args.host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(base) = &args.base_topic {
        config.topics.base = base.clone();
    }
    if let Some(qos) = args.qos {
        config.run.qos = Qos::try_from(qos).map_err(anyhow::Error::msg)?;
    }
    if let Some(client_id) = &args.client_id {
        config.broker.client_id = client_id.clone();
    }
    if let Some(url) = &args.url {
        config.http.url = url.clone();
    }
    if let Some(messages) = args.messages {
        config.run.messages = messages;
    }
    if let Some(bytes) = args.bytes {
        config.run.payload_bytes = bytes;
    }
    if let Some(sleep) = args.sleep {
        config.run.pacing_ms = secs_to_millis(sleep).context("--sleep")?;
    }
    if let Some(timeout) = args.timeout {
        let millis = secs_to_millis(timeout).context("--timeout")?;
        match args.mode {
            Mode::Http => config.http.request_timeout_ms = millis,
            Mode::Mqtt | Mode::Mock => config.run.completion_timeout_ms = millis,
        }
    }
    Ok(())
}
