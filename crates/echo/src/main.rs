use anyhow::{Context, Result};
use clap::Parser;
use rtt_core::{run_echo, Config, EchoSettings, MqttTransport, Qos};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mqtt-echo")]
#[command(about = "Reflect every request on {base}/echo/req back to {base}/echo/resp")]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(long, env = "MQTT_HOST")]
    host: Option<String>,

    /// Broker port
    #[arg(long, env = "MQTT_PORT")]
    port: Option<u16>,

    /// Base topic shared with the prober
    #[arg(long, env = "MQTT_BASE")]
    base_topic: Option<String>,

    /// Highest delivery level used for subscribing and answering (0, 1 or 2)
    #[arg(long, env = "MQTT_QOS")]
    qos: Option<u8>,

    /// MQTT client identifier (defaults to echo.client_id)
    #[arg(long, env = "MQTT_ID")]
    client_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
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

    let transport = MqttTransport::new(&config.broker)
        .with_payload_capacity(config.run.payload_bytes);
    let settings = EchoSettings::from_config(&config);
    info!(
        "Starting echo responder '{}' on {}:{}",
        config.broker.client_id, config.broker.host, config.broker.port
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let stats = run_echo(&transport, &settings, shutdown)
        .await
        .context("Echo responder failed")?;

    println!();
    println!("=== Echo ===");
    println!(
        "Recebidas: {} | Ecoadas: {} | Falhas: {}",
        stats.received, stats.echoed, stats.failed
    );
    Ok(())
}

/// The responder connects with its own client id so it can share a config
/// file with the prober without the broker dropping either session.
fn apply_overrides(config: &mut Config, args: &Args) -> Result<()> {
    config.broker.client_id = config.echo.client_id.clone();
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
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "mqtt-echo",
            "--base-topic",
            "lab/group01",
            "--qos",
            "2",
            "--client-id",
            "echo-7",
        ]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args).unwrap();

        let settings = EchoSettings::from_config(&config);
        assert_eq!(settings.request_topic, "lab/group01/echo/req");
        assert_eq!(settings.response_topic, "lab/group01/echo/resp");
        assert_eq!(settings.qos, Qos::ExactlyOnce);
        assert_eq!(config.broker.client_id, "echo-7");
    }

    #[test]
    fn test_shared_config_file_uses_echo_client_id() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/example.toml");
        let args = Args::parse_from(["mqtt-echo", "--config", path]);
        let mut config = Config::load(args.config.as_deref()).unwrap();
        let prober_id = config.broker.client_id.clone();
        apply_overrides(&mut config, &args).unwrap();
        config.validate().unwrap();

        assert_eq!(config.broker.client_id, "echo-server");
        assert_ne!(config.broker.client_id, prober_id);
    }

    #[test]
    fn test_echo_client_id_from_file_section() {
        let mut config = Config::default();
        config.broker.client_id = "lab-1".to_string();
        config.echo.client_id = "lab-1-echo".to_string();
        let args = Args::parse_from(["mqtt-echo"]);
        apply_overrides(&mut config, &args).unwrap();
        assert_eq!(config.broker.client_id, "lab-1-echo");
    }
}
