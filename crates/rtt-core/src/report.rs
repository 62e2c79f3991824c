use crate::config::Config;
use crate::tracker::Summary;
use std::fmt;

/// Operator-facing summary of one run, printed once at the end.
#[derive(Debug, Clone)]
pub struct Report {
    pub title: String,
    pub endpoint_label: &'static str,
    pub endpoint: String,
    /// Omitted when the target is the endpoint itself (HTTP)
    pub target: Option<(&'static str, String)>,
    pub summary: Summary,
}

impl Report {
    pub fn mqtt(config: &Config, summary: Summary) -> Self {
        Self {
            title: "MQTT (público)".to_string(),
            endpoint_label: "Broker",
            endpoint: format!("{}:{}", config.broker.host, config.broker.port),
            target: Some(("Topic base", config.topics.base.clone())),
            summary,
        }
    }

    pub fn http(config: &Config, summary: Summary) -> Self {
        Self {
            title: "HTTP (público)".to_string(),
            endpoint_label: "URL",
            endpoint: config.http.url.clone(),
            target: None,
            summary,
        }
    }

    pub fn mock(summary: Summary) -> Self {
        Self {
            title: "Mock (loopback)".to_string(),
            endpoint_label: "Endpoint",
            endpoint: "loopback".to_string(),
            target: None,
            summary,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ===", self.title)?;
        writeln!(f, "{}: {}", self.endpoint_label, self.endpoint)?;
        if let Some((label, target)) = &self.target {
            writeln!(f, "{}: {}", label, target)?;
        }
        writeln!(
            f,
            "Enviadas: {} | Recebidas: {} | Perdas: {}",
            self.summary.sent, self.summary.received, self.summary.lost
        )?;

        let Some(latency) = &self.summary.latency else {
            return writeln!(
                f,
                "Sem RTTs calculados. Verifique broker/eco/namespace de tópicos."
            );
        };

        writeln!(f, "RTT média:   {:.2} ms", latency.mean_ms)?;
        if let Some(median) = latency.median_ms {
            writeln!(f, "RTT mediana: {:.2} ms", median)?;
        }
        if let Some(p95) = latency.p95_ms {
            writeln!(f, "RTT p95:     {:.2} ms", p95)?;
        }
        writeln!(f, "RTT máx.:    {:.2} ms", latency.max_ms)
    }
}
