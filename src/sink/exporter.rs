use anyhow::Result;

use super::http::HttpExporter;
use super::influxdb::InfluxDbExporter;
use super::riemann::RiemannExporter;
use super::{MetricBatch, Sink};
use crate::config::SinkConfig;

/// Exporter dispatches metric batches to the configured backend.
///
/// Uses enum dispatch rather than trait objects so `send` stays a plain
/// async call on the hot flush path.
pub enum Exporter {
    Http(HttpExporter),
    InfluxDb(InfluxDbExporter),
    Riemann(RiemannExporter),
}

impl Exporter {
    /// Builds the exporter for `cfg`. Every exported name gets `metric_prefix`.
    pub fn from_config(cfg: &SinkConfig, metric_prefix: &str) -> Result<Self> {
        let exporter = match cfg {
            SinkConfig::Http(c) => Self::Http(HttpExporter::new(c.clone(), metric_prefix)?),
            SinkConfig::Influxdb(c) => {
                Self::InfluxDb(InfluxDbExporter::new(c.clone(), metric_prefix)?)
            }
            SinkConfig::Riemann(c) => Self::Riemann(RiemannExporter::new(c.clone(), metric_prefix)),
        };

        Ok(exporter)
    }
}

impl Sink for Exporter {
    fn name(&self) -> &str {
        match self {
            Self::Http(e) => e.name(),
            Self::InfluxDb(e) => e.name(),
            Self::Riemann(e) => e.name(),
        }
    }

    async fn send(&mut self, batch: &MetricBatch) -> Result<()> {
        match self {
            Self::Http(e) => e.send(batch).await,
            Self::InfluxDb(e) => e.send(batch).await,
            Self::Riemann(e) => e.send(batch).await,
        }
    }
}
