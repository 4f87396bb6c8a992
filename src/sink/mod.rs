pub mod http;
pub mod influxdb;
pub mod riemann;

use std::future::Future;

use anyhow::Result;

use crate::aggregate::{Label, MetricKey};
use crate::config::SinkConfig;

pub use self::exporter::Exporter;
pub use crate::aggregate::MetricBatch;

mod exporter;

/// Sink delivers a flushed batch to a metrics backend.
///
/// A send either succeeds as a whole or fails as a whole; on failure the
/// caller keeps the batch and sends it again later, so backends may see the
/// same point more than once.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Sends every point of every series in `batch`.
    fn send(&mut self, batch: &MetricBatch) -> impl Future<Output = Result<()>> + Send;
}

/// Builds the exporter selected by the sink configuration.
pub fn from_config(cfg: &SinkConfig, metric_prefix: &str) -> Result<Exporter> {
    Exporter::from_config(cfg, metric_prefix)
}

/// Exported name of a series.
pub(crate) fn prefixed_name(prefix: &str, key: &MetricKey) -> String {
    let mut name = String::with_capacity(prefix.len() + key.name.len());
    name.push_str(prefix);
    name.push_str(&key.name);
    name
}

/// Value of the `ip` label, used as the backend host field.
pub(crate) fn host_label(labels: &[Label]) -> Option<&str> {
    labels
        .iter()
        .find(|l| l.key == "ip")
        .map(|l| l.value.as_str())
}
