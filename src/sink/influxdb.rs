//! InfluxDB v1 line protocol exporter.

use std::fmt::Write as _;

use anyhow::{bail, Context, Result};

use super::{prefixed_name, MetricBatch, Sink};
use crate::config::InfluxDbSinkConfig;

/// Writes batches to an InfluxDB `/write` endpoint at second precision.
pub struct InfluxDbExporter {
    cfg: InfluxDbSinkConfig,
    prefix: String,
    write_url: String,
    client: reqwest::Client,
}

impl InfluxDbExporter {
    pub fn new(cfg: InfluxDbSinkConfig, metric_prefix: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building InfluxDB client")?;

        let write_url = format!("{}/write", cfg.url.trim_end_matches('/'));

        Ok(Self {
            cfg,
            prefix: metric_prefix.to_string(),
            write_url,
            client,
        })
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "influxdb"
    }

    /// Renders one line per point.
    fn encode(&self, batch: &MetricBatch) -> String {
        let mut body = String::with_capacity(batch.point_count() * 96);

        for (key, series) in batch {
            let mut series_key = String::new();
            escape_into(&mut series_key, &prefixed_name(&self.prefix, key), false);
            for label in &series.labels {
                series_key.push(',');
                escape_into(&mut series_key, label.key, true);
                series_key.push('=');
                escape_into(&mut series_key, &label.value, true);
            }

            for point in &series.points {
                // Writing into a String cannot fail.
                let _ = writeln!(
                    body,
                    "{series_key} value={} {}",
                    point.value, point.timestamp
                );
            }
        }

        body
    }
}

impl Sink for InfluxDbExporter {
    fn name(&self) -> &str {
        InfluxDbExporter::name(self)
    }

    async fn send(&mut self, batch: &MetricBatch) -> Result<()> {
        let body = self.encode(batch);
        let raw_len = body.len();

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.cfg.database.as_str()), ("precision", "s")])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);

        if !self.cfg.username.is_empty() {
            request = request.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }

        let resp = request.send().await.context("sending InfluxDB write")?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("InfluxDB write returned {status}: {}", text.trim());
        }

        tracing::debug!(
            points = batch.point_count(),
            bytes = raw_len,
            "exported batch to InfluxDB",
        );

        Ok(())
    }
}

/// Escapes line protocol special characters. Measurements escape commas
/// and spaces; tag keys and values also escape `=`.
fn escape_into(out: &mut String, s: &str, is_tag: bool) {
    for c in s.chars() {
        match c {
            ',' | ' ' => out.push('\\'),
            '=' if is_tag => out.push('\\'),
            _ => {}
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Label, MetricKey, MetricSeries, Point};

    fn exporter(prefix: &str) -> InfluxDbExporter {
        InfluxDbExporter::new(
            InfluxDbSinkConfig {
                url: "http://localhost:8086/".to_string(),
                database: "firehose".to_string(),
                ..Default::default()
            },
            prefix,
        )
        .expect("exporter")
    }

    fn batch_with(name: &str, labels: Vec<Label>, points: Vec<Point>) -> MetricBatch {
        let mut batch = MetricBatch::new();
        batch.insert(
            MetricKey::internal(name, "nozzle", "10.0.0.1"),
            MetricSeries { labels, points },
        );
        batch
    }

    #[test]
    fn test_write_url_trims_slash() {
        assert_eq!(exporter("").write_url, "http://localhost:8086/write");
    }

    #[test]
    fn test_encode_line_per_point() {
        let batch = batch_with(
            "router.latency",
            vec![Label::new("deployment", "cf"), Label::new("index", "0")],
            vec![
                Point {
                    timestamp: 10,
                    value: 1.5,
                },
                Point {
                    timestamp: 11,
                    value: 2.0,
                },
            ],
        );

        assert_eq!(
            exporter("cf.").encode(&batch),
            "cf.router.latency,deployment=cf,index=0 value=1.5 10\n\
             cf.router.latency,deployment=cf,index=0 value=2 11\n"
        );
    }

    #[test]
    fn test_escape_special_characters() {
        let mut out = String::new();
        escape_into(&mut out, "a b,c=d", false);
        assert_eq!(out, "a\\ b\\,c=d");

        out.clear();
        escape_into(&mut out, "a b,c=d", true);
        assert_eq!(out, "a\\ b\\,c\\=d");
    }

    #[test]
    fn test_encode_without_labels() {
        let batch = batch_with(
            "slowConsumerAlert",
            Vec::new(),
            vec![Point {
                timestamp: 5,
                value: 0.0,
            }],
        );
        assert_eq!(exporter("").encode(&batch), "slowConsumerAlert value=0 5\n");
    }
}
