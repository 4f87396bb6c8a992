use std::io::Write;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use super::{host_label, prefixed_name, MetricBatch, Sink};
use crate::aggregate::Point;
use crate::config::HttpSinkConfig;

/// Request body: every series of the batch in one document.
#[derive(Debug, Serialize)]
struct SeriesPayload<'a> {
    series: Vec<SeriesJson<'a>>,
}

#[derive(Debug, Serialize)]
struct SeriesJson<'a> {
    metric: String,
    points: &'a [Point],
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    tags: Vec<String>,
}

/// Posts batches as a JSON series document.
pub struct HttpExporter {
    cfg: HttpSinkConfig,
    prefix: String,
    client: reqwest::Client,
}

impl HttpExporter {
    pub fn new(cfg: HttpSinkConfig, metric_prefix: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            cfg,
            prefix: metric_prefix.to_string(),
            client,
        })
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "http"
    }

    fn encode(&self, batch: &MetricBatch) -> Result<Vec<u8>> {
        let series = batch
            .iter()
            .map(|(key, s)| SeriesJson {
                metric: prefixed_name(&self.prefix, key),
                points: &s.points,
                kind: "gauge",
                host: host_label(&s.labels),
                tags: s
                    .labels
                    .iter()
                    .map(|l| format!("{}:{}", l.key, l.value))
                    .collect(),
            })
            .collect();

        let mut buf = Vec::with_capacity(batch.point_count() * 64);
        serde_json::to_writer(&mut buf, &SeriesPayload { series })
            .context("serializing series to JSON")?;

        Ok(buf)
    }
}

impl Sink for HttpExporter {
    fn name(&self) -> &str {
        HttpExporter::name(self)
    }

    async fn send(&mut self, batch: &MetricBatch) -> Result<()> {
        let body = self.encode(batch)?;
        let raw_len = body.len();

        let compressed =
            compress(&body, &self.cfg.compression).context("compressing series payload")?;

        let mut request = self
            .client
            .post(&self.cfg.url)
            .header("Content-Type", "application/json")
            .body(compressed);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        if !self.cfg.api_key.is_empty() {
            request = request.query(&[("api_key", self.cfg.api_key.as_str())]);
        }

        let resp = request.send().await.context("sending series request")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("series endpoint returned unexpected status: {status}");
        }

        tracing::debug!(
            series = batch.len(),
            bytes = raw_len,
            "exported batch via HTTP",
        );

        Ok(())
    }
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::aggregate::Aggregator;
    use crate::firehose::Envelope;

    fn exporter(prefix: &str) -> HttpExporter {
        HttpExporter::new(
            HttpSinkConfig {
                url: "http://localhost:1/series".to_string(),
                ..Default::default()
            },
            prefix,
        )
        .expect("exporter")
    }

    #[test]
    fn test_compress_none() {
        let data = b"hello world";
        let result = compress(data, "none").expect("compress none");
        assert_eq!(result, data);
    }

    #[test]
    fn test_compress_gzip_roundtrip() {
        let data = b"hello world compressed with gzip";
        let compressed = compress(data, "gzip").expect("gzip compress");
        assert_ne!(compressed.as_slice(), data.as_slice());

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_unknown() {
        assert!(compress(b"x", "brotli").is_err());
    }

    #[test]
    fn test_content_encoding() {
        assert_eq!(content_encoding("gzip"), Some("gzip"));
        assert_eq!(content_encoding("none"), None);
        assert_eq!(content_encoding(""), None);
    }

    #[test]
    fn test_encode_series_document() {
        let mut agg = Aggregator::new("nozzle", "10.0.0.1");
        agg.ingest(
            &Envelope::value_metric("router", "latency", 12.5, 7_000_000_000)
                .with_source("cf", "router", "0", "10.0.0.7"),
        );
        let mut batch = agg.snapshot_and_reset();
        // Drop the self-metrics to keep the assertion focused.
        batch = {
            let mut only = MetricBatch::new();
            for (k, s) in batch.into_inner() {
                if !k.is_internal() {
                    only.insert(k, s);
                }
            }
            only
        };

        let body = exporter("cf.").encode(&batch).expect("encode");
        let doc: serde_json::Value = serde_json::from_slice(&body).expect("json");

        assert_eq!(
            doc,
            serde_json::json!({
                "series": [{
                    "metric": "cf.router.latency",
                    "points": [[7, 12.5]],
                    "type": "gauge",
                    "host": "10.0.0.7",
                    "tags": ["deployment:cf", "job:router", "index:0", "ip:10.0.0.7"],
                }]
            })
        );
    }

    #[test]
    fn test_encode_omits_missing_host() {
        let mut agg = Aggregator::new("nozzle", "10.0.0.1");
        agg.ingest(&Envelope::value_metric("o", "n", 1.0, 0));
        let batch = agg.snapshot_and_reset();

        let body = exporter("").encode(&batch).expect("encode");
        let doc: serde_json::Value = serde_json::from_slice(&body).expect("json");
        let series = doc["series"].as_array().expect("array");
        assert_eq!(series.len(), 4);

        let plain = series
            .iter()
            .find(|s| s["metric"] == "o.n")
            .expect("o.n series");
        assert!(plain.get("host").is_none());
        assert_eq!(plain["tags"], serde_json::json!([]));
    }
}
