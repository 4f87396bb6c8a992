//! Riemann protobuf exporter.
//!
//! Every point becomes one Riemann `Event`. Over TCP each `Msg` is framed
//! with a 4-byte big-endian length and the server acknowledges with a `Msg`
//! whose `ok` flag is checked. Over UDP messages are fire-and-forget.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use super::{host_label, prefixed_name, MetricBatch, Sink};
use crate::config::{RiemannSinkConfig, RiemannTransport};

/// Tag attached to every event sent by the nozzle.
const EVENT_TAG: &str = "firehose";

/// Events per UDP datagram, keeping messages well under common MTU limits.
const UDP_EVENTS_PER_DATAGRAM: usize = 32;

/// Upper bound on an acknowledgement frame.
const MAX_RESPONSE_LEN: u32 = 1 << 20;

/// Sends batches to a Riemann server.
pub struct RiemannExporter {
    cfg: RiemannSinkConfig,
    prefix: String,
}

impl RiemannExporter {
    pub fn new(cfg: RiemannSinkConfig, metric_prefix: &str) -> Self {
        Self {
            cfg,
            prefix: metric_prefix.to_string(),
        }
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "riemann"
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.cfg.host, self.cfg.port)
    }

    fn events(&self, batch: &MetricBatch) -> Vec<Event> {
        let mut events = Vec::with_capacity(batch.point_count());

        for (key, series) in batch {
            let service = prefixed_name(&self.prefix, key);
            let host = host_label(&series.labels).map(str::to_string);
            let attributes: Vec<Attribute> = series
                .labels
                .iter()
                .map(|l| Attribute {
                    key: l.key.to_string(),
                    value: Some(l.value.clone()),
                })
                .collect();

            for point in &series.points {
                events.push(Event {
                    time: Some(point.timestamp),
                    service: Some(service.clone()),
                    host: host.clone(),
                    tags: vec![EVENT_TAG.to_string()],
                    attributes: attributes.clone(),
                    metric_d: Some(point.value),
                    ..Default::default()
                });
            }
        }

        events
    }

    async fn send_tcp(&self, msg: &Msg) -> Result<()> {
        let addr = self.addr();
        let timeout = self.cfg.timeout;

        let mut stream = with_timeout(timeout, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("connecting to riemann at {addr}"))?;

        let payload = msg.encode_to_vec();
        let len = u32::try_from(payload.len()).context("riemann message too large")?;

        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);

        with_timeout(timeout, stream.write_all(&frame))
            .await
            .context("writing riemann message")?;

        let resp_len = with_timeout(timeout, stream.read_u32())
            .await
            .context("reading riemann response length")?;
        if resp_len > MAX_RESPONSE_LEN {
            bail!("riemann response too large: {resp_len} bytes");
        }

        let mut buf = vec![0u8; resp_len as usize];
        with_timeout(timeout, stream.read_exact(&mut buf))
            .await
            .context("reading riemann response")?;

        let resp = Msg::decode(buf.as_slice()).context("decoding riemann response")?;
        check_ack(&resp)
    }

    async fn send_udp(&self, events: Vec<Event>) -> Result<()> {
        let addr = self.addr();
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding riemann UDP socket")?;
        socket
            .connect(&addr)
            .await
            .with_context(|| format!("resolving riemann at {addr}"))?;

        for chunk in events.chunks(UDP_EVENTS_PER_DATAGRAM) {
            let msg = Msg {
                events: chunk.to_vec(),
                ..Default::default()
            };
            with_timeout(self.cfg.timeout, socket.send(&msg.encode_to_vec()))
                .await
                .context("sending riemann datagram")?;
        }

        Ok(())
    }
}

impl Sink for RiemannExporter {
    fn name(&self) -> &str {
        RiemannExporter::name(self)
    }

    async fn send(&mut self, batch: &MetricBatch) -> Result<()> {
        let events = self.events(batch);
        let count = events.len();

        match self.cfg.transport {
            RiemannTransport::Tcp => {
                let msg = Msg {
                    events,
                    ..Default::default()
                };
                self.send_tcp(&msg).await?;
            }
            RiemannTransport::Udp => self.send_udp(events).await?,
        }

        tracing::debug!(events = count, "exported batch to riemann");

        Ok(())
    }
}

fn check_ack(resp: &Msg) -> Result<()> {
    if resp.ok == Some(true) {
        return Ok(());
    }
    match resp.error.as_deref() {
        Some(e) if !e.is_empty() => bail!("riemann rejected batch: {e}"),
        _ => bail!("riemann did not acknowledge batch"),
    }
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => bail!("timed out after {timeout:?}"),
    }
}

// --- Wire schema (riemann proto.proto, proto2) ---

#[derive(Clone, PartialEq, Message)]
pub struct Msg {
    #[prost(bool, optional, tag = "2")]
    pub ok: Option<bool>,
    #[prost(string, optional, tag = "3")]
    pub error: Option<String>,
    #[prost(message, repeated, tag = "6")]
    pub events: Vec<Event>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Event {
    #[prost(int64, optional, tag = "1")]
    pub time: Option<i64>,
    #[prost(string, optional, tag = "2")]
    pub state: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub service: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub host: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub description: Option<String>,
    #[prost(string, repeated, tag = "7")]
    pub tags: Vec<String>,
    #[prost(float, optional, tag = "8")]
    pub ttl: Option<f32>,
    #[prost(message, repeated, tag = "9")]
    pub attributes: Vec<Attribute>,
    #[prost(double, optional, tag = "14")]
    pub metric_d: Option<f64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Attribute {
    #[prost(string, required, tag = "1")]
    pub key: String,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}
