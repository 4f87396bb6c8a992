use std::collections::hash_map;
use std::collections::HashMap;
use std::fmt;

use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};

use crate::firehose::event::{Envelope, Event};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Which stream a series aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Firehose `ValueMetric` envelopes.
    Gauge,
    /// Firehose `CounterEvent` envelopes; values are cumulative totals.
    Counter,
    /// Self-observability series generated by the nozzle.
    Internal,
}

impl MetricKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
            Self::Internal => "internal",
        }
    }
}

/// Aggregation identity. Two envelopes share a series iff every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub kind: MetricKind,
    /// `origin + "." + name` for firehose metrics.
    pub name: String,
    pub deployment: String,
    pub job: String,
    pub index: String,
    pub ip: String,
}

impl MetricKey {
    /// Derives the key for an envelope. Returns `None` for event kinds that
    /// are not aggregated.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        let (kind, name) = match &envelope.event {
            Event::ValueMetric(m) => (MetricKind::Gauge, m.name.as_str()),
            Event::CounterEvent(c) => (MetricKind::Counter, c.name.as_str()),
            Event::Other(_) | Event::Unknown(_) => return None,
        };

        Some(Self {
            kind,
            name: qualified_name(&envelope.origin, name),
            deployment: envelope.deployment.clone(),
            job: envelope.job.clone(),
            index: envelope.index.clone(),
            ip: envelope.ip.clone(),
        })
    }

    /// Key of a nozzle self-metric.
    pub fn internal(name: &str, deployment: &str, ip: &str) -> Self {
        Self {
            kind: MetricKind::Internal,
            name: name.to_string(),
            deployment: deployment.to_string(),
            job: String::new(),
            index: String::new(),
            ip: ip.to_string(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.kind == MetricKind::Internal
    }
}

/// One sample, at one-second resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Seconds since the epoch.
    pub timestamp: i64,
    pub value: f64,
}

/// Serialized as `[timestamp, value]`.
impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.timestamp)?;
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

/// A provenance label attached to every point of a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub key: &'static str,
    pub value: String,
}

impl Label {
    pub fn new(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Points accumulated for one key within a flush window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSeries {
    pub labels: Vec<Label>,
    pub points: Vec<Point>,
}

impl MetricSeries {
    /// A series holding a single point.
    pub fn single(labels: Vec<Label>, point: Point) -> Self {
        Self {
            labels,
            points: vec![point],
        }
    }
}

/// The aggregation map handed to a sink at flush time.
#[derive(Debug, Clone, Default)]
pub struct MetricBatch {
    series: HashMap<MetricKey, MetricSeries>,
}

impl MetricBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of series in the batch.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Number of points across all series.
    pub fn point_count(&self) -> usize {
        self.series.values().map(|s| s.points.len()).sum()
    }

    pub fn get(&self, key: &MetricKey) -> Option<&MetricSeries> {
        self.series.get(key)
    }

    /// Finds the first series with the given name.
    pub fn find(&self, name: &str) -> Option<(&MetricKey, &MetricSeries)> {
        self.series.iter().find(|(key, _)| key.name == name)
    }

    pub fn iter(&self) -> hash_map::Iter<'_, MetricKey, MetricSeries> {
        self.series.iter()
    }

    pub(crate) fn contains_key(&self, key: &MetricKey) -> bool {
        self.series.contains_key(key)
    }

    pub(crate) fn entry(&mut self, key: MetricKey) -> hash_map::Entry<'_, MetricKey, MetricSeries> {
        self.series.entry(key)
    }

    pub(crate) fn insert(&mut self, key: MetricKey, series: MetricSeries) {
        self.series.insert(key, series);
    }

    pub(crate) fn into_inner(self) -> HashMap<MetricKey, MetricSeries> {
        self.series
    }
}

impl<'a> IntoIterator for &'a MetricBatch {
    type Item = (&'a MetricKey, &'a MetricSeries);
    type IntoIter = hash_map::Iter<'a, MetricKey, MetricSeries>;

    fn into_iter(self) -> Self::IntoIter {
        self.series.iter()
    }
}

/// Joins origin and metric name into the series name.
pub fn qualified_name(origin: &str, name: &str) -> String {
    let mut out = String::with_capacity(origin.len() + name.len() + 1);
    out.push_str(origin);
    out.push('.');
    out.push_str(name);
    out
}

/// Truncates a nanosecond timestamp to whole seconds.
pub fn truncate_to_seconds(timestamp_ns: i64) -> i64 {
    timestamp_ns / NANOS_PER_SECOND
}

/// The numeric value an envelope contributes. Counters contribute their total.
pub fn envelope_value(envelope: &Envelope) -> Option<f64> {
    match &envelope.event {
        Event::ValueMetric(m) => Some(m.value),
        Event::CounterEvent(c) => Some(c.total as f64),
        Event::Other(_) | Event::Unknown(_) => None,
    }
}

/// Provenance labels of an envelope. Empty fields are left out.
pub fn envelope_labels(envelope: &Envelope) -> Vec<Label> {
    let mut labels = Vec::with_capacity(4);
    push_if_not_empty(&mut labels, "deployment", &envelope.deployment);
    push_if_not_empty(&mut labels, "job", &envelope.job);
    push_if_not_empty(&mut labels, "index", &envelope.index);
    push_if_not_empty(&mut labels, "ip", &envelope.ip);
    labels
}

fn push_if_not_empty(labels: &mut Vec<Label>, key: &'static str, value: &str) {
    if !value.is_empty() {
        labels.push(Label::new(key, value));
    }
}
