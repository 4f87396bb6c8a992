//! Per-window accumulation of firehose metrics.
//!
//! The [`Aggregator`] is owned by the nozzle loop and is never shared
//! across tasks. Between flushes it collapses envelopes into one
//! [`MetricSeries`] per [`MetricKey`]; at flush time it appends the nozzle's
//! own self-metrics and hands the whole map over as a [`MetricBatch`].

pub mod metric;

use std::collections::hash_map::Entry;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

pub use self::metric::{Label, MetricBatch, MetricKey, MetricKind, MetricSeries, Point};

use crate::firehose::event::Envelope;
use self::metric::{envelope_labels, envelope_value, truncate_to_seconds};

/// Lifetime count of decoded envelopes, aggregated or not.
pub const TOTAL_MESSAGES_RECEIVED: &str = "totalMessagesReceived";
/// Lifetime count of points handed to a successful send.
pub const TOTAL_METRICS_SENT: &str = "totalMetricsSent";
/// 1 when a slow consumer was detected during the window, 0 otherwise.
pub const SLOW_CONSUMER_ALERT: &str = "slowConsumerAlert";

/// Accumulates envelopes into metric series for one flush window.
#[derive(Debug)]
pub struct Aggregator {
    series: MetricBatch,
    deployment: String,
    ip: String,
    total_messages_received: u64,
    total_metrics_sent: u64,
    slow_consumer: bool,
}

impl Aggregator {
    /// Creates an aggregator whose self-metrics carry the given nozzle
    /// deployment name and address.
    pub fn new(deployment: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            series: MetricBatch::new(),
            deployment: deployment.into(),
            ip: ip.into(),
            total_messages_received: 0,
            total_metrics_sent: 0,
            slow_consumer: false,
        }
    }

    /// Counts the envelope and, for gauges and counters, appends one point
    /// to its series. The series labels are replaced by the envelope's.
    pub fn ingest(&mut self, envelope: &Envelope) {
        self.total_messages_received += 1;

        let Some(key) = MetricKey::from_envelope(envelope) else {
            return;
        };
        let Some(value) = envelope_value(envelope) else {
            return;
        };

        let point = Point {
            timestamp: truncate_to_seconds(envelope.timestamp),
            value,
        };
        let labels = envelope_labels(envelope);

        match self.series.entry(key) {
            Entry::Occupied(mut e) => {
                let series = e.get_mut();
                series.labels = labels;
                series.points.push(point);
            }
            Entry::Vacant(e) => {
                e.insert(MetricSeries::single(labels, point));
            }
        }
    }

    /// Raises the slow consumer alert for the current window.
    pub fn mark_slow_consumer(&mut self) {
        self.slow_consumer = true;
    }

    /// Adds the self-metrics and takes the accumulated map, leaving an empty
    /// one behind. The slow consumer alert is cleared for the next window.
    pub fn snapshot_and_reset(&mut self) -> MetricBatch {
        let now = unix_now();
        let alert = if self.slow_consumer { 1.0 } else { 0.0 };

        self.put_internal(TOTAL_MESSAGES_RECEIVED, self.total_messages_received as f64, now);
        self.put_internal(TOTAL_METRICS_SENT, self.total_metrics_sent as f64, now);
        self.put_internal(SLOW_CONSUMER_ALERT, alert, now);
        self.slow_consumer = false;

        std::mem::take(&mut self.series)
    }

    /// Merges a batch whose send failed back into the current window.
    ///
    /// The restored points precede anything ingested since the snapshot, and
    /// labels of newer ingests win. Self-metric series are regenerated on the
    /// next snapshot and are not restored, except that a raised alert stays
    /// raised.
    pub fn restore(&mut self, batch: MetricBatch) {
        let mut restored = 0usize;

        for (key, mut failed) in batch.into_inner() {
            if key.is_internal() {
                if key.name == SLOW_CONSUMER_ALERT
                    && failed.points.iter().any(|p| p.value > 0.0)
                {
                    self.slow_consumer = true;
                }
                continue;
            }

            restored += failed.points.len();
            match self.series.entry(key) {
                Entry::Occupied(mut e) => {
                    let current = e.get_mut();
                    failed.points.append(&mut current.points);
                    current.points = failed.points;
                }
                Entry::Vacant(e) => {
                    e.insert(failed);
                }
            }
        }

        debug!(points = restored, "restored unsent points");
    }

    /// Records a successful send of `points` points.
    pub fn record_sent(&mut self, points: usize) {
        self.total_metrics_sent += points as u64;
    }

    pub fn total_messages_received(&self) -> u64 {
        self.total_messages_received
    }

    pub fn total_metrics_sent(&self) -> u64 {
        self.total_metrics_sent
    }

    pub fn is_slow_consumer(&self) -> bool {
        self.slow_consumer
    }

    /// Series accumulated in the current window.
    pub fn pending(&self) -> &MetricBatch {
        &self.series
    }

    fn put_internal(&mut self, name: &str, value: f64, timestamp: i64) {
        let key = MetricKey::internal(name, &self.deployment, &self.ip);
        let labels = vec![
            Label::new("ip", self.ip.as_str()),
            Label::new("deployment", self.deployment.as_str()),
        ];
        self.series
            .insert(key, MetricSeries::single(labels, Point { timestamp, value }));
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firehose::event::{Event, EventType};

    const SECOND: i64 = 1_000_000_000;

    fn gauge(name: &str, value: f64, ts: i64) -> Envelope {
        Envelope::value_metric("origin", name, value, ts)
            .with_source("cf", "router", "0", "10.0.0.1")
    }

    fn internal_value(batch: &MetricBatch, name: &str) -> f64 {
        let (_, series) = batch.find(name).expect("internal series present");
        assert_eq!(series.points.len(), 1);
        series.points[0].value
    }

    #[test]
    fn test_ingest_same_key_appends_points_in_order() {
        let mut agg = Aggregator::new("nozzle", "127.0.0.1");
        for i in 0..5 {
            agg.ingest(&gauge("cpu", i as f64, (1000 + i) * SECOND + 500));
        }

        let batch = agg.snapshot_and_reset();
        let (key, series) = batch.find("origin.cpu").expect("series");

        assert_eq!(key.kind, MetricKind::Gauge);
        assert_eq!(series.points.len(), 5);
        for (i, p) in series.points.iter().enumerate() {
            assert_eq!(p.value, i as f64);
            assert_eq!(p.timestamp, 1000 + i as i64);
        }
    }

    #[test]
    fn test_ingest_keeps_points_with_equal_seconds() {
        let mut agg = Aggregator::new("nozzle", "127.0.0.1");
        agg.ingest(&gauge("cpu", 1.0, 10 * SECOND));
        agg.ingest(&gauge("cpu", 2.0, 10 * SECOND + 999));

        let batch = agg.snapshot_and_reset();
        let (_, series) = batch.find("origin.cpu").expect("series");
        assert_eq!(series.points.len(), 2);
        assert!(series.points.iter().all(|p| p.timestamp == 10));
    }

    #[test]
    fn test_ingest_other_kind_counts_but_adds_no_series() {
        let mut agg = Aggregator::new("nozzle", "127.0.0.1");
        let mut env = gauge("log", 0.0, 0);
        env.event = Event::Other(EventType::LogMessage);

        agg.ingest(&env);

        assert_eq!(agg.total_messages_received(), 1);
        assert!(agg.pending().is_empty());
    }

    #[test]
    fn test_ingest_labels_last_write_wins() {
        let mut agg = Aggregator::new("nozzle", "127.0.0.1");
        let env = Envelope::value_metric("o", "n", 1.0, 0).with_source("cf", "", "", "");
        let key = MetricKey::from_envelope(&env).expect("key");

        // Provenance is part of the key, so plant a stale label directly.
        agg.ingest(&env);
        agg.series
            .entry(key.clone())
            .and_modify(|s| s.labels.push(Label::new("job", "stale")));
        agg.ingest(&env);

        let series = agg.pending().get(&key).expect("series");
        assert_eq!(series.labels, vec![Label::new("deployment", "cf")]);
        assert_eq!(series.points.len(), 2);
    }

    #[test]
    fn test_counter_contributes_total() {
        let mut agg = Aggregator::new("nozzle", "127.0.0.1");
        agg.ingest(&Envelope::counter_event("rep", "requests", 5, 42, 3 * SECOND));

        let batch = agg.snapshot_and_reset();
        let (key, series) = batch.find("rep.requests").expect("series");
        assert_eq!(key.kind, MetricKind::Counter);
        assert_eq!(series.points, vec![Point { timestamp: 3, value: 42.0 }]);
    }

    #[test]
    fn test_empty_cycle_has_three_self_metrics() {
        let mut agg = Aggregator::new("nozzle", "10.1.1.1");
        let batch = agg.snapshot_and_reset();

        assert_eq!(batch.len(), 3);
        assert_eq!(internal_value(&batch, TOTAL_MESSAGES_RECEIVED), 0.0);
        assert_eq!(internal_value(&batch, TOTAL_METRICS_SENT), 0.0);
        assert_eq!(internal_value(&batch, SLOW_CONSUMER_ALERT), 0.0);

        let (key, series) = batch.find(SLOW_CONSUMER_ALERT).expect("series");
        assert!(key.is_internal());
        assert_eq!(key.deployment, "nozzle");
        assert_eq!(key.ip, "10.1.1.1");
        assert_eq!(
            series.labels,
            vec![Label::new("ip", "10.1.1.1"), Label::new("deployment", "nozzle")]
        );
    }

    #[test]
    fn test_snapshot_resets_map() {
        let mut agg = Aggregator::new("nozzle", "127.0.0.1");
        agg.ingest(&gauge("cpu", 1.0, 0));

        assert_eq!(agg.snapshot_and_reset().len(), 4);
        assert!(agg.pending().is_empty());
        assert_eq!(agg.snapshot_and_reset().len(), 3);
    }

    #[test]
    fn test_record_sent_feeds_next_cycle() {
        let mut agg = Aggregator::new("nozzle", "127.0.0.1");
        agg.ingest(&gauge("cpu", 1.0, 0));
        agg.ingest(&gauge("mem", 1.0, 0));

        let batch = agg.snapshot_and_reset();
        agg.record_sent(batch.point_count());

        let next = agg.snapshot_and_reset();
        assert_eq!(internal_value(&next, TOTAL_METRICS_SENT), 5.0);
        assert_eq!(internal_value(&next, TOTAL_MESSAGES_RECEIVED), 2.0);
    }

    #[test]
    fn test_slow_consumer_alert_lasts_one_cycle() {
        let mut agg = Aggregator::new("nozzle", "127.0.0.1");
        agg.mark_slow_consumer();
        agg.mark_slow_consumer();

        let first = agg.snapshot_and_reset();
        assert_eq!(internal_value(&first, SLOW_CONSUMER_ALERT), 1.0);

        let second = agg.snapshot_and_reset();
        assert_eq!(internal_value(&second, SLOW_CONSUMER_ALERT), 0.0);
    }

    #[test]
    fn test_restore_puts_failed_points_first() {
        let mut agg = Aggregator::new("nozzle", "127.0.0.1");
        agg.ingest(&gauge("cpu", 1.0, SECOND));
        let failed = agg.snapshot_and_reset();

        agg.ingest(&gauge("cpu", 2.0, 2 * SECOND));
        agg.ingest(&gauge("mem", 3.0, 2 * SECOND));
        agg.restore(failed);

        let batch = agg.snapshot_and_reset();
        assert_eq!(batch.len(), 5);

        let (_, cpu) = batch.find("origin.cpu").expect("cpu");
        let values: Vec<f64> = cpu.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
        assert_eq!(internal_value(&batch, TOTAL_MESSAGES_RECEIVED), 3.0);
    }

    #[test]
    fn test_restore_keeps_raised_alert() {
        let mut agg = Aggregator::new("nozzle", "127.0.0.1");
        agg.mark_slow_consumer();
        let failed = agg.snapshot_and_reset();
        assert!(!agg.is_slow_consumer());

        agg.restore(failed);
        assert!(agg.is_slow_consumer());
        assert!(agg.pending().is_empty());
    }
}
