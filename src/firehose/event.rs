//! Firehose envelope model.
//!
//! The traffic controller streams sonde `Envelope` protobuf messages as
//! binary websocket frames. [`WireEnvelope`] mirrors the subset of the wire
//! schema the nozzle reads; [`Envelope`] is the decoded domain value handed
//! to the aggregation loop.

use std::fmt;

use prost::Message;
use thiserror::Error;

/// Envelope event type. Values match the sonde `Envelope.EventType` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventType {
    Heartbeat = 1,
    HttpStart = 2,
    HttpStop = 3,
    HttpStartStop = 4,
    LogMessage = 5,
    ValueMetric = 6,
    CounterEvent = 7,
    Error = 8,
    ContainerMetric = 9,
}

impl EventType {
    /// Maps a raw wire value to an event type.
    pub const fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::Heartbeat),
            2 => Some(Self::HttpStart),
            3 => Some(Self::HttpStop),
            4 => Some(Self::HttpStartStop),
            5 => Some(Self::LogMessage),
            6 => Some(Self::ValueMetric),
            7 => Some(Self::CounterEvent),
            8 => Some(Self::Error),
            9 => Some(Self::ContainerMetric),
            _ => None,
        }
    }

    /// Returns the canonical name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "Heartbeat",
            Self::HttpStart => "HttpStart",
            Self::HttpStop => "HttpStop",
            Self::HttpStartStop => "HttpStartStop",
            Self::LogMessage => "LogMessage",
            Self::ValueMetric => "ValueMetric",
            Self::CounterEvent => "CounterEvent",
            Self::Error => "Error",
            Self::ContainerMetric => "ContainerMetric",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gauge reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueMetric {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

/// A counter reading. `total` is the cumulative value since the emitter started.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterEvent {
    pub name: String,
    pub delta: u64,
    pub total: u64,
}

/// Typed payload of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ValueMetric(ValueMetric),
    CounterEvent(CounterEvent),
    /// Any known event kind the nozzle does not aggregate, including a
    /// metric envelope that arrived without its payload.
    Other(EventType),
    /// An event type this schema does not know, kept as its raw wire value.
    Unknown(i32),
}

impl Event {
    /// Returns `None` for [`Event::Unknown`].
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            Self::ValueMetric(_) => Some(EventType::ValueMetric),
            Self::CounterEvent(_) => Some(EventType::CounterEvent),
            Self::Other(t) => Some(*t),
            Self::Unknown(_) => None,
        }
    }

    /// Wire value of the event type.
    pub fn raw_event_type(&self) -> i32 {
        match self {
            Self::Unknown(raw) => *raw,
            known => known.event_type().map_or(0, |t| t as i32),
        }
    }
}

/// One decoded unit from the firehose.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: String,
    /// Emission time in nanoseconds since the epoch.
    pub timestamp: i64,
    pub deployment: String,
    pub job: String,
    pub index: String,
    pub ip: String,
    pub event: Event,
}

impl Envelope {
    /// Builds a gauge envelope with empty provenance.
    pub fn value_metric(origin: &str, name: &str, value: f64, timestamp: i64) -> Self {
        Self {
            origin: origin.to_string(),
            timestamp,
            deployment: String::new(),
            job: String::new(),
            index: String::new(),
            ip: String::new(),
            event: Event::ValueMetric(ValueMetric {
                name: name.to_string(),
                value,
                unit: String::new(),
            }),
        }
    }

    /// Builds a counter envelope with empty provenance.
    pub fn counter_event(origin: &str, name: &str, delta: u64, total: u64, timestamp: i64) -> Self {
        Self {
            origin: origin.to_string(),
            timestamp,
            deployment: String::new(),
            job: String::new(),
            index: String::new(),
            ip: String::new(),
            event: Event::CounterEvent(CounterEvent {
                name: name.to_string(),
                delta,
                total,
            }),
        }
    }

    /// Sets the provenance fields.
    pub fn with_source(mut self, deployment: &str, job: &str, index: &str, ip: &str) -> Self {
        self.deployment = deployment.to_string();
        self.job = job.to_string();
        self.index = index.to_string();
        self.ip = ip.to_string();
        self
    }

    pub fn event_type(&self) -> Option<EventType> {
        self.event.event_type()
    }

    /// Decodes a binary firehose frame. Any frame that parses as an envelope
    /// decodes, whatever its event type.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let wire = WireEnvelope::decode(frame)?;
        Ok(Self::from(wire))
    }

    /// Encodes the envelope in the firehose wire format.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        WireEnvelope::from(self).encode_to_vec()
    }
}

/// Errors that can occur while decoding a firehose frame.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

impl From<WireEnvelope> for Envelope {
    fn from(wire: WireEnvelope) -> Self {
        let kind = EventType::from_i32(wire.event_type);
        let event = match (kind, wire.value_metric, wire.counter_event) {
            (Some(EventType::ValueMetric), Some(m), _) => Event::ValueMetric(ValueMetric {
                name: m.name,
                value: m.value,
                unit: m.unit,
            }),
            (Some(EventType::CounterEvent), _, Some(c)) => Event::CounterEvent(CounterEvent {
                name: c.name,
                delta: c.delta,
                total: c.total.unwrap_or(0),
            }),
            (Some(other), _, _) => Event::Other(other),
            (None, _, _) => Event::Unknown(wire.event_type),
        };

        Self {
            origin: wire.origin,
            timestamp: wire.timestamp.unwrap_or(0),
            deployment: wire.deployment.unwrap_or_default(),
            job: wire.job.unwrap_or_default(),
            index: wire.index.unwrap_or_default(),
            ip: wire.ip.unwrap_or_default(),
            event,
        }
    }
}

impl From<&Envelope> for WireEnvelope {
    fn from(e: &Envelope) -> Self {
        let (value_metric, counter_event) = match &e.event {
            Event::ValueMetric(m) => (
                Some(WireValueMetric {
                    name: m.name.clone(),
                    value: m.value,
                    unit: m.unit.clone(),
                }),
                None,
            ),
            Event::CounterEvent(c) => (
                None,
                Some(WireCounterEvent {
                    name: c.name.clone(),
                    delta: c.delta,
                    total: Some(c.total),
                }),
            ),
            Event::Other(_) | Event::Unknown(_) => (None, None),
        };

        Self {
            origin: e.origin.clone(),
            event_type: e.event.raw_event_type(),
            timestamp: Some(e.timestamp),
            value_metric,
            counter_event,
            deployment: non_empty(&e.deployment),
            job: non_empty(&e.job),
            index: non_empty(&e.index),
            ip: non_empty(&e.ip),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

// --- Wire schema (sonde events/envelope.proto, proto2) ---

#[derive(Clone, PartialEq, Message)]
pub struct WireEnvelope {
    #[prost(string, required, tag = "1")]
    pub origin: String,
    #[prost(int32, required, tag = "2")]
    pub event_type: i32,
    #[prost(int64, optional, tag = "6")]
    pub timestamp: Option<i64>,
    #[prost(message, optional, tag = "9")]
    pub value_metric: Option<WireValueMetric>,
    #[prost(message, optional, tag = "10")]
    pub counter_event: Option<WireCounterEvent>,
    #[prost(string, optional, tag = "13")]
    pub deployment: Option<String>,
    #[prost(string, optional, tag = "14")]
    pub job: Option<String>,
    #[prost(string, optional, tag = "15")]
    pub index: Option<String>,
    #[prost(string, optional, tag = "16")]
    pub ip: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireValueMetric {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(double, required, tag = "2")]
    pub value: f64,
    #[prost(string, required, tag = "3")]
    pub unit: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct WireCounterEvent {
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(uint64, required, tag = "2")]
    pub delta: u64,
    #[prost(uint64, optional, tag = "3")]
    pub total: Option<u64>,
}
