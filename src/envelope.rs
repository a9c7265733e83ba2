//! Firehose envelope types
//!
//! Dropsonde envelopes as they arrive over the firehose websocket, defined
//! with `prost` derives so frames decode without a build step. The nozzle
//! never mutates an envelope; it only reads the discriminator, the origin
//! and the counter name.

use crate::error::TransportError;
use prost::Message;
use std::collections::HashMap;

/// Envelope payload discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    HttpStartStop = 4,
    LogMessage = 5,
    ValueMetric = 6,
    CounterEvent = 7,
    Error = 8,
    ContainerMetric = 9,
}

/// Log stream a [`LogMessage`] was written to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LogMessageType {
    Out = 1,
    Err = 2,
}

/// A single event record from the firehose
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Component that emitted the event (e.g. "doppler")
    #[prost(string, optional, tag = "1")]
    pub origin: Option<String>,

    /// Raw [`EventType`] value
    #[prost(enumeration = "EventType", optional, tag = "2")]
    pub event_type: Option<i32>,

    /// Unix timestamp in nanoseconds
    #[prost(int64, optional, tag = "6")]
    pub timestamp: Option<i64>,

    #[prost(message, optional, tag = "8")]
    pub log_message: Option<LogMessage>,

    #[prost(message, optional, tag = "9")]
    pub value_metric: Option<ValueMetric>,

    #[prost(message, optional, tag = "10")]
    pub counter_event: Option<CounterEvent>,

    #[prost(string, optional, tag = "13")]
    pub deployment: Option<String>,

    #[prost(string, optional, tag = "14")]
    pub job: Option<String>,

    #[prost(string, optional, tag = "15")]
    pub index: Option<String>,

    #[prost(string, optional, tag = "16")]
    pub ip: Option<String>,

    #[prost(map = "string, string", tag = "17")]
    pub tags: HashMap<String, String>,
}

/// Application log line
#[derive(Clone, PartialEq, Message)]
pub struct LogMessage {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub message: Option<Vec<u8>>,

    #[prost(enumeration = "LogMessageType", optional, tag = "2")]
    pub message_type: Option<i32>,

    #[prost(int64, optional, tag = "3")]
    pub timestamp: Option<i64>,

    #[prost(string, optional, tag = "4")]
    pub app_id: Option<String>,

    #[prost(string, optional, tag = "5")]
    pub source_type: Option<String>,

    #[prost(string, optional, tag = "6")]
    pub source_instance: Option<String>,
}

/// Point-in-time metric value
#[derive(Clone, PartialEq, Message)]
pub struct ValueMetric {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,

    #[prost(double, optional, tag = "2")]
    pub value: Option<f64>,

    #[prost(string, optional, tag = "3")]
    pub unit: Option<String>,
}

/// Monotonic counter increment
#[derive(Clone, PartialEq, Message)]
pub struct CounterEvent {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,

    #[prost(uint64, optional, tag = "2")]
    pub delta: Option<u64>,

    #[prost(uint64, optional, tag = "3")]
    pub total: Option<u64>,
}

impl Envelope {
    /// Build a counter-event envelope
    pub fn counter(origin: impl Into<String>, name: impl Into<String>, delta: u64) -> Self {
        Self {
            origin: Some(origin.into()),
            event_type: Some(EventType::CounterEvent as i32),
            counter_event: Some(CounterEvent {
                name: Some(name.into()),
                delta: Some(delta),
                total: None,
            }),
            ..Default::default()
        }
    }

    /// Build a value-metric envelope
    pub fn value(
        origin: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            origin: Some(origin.into()),
            event_type: Some(EventType::ValueMetric as i32),
            value_metric: Some(ValueMetric {
                name: Some(name.into()),
                value: Some(value),
                unit: Some(unit.into()),
            }),
            ..Default::default()
        }
    }

    /// Build a stdout log-message envelope
    pub fn log(
        origin: impl Into<String>,
        app_id: impl Into<String>,
        message: impl Into<Vec<u8>>,
        timestamp: i64,
    ) -> Self {
        Self {
            origin: Some(origin.into()),
            event_type: Some(EventType::LogMessage as i32),
            timestamp: Some(timestamp),
            log_message: Some(LogMessage {
                message: Some(message.into()),
                message_type: Some(LogMessageType::Out as i32),
                timestamp: Some(timestamp),
                app_id: Some(app_id.into()),
                source_type: None,
                source_instance: None,
            }),
            ..Default::default()
        }
    }

    /// Decode one binary websocket frame
    pub fn from_frame(frame: &[u8]) -> std::result::Result<Self, TransportError> {
        Self::decode(frame).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// Encode into a binary websocket frame
    pub fn to_frame(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Event type, or `None` when absent or unknown
    pub fn kind(&self) -> Option<EventType> {
        self.event_type.and_then(|v| EventType::try_from(v).ok())
    }

    /// Counter name of a counter-event payload
    pub fn counter_name(&self) -> Option<&str> {
        self.counter_event.as_ref()?.name.as_deref()
    }
}
