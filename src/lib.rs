//! # firehose-nozzle
//!
//! Firehose consumer with slow-consumer detection.
//!
//! ## Overview
//!
//! `firehose-nozzle` connects to a Doppler firehose, decodes the envelopes it
//! pushes and watches the stream for signs that the consumer is falling
//! behind. Events and transport errors reach the application unmodified;
//! slow-consumer alerts arrive on a separate channel.
//!
//! ## Quick Start
//!
//! ```rust
//! use firehose_nozzle::{Consumer, Envelope, MemorySource};
//!
//! # async fn example() -> firehose_nozzle::Result<()> {
//! // In-memory source; production code uses `Consumer::connect(config)`
//! let (source, feed) = MemorySource::new(16);
//! let mut consumer = Consumer::new(source);
//! consumer.start()?;
//!
//! let mut events = consumer.events().expect("consumer started");
//! let mut alerts = consumer.alerts().expect("consumer started");
//!
//! feed.send_event(Envelope::counter("doppler", "TruncatingBuffer.DroppedMessages", 12)).await;
//!
//! let envelope = events.recv().await;
//! let alert = alerts.recv().await;
//! println!("{:?} / {:?}", envelope, alert);
//!
//! consumer.close()
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **EventSource** trait — websocket firehose client or in-memory feed
//! - **SlowDetector** trait — forwards events/errors, raises alerts
//! - **Consumer** — owns the cancellation token and exposes the three channels
//! - **TokenFetcher** trait — static token or UAA client-credentials grant

pub mod config;
pub mod consumer;
pub mod detector;
pub mod envelope;
pub mod error;
mod pipe;
pub mod source;
pub mod token;

// Re-export core types
pub use config::Config;
pub use consumer::Consumer;
pub use detector::{
    is_policy_violation, is_truncated, DefaultSlowDetector, DetectorStreams, SlowConsumerAlert,
    SlowDetector, CLOSE_POLICY_VIOLATION, TRUNCATION_COUNTER, TRUNCATION_ORIGIN,
};
pub use envelope::{CounterEvent, Envelope, EventType, LogMessage, LogMessageType, ValueMetric};
pub use error::{NozzleError, Result, TransportError};
pub use source::{EventSource, SourceStreams};
pub use token::{mask_secret, StaticToken, TokenFetcher, UaaTokenFetcher, MASKED};

// Re-export sources for convenience
pub use source::memory::{MemoryFeed, MemorySource};
pub use source::websocket::WebSocketSource;
