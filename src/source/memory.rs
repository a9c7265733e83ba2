//! In-memory event source
//!
//! Stands in for the firehose in tests and single-process use. A
//! [`MemoryFeed`] pushes envelopes and errors; every `start` pumps that feed
//! into fresh output channels until the start's token fires, so a restarted
//! consumer keeps reading the same feed.

use super::{EventSource, RunState, SourceStreams};
use crate::envelope::Envelope;
use crate::error::{Result, TransportError};
use crate::pipe::{recv_or_cancel, send_or_cancel};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

/// Default capacity of feed and output channels
const DEFAULT_CAPACITY: usize = 64;

/// In-memory source fed by a [`MemoryFeed`]
pub struct MemorySource {
    events: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    errors: Arc<Mutex<mpsc::Receiver<TransportError>>>,
    capacity: usize,
    state: RunState,
}

/// Producer half of a [`MemorySource`]
#[derive(Debug, Clone)]
pub struct MemoryFeed {
    events: mpsc::Sender<Envelope>,
    errors: mpsc::Sender<TransportError>,
}

impl MemorySource {
    /// Create a source and its feed; channels hold `capacity` items
    pub fn new(capacity: usize) -> (Self, MemoryFeed) {
        let capacity = capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::channel(capacity);

        let source = Self {
            events: Arc::new(Mutex::new(events_rx)),
            errors: Arc::new(Mutex::new(errors_rx)),
            capacity,
            state: RunState::default(),
        };
        let feed = MemoryFeed {
            events: events_tx,
            errors: errors_tx,
        };
        (source, feed)
    }

    /// Create a source with the default capacity
    pub fn with_default_capacity() -> (Self, MemoryFeed) {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryFeed {
    /// Push an envelope; returns false once the source is gone
    pub async fn send_event(&self, envelope: Envelope) -> bool {
        self.events.send(envelope).await.is_ok()
    }

    /// Push a transport error; returns false once the source is gone
    pub async fn send_error(&self, err: TransportError) -> bool {
        self.errors.send(err).await.is_ok()
    }
}

impl EventSource for MemorySource {
    fn start(&mut self, token: CancellationToken) -> Result<SourceStreams> {
        let token = self.state.begin(&token);
        let (events_tx, events_rx) = mpsc::channel(self.capacity);
        let (errors_tx, errors_rx) = mpsc::channel(self.capacity);

        tokio::spawn(pump(self.events.clone(), events_tx, token.clone()).with_current_subscriber());
        tokio::spawn(pump(self.errors.clone(), errors_tx, token).with_current_subscriber());

        tracing::debug!(capacity = self.capacity, "Memory source started");

        Ok(SourceStreams {
            events: events_rx,
            errors: errors_rx,
        })
    }

    fn close(&mut self) -> Result<()> {
        self.state.end("memory")
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Relay feed items to one start's output until cancelled.
///
/// The feed receiver is shared across starts; a previous start's pump holds
/// it until that start is cancelled.
async fn pump<T: Send + 'static>(
    feed: Arc<Mutex<mpsc::Receiver<T>>>,
    output: mpsc::Sender<T>,
    token: CancellationToken,
) {
    let mut feed = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        guard = feed.lock_owned() => guard,
    };

    while let Some(item) = recv_or_cancel(&mut feed, &token).await {
        if !send_or_cancel(&output, item, &token).await {
            break;
        }
    }
}
