//! Event source trait — the boundary to the streaming transport
//!
//! A source opens a connection to the firehose and yields two independent
//! sequences: decoded envelopes and transport errors. The consumer and the
//! detector only ever see this trait, so the websocket client can be swapped
//! for the in-memory feed in tests.

use crate::envelope::Envelope;
use crate::error::{NozzleError, Result, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod memory;
pub mod websocket;

/// Output of a started source
#[derive(Debug)]
pub struct SourceStreams {
    pub events: mpsc::Receiver<Envelope>,
    pub errors: mpsc::Receiver<TransportError>,
}

/// Core trait for firehose connections
///
/// `start` must be called from within a tokio runtime. Once `token` is
/// cancelled the source must drop the underlying connection and close both
/// sequences.
pub trait EventSource: Send + Sync {
    /// Open the connection and start producing
    fn start(&mut self, token: CancellationToken) -> Result<SourceStreams>;

    /// Stop the connection opened by the last `start`
    fn close(&mut self) -> Result<()>;

    /// Source name (e.g. "websocket", "memory")
    fn name(&self) -> &str;
}

/// Tracks the token of the running connection for `close`
#[derive(Debug, Default)]
pub(crate) struct RunState {
    token: Option<CancellationToken>,
}

impl RunState {
    /// Derive the connection token from the caller's token
    pub(crate) fn begin(&mut self, parent: &CancellationToken) -> CancellationToken {
        if let Some(prev) = self.token.take() {
            prev.cancel();
        }
        let token = parent.child_token();
        self.token = Some(token.clone());
        token
    }

    pub(crate) fn end(&mut self, source: &str) -> Result<()> {
        match &self.token {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(NozzleError::NotRunning(format!(
                "{} source was never started",
                source
            ))),
        }
    }
}

/// Fail with a field-specific message when `value` is empty
pub(crate) fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(NozzleError::Config(format!("{} must not be empty", field)));
    }
    Ok(())
}
