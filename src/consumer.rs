//! Consumer — the application-facing pipeline
//!
//! `Consumer` owns the cancellation token, starts an [`EventSource`], wires
//! its output through a [`SlowDetector`] and hands the resulting events,
//! alerts and errors to the application.

use crate::config::Config;
use crate::detector::{DefaultSlowDetector, DetectorStreams, SlowConsumerAlert, SlowDetector};
use crate::envelope::Envelope;
use crate::error::{NozzleError, Result, TransportError};
use crate::source::websocket::WebSocketSource;
use crate::source::EventSource;
use crate::token::mask_secret;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Firehose consumer with slow-consumer detection
///
/// ```no_run
/// # async fn example() -> firehose_nozzle::Result<()> {
/// use firehose_nozzle::{Config, Consumer};
///
/// let config = Config::new("wss://doppler.example.com:443", "my-nozzle")
///     .with_uaa("https://uaa.example.com", "admin", "secret");
/// let mut consumer = Consumer::connect(config).await?;
/// consumer.start()?;
///
/// let mut events = consumer.events().expect("started");
/// while let Some(envelope) = events.recv().await {
///     println!("{:?}", envelope.kind());
/// }
/// consumer.close()
/// # }
/// ```
pub struct Consumer {
    source: Box<dyn EventSource>,
    detector: Box<dyn SlowDetector>,
    dispatch: Option<tracing::Dispatch>,

    /// Token of the running pipeline
    cancel: Option<CancellationToken>,

    events: Option<mpsc::Receiver<Envelope>>,
    alerts: Option<mpsc::UnboundedReceiver<SlowConsumerAlert>>,
    errors: Option<mpsc::Receiver<TransportError>>,
}

impl Consumer {
    /// Create a consumer over any source with the default detector
    pub fn new(source: impl EventSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            detector: Box::new(DefaultSlowDetector::default()),
            dispatch: None,
            cancel: None,
            events: None,
            alerts: None,
            errors: None,
        }
    }

    /// Validate `config`, obtain a token and build the websocket pipeline
    ///
    /// The token is fetched once here; the consumer does not refresh it.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        tracing::debug!(config = ?config, "Constructing firehose consumer");

        let token = config.token_fetcher()?.fetch().await?;
        tracing::info!(token = %mask_secret(&token), "Using firehose token");

        let source = WebSocketSource::new(&config.doppler_addr, token, &config.subscription_id)?
            .with_insecure(config.insecure)
            .with_capacity(config.channel_capacity);

        let mut consumer = Self::new(source)
            .with_detector(DefaultSlowDetector::new(config.channel_capacity));
        consumer.dispatch = config.dispatch;
        Ok(consumer)
    }

    /// Replace the detector
    pub fn with_detector(mut self, detector: impl SlowDetector + 'static) -> Self {
        self.detector = Box::new(detector);
        self
    }

    /// Route the pipeline's logs to `dispatch`
    pub fn with_dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Name of the underlying source
    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// True between `start` and `close`
    ///
    /// This tracks the consumer's own lifecycle, not the connection. When the
    /// source ends on its own (peer closure, EOF) this stays `true` until
    /// `close`; the receivers returning `None` is the signal for that case.
    pub fn is_running(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Start consuming and detecting
    ///
    /// A pipeline that is still running is cancelled first; receivers taken
    /// from it close.
    pub fn start(&mut self) -> Result<()> {
        match self.dispatch.clone() {
            Some(dispatch) => tracing::dispatcher::with_default(&dispatch, || self.start_pipeline()),
            None => self.start_pipeline(),
        }
    }

    fn start_pipeline(&mut self) -> Result<()> {
        if let Some(prev) = self.cancel.take() {
            if !prev.is_cancelled() {
                tracing::info!("Cancelling running pipeline before restart");
                prev.cancel();
            }
        }

        let token = CancellationToken::new();
        let source = match self.source.start(token.clone()) {
            Ok(streams) => streams,
            Err(e) => {
                token.cancel();
                return Err(e);
            }
        };

        let DetectorStreams {
            events,
            errors,
            alerts,
        } = self.detector.detect(token.clone(), source.events, source.errors);

        self.events = Some(events);
        self.alerts = Some(alerts);
        self.errors = Some(errors);
        self.cancel = Some(token);

        tracing::info!(source = self.source.name(), "Consumer started");
        Ok(())
    }

    /// Stop the source and the detector
    ///
    /// Fails when the consumer was never started or is already closed.
    pub fn close(&mut self) -> Result<()> {
        let token = match &self.cancel {
            Some(token) if !token.is_cancelled() => token,
            Some(_) => {
                return Err(NozzleError::NotRunning("consumer already closed".to_string()))
            }
            None => {
                return Err(NozzleError::NotRunning("consumer was never started".to_string()))
            }
        };

        token.cancel();
        tracing::info!(source = self.source.name(), "Consumer closed");
        self.source.close()
    }

    /// Take the envelope receiver of the current pipeline
    ///
    /// Returns `None` before `start` or once taken.
    pub fn events(&mut self) -> Option<mpsc::Receiver<Envelope>> {
        self.events.take()
    }

    /// Take the slow-consumer alert receiver of the current pipeline
    ///
    /// The alert channel is unbounded so detection never stalls forwarding.
    /// Alerts queue until read: drain this receiver, or drop it to discard
    /// them, or memory grows by one entry per alert.
    pub fn alerts(&mut self) -> Option<mpsc::UnboundedReceiver<SlowConsumerAlert>> {
        self.alerts.take()
    }

    /// Take the transport error receiver of the current pipeline
    pub fn errors(&mut self) -> Option<mpsc::Receiver<TransportError>> {
        self.errors.take()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(token) = &self.cancel {
            token.cancel();
        }
    }
}
