//! Slow-consumer detection
//!
//! The detector sits between an [`EventSource`](crate::source::EventSource)
//! and the application. It forwards envelopes and transport errors
//! unmodified and in order, and raises a [`SlowConsumerAlert`] on a third
//! channel whenever the upstream signals that this consumer cannot keep up.
//!
//! Two signals are recognized:
//!
//! - a `TruncatingBuffer.DroppedMessages` counter emitted by `doppler`,
//!   meaning the router dropped messages queued for us
//! - a websocket closure with code 1008 (policy violation), meaning the
//!   router gave up on the connection because we were too slow

use crate::envelope::{Envelope, EventType};
use crate::error::TransportError;
use crate::pipe::{recv_or_cancel, send_or_cancel};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

/// Origin of the truncation counter
pub const TRUNCATION_ORIGIN: &str = "doppler";

/// Counter name the router emits when it drops queued messages
pub const TRUNCATION_COUNTER: &str = "TruncatingBuffer.DroppedMessages";

/// Websocket close code for "policy violation"
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Signal that the consumer is falling behind the firehose
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlowConsumerAlert {
    /// The router reported dropping messages queued for this consumer
    #[error("Upstream dropped {dropped} queued messages: consumer is too slow")]
    DroppedMessages { dropped: u64 },

    /// The router closed the connection with a policy violation
    #[error("Upstream closed the connection with policy violation: consumer is too slow")]
    PolicyViolation { reason: String },
}

/// The three sequences a detector hands downstream
#[derive(Debug)]
pub struct DetectorStreams {
    /// Envelopes, forwarded unmodified
    pub events: mpsc::Receiver<Envelope>,
    /// Transport errors, forwarded unmodified
    pub errors: mpsc::Receiver<TransportError>,
    /// Slow-consumer alerts
    pub alerts: mpsc::UnboundedReceiver<SlowConsumerAlert>,
}

/// Pipe stage that inspects the firehose for slow-consumer signals
///
/// Implementations must forward every input item unmodified and in order,
/// and must close each output as soon as `token` is cancelled, without
/// waiting for any other output to be drained.
pub trait SlowDetector: Send + Sync {
    fn detect(
        &self,
        token: CancellationToken,
        events: mpsc::Receiver<Envelope>,
        errors: mpsc::Receiver<TransportError>,
    ) -> DetectorStreams;
}

/// Default detector: one forwarding task per input plus an alert relay
#[derive(Debug, Clone)]
pub struct DefaultSlowDetector {
    capacity: usize,
}

impl DefaultSlowDetector {
    /// Create a detector whose forwarded channels hold `capacity` items
    ///
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

impl Default for DefaultSlowDetector {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SlowDetector for DefaultSlowDetector {
    fn detect(
        &self,
        token: CancellationToken,
        events: mpsc::Receiver<Envelope>,
        errors: mpsc::Receiver<TransportError>,
    ) -> DetectorStreams {
        tracing::info!(capacity = self.capacity, "Start detecting slow consumer alerts");

        let (events_tx, events_rx) = mpsc::channel(self.capacity);
        let (errors_tx, errors_rx) = mpsc::channel(self.capacity);
        let (detect_tx, detect_rx) = mpsc::unbounded_channel();
        let (alerts_tx, alerts_rx) = mpsc::unbounded_channel();

        tokio::spawn(
            forward_events(events, events_tx, detect_tx.clone(), token.clone())
                .with_current_subscriber(),
        );
        tokio::spawn(
            forward_errors(errors, errors_tx, detect_tx, token.clone()).with_current_subscriber(),
        );
        tokio::spawn(relay_alerts(detect_rx, alerts_tx, token).with_current_subscriber());

        DetectorStreams {
            events: events_rx,
            errors: errors_rx,
            alerts: alerts_rx,
        }
    }
}

async fn forward_events(
    mut input: mpsc::Receiver<Envelope>,
    output: mpsc::Sender<Envelope>,
    detect: mpsc::UnboundedSender<SlowConsumerAlert>,
    token: CancellationToken,
) {
    while let Some(envelope) = recv_or_cancel(&mut input, &token).await {
        if is_truncated(&envelope) {
            let dropped = envelope
                .counter_event
                .as_ref()
                .and_then(|c| c.delta)
                .unwrap_or_default();
            tracing::warn!(dropped, "Upstream dropped messages for this consumer");
            let _ = detect.send(SlowConsumerAlert::DroppedMessages { dropped });
        }

        if !send_or_cancel(&output, envelope, &token).await {
            break;
        }
    }

    tracing::info!("Closing event channel");
}

async fn forward_errors(
    mut input: mpsc::Receiver<TransportError>,
    output: mpsc::Sender<TransportError>,
    detect: mpsc::UnboundedSender<SlowConsumerAlert>,
    token: CancellationToken,
) {
    while let Some(err) = recv_or_cancel(&mut input, &token).await {
        if is_policy_violation(&err) {
            let reason = match &err {
                TransportError::Closed { reason, .. } => reason.clone(),
                _ => String::new(),
            };
            tracing::warn!(%reason, "Upstream closed the connection: consumer too slow");
            let _ = detect.send(SlowConsumerAlert::PolicyViolation { reason });
        }

        if !send_or_cancel(&output, err, &token).await {
            break;
        }
    }

    tracing::info!("Closing error channel");
}

/// Owns the alert output so it closes on cancel regardless of the forwarders.
async fn relay_alerts(
    mut detect: mpsc::UnboundedReceiver<SlowConsumerAlert>,
    alerts: mpsc::UnboundedSender<SlowConsumerAlert>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                // Alerts raised before the cancel still reach the reader.
                while let Ok(alert) = detect.try_recv() {
                    let _ = alerts.send(alert);
                }
                break;
            }
            alert = detect.recv() => match alert {
                Some(alert) => {
                    if alerts.send(alert).is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    tracing::info!("Closing alert channel");
}

/// True for the router's dropped-messages counter
pub fn is_truncated(envelope: &Envelope) -> bool {
    envelope.kind() == Some(EventType::CounterEvent)
        && envelope.counter_name() == Some(TRUNCATION_COUNTER)
        && envelope.origin.as_deref() == Some(TRUNCATION_ORIGIN)
}

/// True for a closure with the policy-violation code
pub fn is_policy_violation(err: &TransportError) -> bool {
    err.close_code() == Some(CLOSE_POLICY_VIOLATION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(3);

    fn truncated() -> Envelope {
        Envelope::counter(TRUNCATION_ORIGIN, TRUNCATION_COUNTER, 5)
    }

    fn policy_close() -> TransportError {
        TransportError::Closed {
            code: CLOSE_POLICY_VIOLATION,
            reason: "slow".to_string(),
        }
    }

    fn start() -> (
        mpsc::Sender<Envelope>,
        mpsc::Sender<TransportError>,
        DetectorStreams,
        CancellationToken,
    ) {
        let (events_tx, events_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let streams = DefaultSlowDetector::default().detect(token.clone(), events_rx, errors_rx);
        (events_tx, errors_tx, streams, token)
    }

    #[test]
    fn test_is_truncated() {
        assert!(is_truncated(&truncated()));
        assert!(!is_truncated(&Envelope::default()));
        assert!(!is_truncated(&Envelope::counter("metron", TRUNCATION_COUNTER, 1)));
        assert!(!is_truncated(&Envelope::counter(TRUNCATION_ORIGIN, "Other.Counter", 1)));
        assert!(!is_truncated(&Envelope::value(
            TRUNCATION_ORIGIN,
            TRUNCATION_COUNTER,
            1.0,
            "count"
        )));
    }

    #[test]
    fn test_counter_type_without_payload_never_matches() {
        let env = Envelope {
            origin: Some(TRUNCATION_ORIGIN.to_string()),
            event_type: Some(EventType::CounterEvent as i32),
            ..Default::default()
        };
        assert!(!is_truncated(&env));
    }

    #[test]
    fn test_is_policy_violation() {
        assert!(is_policy_violation(&policy_close()));
        assert!(!is_policy_violation(&TransportError::Closed {
            code: 1000,
            reason: String::new(),
        }));
        assert!(!is_policy_violation(&TransportError::Connection(String::new())));
        assert!(!is_policy_violation(&TransportError::Handshake { status: 1008 }));
    }

    #[tokio::test]
    async fn test_truncated_envelope_raises_one_alert() {
        let (events_tx, _errors_tx, mut streams, _token) = start();

        events_tx.send(truncated()).await.unwrap();
        let forwarded = timeout(WAIT, streams.events.recv()).await.unwrap().unwrap();
        assert_eq!(forwarded, truncated());

        let alert = timeout(WAIT, streams.alerts.recv()).await.unwrap().unwrap();
        assert_eq!(alert, SlowConsumerAlert::DroppedMessages { dropped: 5 });
        assert!(streams.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_plain_envelope_raises_no_alert() {
        let (events_tx, _errors_tx, mut streams, _token) = start();

        events_tx.send(Envelope::default()).await.unwrap();
        timeout(WAIT, streams.events.recv()).await.unwrap().unwrap();

        assert!(timeout(Duration::from_millis(200), streams.alerts.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_policy_violation_raises_one_alert() {
        let (_events_tx, errors_tx, mut streams, _token) = start();

        errors_tx.send(policy_close()).await.unwrap();
        let forwarded = timeout(WAIT, streams.errors.recv()).await.unwrap().unwrap();
        assert_eq!(forwarded, policy_close());

        let alert = timeout(WAIT, streams.alerts.recv()).await.unwrap().unwrap();
        assert!(matches!(alert, SlowConsumerAlert::PolicyViolation { ref reason } if reason == "slow"));
    }

    #[tokio::test]
    async fn test_other_error_raises_no_alert() {
        let (_events_tx, errors_tx, mut streams, _token) = start();

        errors_tx
            .send(TransportError::Connection("reset".to_string()))
            .await
            .unwrap();
        timeout(WAIT, streams.errors.recv()).await.unwrap().unwrap();

        assert!(timeout(Duration::from_millis(200), streams.alerts.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_order_and_alert_count_preserved() {
        let (events_tx, _errors_tx, mut streams, _token) = start();

        tokio::spawn(async move {
            for i in 0..100u64 {
                let env = if i % 10 == 0 {
                    truncated()
                } else {
                    Envelope::counter("metron", "seq", i)
                };
                events_tx.send(env).await.unwrap();
            }
        });

        for i in 0..100u64 {
            let env = timeout(WAIT, streams.events.recv()).await.unwrap().unwrap();
            if i % 10 == 0 {
                assert!(is_truncated(&env));
            } else {
                assert_eq!(env.counter_event.unwrap().delta, Some(i));
            }
        }

        for _ in 0..10 {
            timeout(WAIT, streams.alerts.recv()).await.unwrap().unwrap();
        }
        assert!(timeout(Duration::from_millis(200), streams.alerts.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_closes_all_outputs_without_draining() {
        let (events_tx, errors_tx, mut streams, token) = start();

        // Fill the pipeline so the forwarders are parked on full outputs.
        for _ in 0..3 {
            let _ = events_tx.try_send(truncated());
            let _ = errors_tx.try_send(policy_close());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        token.cancel();

        timeout(WAIT, async {
            while streams.events.recv().await.is_some() {}
            while streams.errors.recv().await.is_some() {}
            while streams.alerts.recv().await.is_some() {}
        })
        .await
        .expect("outputs did not close after cancel");
    }

    #[tokio::test]
    async fn test_alerts_close_while_events_undrained() {
        let (events_tx, _errors_tx, mut streams, token) = start();
        events_tx.send(Envelope::default()).await.unwrap();

        token.cancel();

        timeout(WAIT, async { while streams.alerts.recv().await.is_some() {} })
            .await
            .expect("alert channel stayed open");
    }

    #[tokio::test]
    async fn test_input_end_closes_output() {
        let (events_tx, errors_tx, mut streams, _token) = start();
        drop(events_tx);
        drop(errors_tx);

        assert!(timeout(WAIT, streams.events.recv()).await.unwrap().is_none());
        assert!(timeout(WAIT, streams.errors.recv()).await.unwrap().is_none());
    }
}
