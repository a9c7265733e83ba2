//! Websocket firehose source
//!
//! Connects to `<addr>/firehose/<subscription_id>`, authenticates with the
//! bearer token in the `Authorization` header and decodes every binary frame
//! into an [`Envelope`]. Handshake failures, decode failures and closure
//! frames are reported on the error sequence. The connection is not retried.

use super::{require, EventSource, RunState, SourceStreams};
use crate::envelope::Envelope;
use crate::error::{NozzleError, Result, TransportError};
use crate::pipe::send_or_cancel;
use crate::token::mask_secret;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

/// Default capacity of the event and error channels
const DEFAULT_CAPACITY: usize = 64;

/// Close code reported when the peer closes without a status
const CLOSE_NO_STATUS: u16 = 1005;

type FirehoseStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Firehose client over a websocket connection
pub struct WebSocketSource {
    addr: String,
    token: String,
    subscription_id: String,
    insecure: bool,
    capacity: usize,
    state: RunState,
}

impl std::fmt::Debug for WebSocketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSource")
            .field("addr", &self.addr)
            .field("token", &mask_secret(&self.token))
            .field("subscription_id", &self.subscription_id)
            .field("insecure", &self.insecure)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl WebSocketSource {
    /// Create a source, failing on the first empty required field
    pub fn new(
        addr: impl Into<String>,
        token: impl Into<String>,
        subscription_id: impl Into<String>,
    ) -> Result<Self> {
        let source = Self {
            addr: addr.into(),
            token: token.into(),
            subscription_id: subscription_id.into(),
            insecure: false,
            capacity: DEFAULT_CAPACITY,
            state: RunState::default(),
        };
        source.validate()?;
        Ok(source)
    }

    /// Skip TLS certificate and hostname verification
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Set the capacity of the event and error channels
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Full firehose endpoint for this subscription
    pub fn firehose_url(&self) -> String {
        format!(
            "{}/firehose/{}",
            self.addr.trim_end_matches('/'),
            self.subscription_id
        )
    }

    fn validate(&self) -> Result<()> {
        require("doppler address", &self.addr)?;
        require("token", &self.token)?;
        require("subscription id", &self.subscription_id)
    }

    fn request(&self) -> Result<Request> {
        let mut request = self
            .firehose_url()
            .into_client_request()
            .map_err(|e| NozzleError::Source(format!("{}: {}", self.firehose_url(), e)))?;

        let auth = HeaderValue::from_str(&self.token)
            .map_err(|_| NozzleError::Source("token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        Ok(request)
    }

    fn connector(&self) -> Result<Option<Connector>> {
        if !self.insecure {
            return Ok(None);
        }

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| NozzleError::Source(format!("TLS setup failed: {}", e)))?;
        Ok(Some(Connector::NativeTls(tls)))
    }
}

impl EventSource for WebSocketSource {
    fn start(&mut self, token: CancellationToken) -> Result<SourceStreams> {
        let request = self.request()?;
        let connector = self.connector()?;
        let token = self.state.begin(&token);

        let (events_tx, events_rx) = mpsc::channel(self.capacity);
        let (errors_tx, errors_rx) = mpsc::channel(self.capacity);

        tracing::info!(
            addr = %self.addr,
            subscription = %self.subscription_id,
            insecure = self.insecure,
            "Start consuming firehose events"
        );

        tokio::spawn(
            run_connection(request, connector, events_tx, errors_tx, token)
                .with_current_subscriber(),
        );

        Ok(SourceStreams {
            events: events_rx,
            errors: errors_rx,
        })
    }

    fn close(&mut self) -> Result<()> {
        tracing::info!(subscription = %self.subscription_id, "Stop consuming firehose events");
        self.state.end("websocket")
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

async fn run_connection(
    request: Request,
    connector: Option<Connector>,
    events: mpsc::Sender<Envelope>,
    errors: mpsc::Sender<TransportError>,
    token: CancellationToken,
) {
    let connect =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);

    let mut ws = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        connected = connect => match connected {
            Ok((ws, _)) => ws,
            Err(e) => {
                send_or_cancel(&errors, transport_error(e), &token).await;
                return;
            }
        },
    };

    tracing::debug!("Firehose connection established");

    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => {
                shutdown(&mut ws).await;
                break;
            }
            frame = ws.next() => frame,
        };

        let delivered = match frame {
            Some(Ok(Message::Binary(data))) => match Envelope::from_frame(&data) {
                Ok(envelope) => send_or_cancel(&events, envelope, &token).await,
                Err(e) => send_or_cancel(&errors, e, &token).await,
            },
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(f) => (u16::from(f.code), f.reason.into_owned()),
                    None => (CLOSE_NO_STATUS, String::new()),
                };
                tracing::info!(code, %reason, "Firehose closed the connection");
                send_or_cancel(&errors, TransportError::Closed { code, reason }, &token).await;
                break;
            }
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                send_or_cancel(&errors, transport_error(e), &token).await;
                break;
            }
            None => break,
        };

        if !delivered {
            shutdown(&mut ws).await;
            break;
        }
    }

    tracing::debug!("Firehose connection finished");
}

async fn shutdown(ws: &mut FirehoseStream) {
    if let Err(e) = ws.close(None).await {
        tracing::debug!("Error closing firehose connection: {}", e);
    }
}

fn transport_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => TransportError::Handshake {
            status: response.status().as_u16(),
        },
        tungstenite::Error::Url(e) => TransportError::Request(e.to_string()),
        other => TransportError::Connection(other.to_string()),
    }
}
