//! Websocket consumer for the traffic controller firehose endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::Connector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::Envelope;
use super::Firehose;

/// Decoded envelopes buffered between the read task and the nozzle loop.
const MESSAGE_BUFFER: usize = 4096;

/// Close code reported when the peer closed without a status.
const CLOSE_NO_STATUS: u16 = 1005;

/// Why a firehose subscription ended.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The traffic controller sent a close frame.
    #[error("websocket: close {code}: {reason}")]
    Closed { code: u16, reason: String },

    /// No frame arrived within the idle timeout.
    #[error("read firehose: i/o timeout after {0:?}")]
    IdleTimeout(Duration),

    #[error("connecting to firehose: {0}")]
    Connect(#[source] Box<tungstenite::Error>),

    #[error("reading from firehose: {0}")]
    Transport(#[source] Box<tungstenite::Error>),

    #[error("firehose stream ended without a close frame")]
    StreamEnded,

    #[error("firehose subscription cancelled")]
    Cancelled,
}

impl ConsumerError {
    /// Returns the websocket close code if the stream ended with a close frame.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// An open firehose subscription.
///
/// The producer side writes decoded envelopes to `messages` and exactly one
/// terminal error to `errors`. Dropping the subscription cancels the reader.
pub struct Subscription {
    pub messages: mpsc::Receiver<Envelope>,
    pub errors: oneshot::Receiver<ConsumerError>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Wraps the read side of an already running producer.
    pub fn new(
        messages: mpsc::Receiver<Envelope>,
        errors: oneshot::Receiver<ConsumerError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            messages,
            errors,
            cancel,
        }
    }

    /// Stops the producer and releases the connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Firehose source backed by a websocket connection to the traffic controller.
#[derive(Debug, Clone)]
pub struct WebsocketFirehose {
    url: String,
    insecure_skip_verify: bool,
    idle_timeout: Option<Duration>,
}

impl WebsocketFirehose {
    /// Creates a firehose source for `traffic_controller_url`.
    pub fn new(traffic_controller_url: &str, insecure_skip_verify: bool) -> Self {
        Self {
            url: traffic_controller_url.trim_end_matches('/').to_string(),
            insecure_skip_verify,
            idle_timeout: None,
        }
    }

    fn endpoint(&self, subscription_id: &str) -> String {
        format!("{}/firehose/{}", self.url, subscription_id)
    }

    fn connector(&self) -> Result<Option<Connector>> {
        if !self.insecure_skip_verify {
            return Ok(None);
        }

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .context("building TLS connector")?;

        Ok(Some(Connector::NativeTls(tls)))
    }
}

impl Firehose for WebsocketFirehose {
    fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
    }

    async fn subscribe(&mut self, subscription_id: &str, auth_token: &str) -> Result<Subscription> {
        let endpoint = self.endpoint(subscription_id);
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .with_context(|| format!("building firehose request for {endpoint}"))?;

        if !auth_token.is_empty() {
            let value = HeaderValue::from_str(auth_token).context("invalid auth token header")?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let connector = self.connector()?;
        let idle_timeout = self.idle_timeout;

        let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_BUFFER);
        let (err_tx, err_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        info!(endpoint = %endpoint, "subscribing to firehose");

        tokio::spawn(async move {
            let err = consume(request, connector, msg_tx, task_cancel, idle_timeout).await;
            debug!(error = %err, "firehose reader finished");
            // The receiver is gone once the nozzle has shut down.
            let _ = err_tx.send(err);
        });

        Ok(Subscription::new(msg_rx, err_rx, cancel))
    }
}

/// Reads frames until the stream terminates and returns the cause.
async fn consume(
    request: tungstenite::handshake::client::Request,
    connector: Option<Connector>,
    messages: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
) -> ConsumerError {
    let connect = tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);
    let ws = tokio::select! {
        _ = cancel.cancelled() => return ConsumerError::Cancelled,
        res = connect => match res {
            Ok((ws, _)) => ws,
            Err(e) => return ConsumerError::Connect(Box::new(e)),
        },
    };

    info!("connected to firehose");

    let (mut write, mut read) = ws.split();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!(error = %e, "sending close frame");
                }
                return ConsumerError::Cancelled;
            }
            next = read_frame(&mut read, idle_timeout) => next,
        };

        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => return ConsumerError::Transport(Box::new(e)),
            Ok(None) => return ConsumerError::StreamEnded,
            Err(timeout) => return ConsumerError::IdleTimeout(timeout),
        };

        match frame {
            Message::Binary(data) => match Envelope::decode(&data) {
                Ok(envelope) => {
                    if messages.send(envelope).await.is_err() {
                        return ConsumerError::Cancelled;
                    }
                }
                Err(e) => warn!(error = %e, "skipping undecodable firehose frame"),
            },
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((CLOSE_NO_STATUS, String::new()));
                return ConsumerError::Closed { code, reason };
            }
            Message::Text(_) => debug!("skipping text frame on firehose"),
            // Ping/pong replies are handled by tungstenite.
            _ => {}
        }
    }
}

type ReadHalf = futures::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

async fn read_frame(
    read: &mut ReadHalf,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<Message, tungstenite::Error>>, Duration> {
    match idle_timeout {
        Some(timeout) => tokio::time::timeout(timeout, read.next())
            .await
            .map_err(|_| timeout),
        None => Ok(read.next().await),
    }
}
