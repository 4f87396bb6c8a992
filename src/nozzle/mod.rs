//! The nozzle engine: one subscription, one aggregation loop, one sink.
//!
//! [`Nozzle::start`] walks the lifecycle
//! `Idle -> Connecting -> Streaming -> Draining -> Terminated`. While
//! streaming, a single `select!` loop multiplexes the flush timer, the
//! envelope channel, the terminal error channel and the shutdown token, and
//! is the only code that touches the [`Aggregator`].

pub mod classify;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::Aggregator;
use crate::auth::TokenFetcher;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::firehose::event::{Envelope, Event};
use crate::firehose::{ConsumerError, Firehose, Subscription, CLOSE_NORMAL};
use crate::netutil;
use crate::sink::Sink;

pub use self::classify::{classify, CloseAction};

/// Origin of the traffic controller's own envelopes.
const WATCHDOG_ORIGIN: &str = "doppler";

/// Counter the traffic controller emits when it drops messages for a consumer.
const WATCHDOG_COUNTER: &str = "TruncatingBuffer.DroppedMessages";

/// Builds the sink once the nozzle starts connecting.
pub type SinkFactory<S> = Box<dyn FnOnce() -> Result<S> + Send>;

/// Lifecycle state of a [`Nozzle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NozzleState {
    Idle,
    Connecting,
    Streaming,
    Draining,
    Terminated,
}

/// Why [`Nozzle::start`] returned.
#[derive(Error, Debug)]
pub enum NozzleError {
    /// The firehose subscription ended. Always the outcome of a started stream.
    #[error(transparent)]
    Firehose(#[from] ConsumerError),

    #[error("fetching auth token: {0:#}")]
    TokenFetch(anyhow::Error),

    #[error("creating sink: {0:#}")]
    Sink(anyhow::Error),

    #[error("subscribing to firehose: {0:#}")]
    Subscribe(anyhow::Error),

    #[error("nozzle can only be started once")]
    AlreadyStarted,

    /// The shutdown token was cancelled and the window was drained.
    #[error("nozzle shut down")]
    Shutdown,
}

impl NozzleError {
    /// True when the traffic controller closed the stream normally or the
    /// nozzle was asked to shut down.
    pub fn is_clean_shutdown(&self) -> bool {
        match self {
            Self::Firehose(e) => e.close_code() == Some(CLOSE_NORMAL),
            Self::Shutdown => true,
            _ => false,
        }
    }
}

/// Forwards firehose metrics to a sink.
pub struct Nozzle<T, F, S> {
    cfg: Config,
    token_fetcher: T,
    firehose: F,
    sink_factory: Option<SinkFactory<S>>,
    health: Option<Arc<HealthMetrics>>,
    aggregator: Aggregator,
    state: NozzleState,
    shutdown: CancellationToken,
}

impl<T, F, S> Nozzle<T, F, S>
where
    T: TokenFetcher,
    F: Firehose,
    S: Sink,
{
    /// Creates an idle nozzle. Self-metrics carry the address of the
    /// outbound interface.
    pub fn new<B>(cfg: Config, token_fetcher: T, firehose: F, sink_factory: B) -> Self
    where
        B: FnOnce() -> Result<S> + Send + 'static,
    {
        let ip = match netutil::local_ip() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, "could not determine local IP, using loopback");
                netutil::local_ip_or_loopback()
            }
        };

        Self::with_ip(cfg, token_fetcher, firehose, sink_factory, ip)
    }

    /// Creates an idle nozzle whose self-metrics carry `ip`.
    pub fn with_ip<B>(
        cfg: Config,
        token_fetcher: T,
        firehose: F,
        sink_factory: B,
        ip: IpAddr,
    ) -> Self
    where
        B: FnOnce() -> Result<S> + Send + 'static,
    {
        let aggregator = Aggregator::new(cfg.deployment_name.clone(), ip.to_string());

        Self {
            cfg,
            token_fetcher,
            firehose,
            sink_factory: Some(Box::new(sink_factory)),
            health: None,
            aggregator,
            state: NozzleState::Idle,
            shutdown: CancellationToken::new(),
        }
    }

    /// Reports loop activity to the health server's metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn state(&self) -> NozzleState {
        self.state
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Cancelling the returned token ends the stream: the subscription is
    /// closed, the window flushed and `start` returns
    /// [`NozzleError::Shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the nozzle until the firehose subscription terminates.
    ///
    /// Always returns an error: the terminal cause of the stream, or the
    /// failure that kept it from starting. Check
    /// [`NozzleError::is_clean_shutdown`] for a normal closure.
    pub async fn start(&mut self) -> Result<(), NozzleError> {
        if self.state != NozzleState::Idle {
            return Err(NozzleError::AlreadyStarted);
        }

        let result = self.run().await;
        self.state = NozzleState::Terminated;
        info!("firehose nozzle shutting down");

        match result {
            Ok(never) => match never {},
            Err(e) => Err(e),
        }
    }

    async fn run(&mut self) -> Result<std::convert::Infallible, NozzleError> {
        self.state = NozzleState::Connecting;
        info!("starting firehose nozzle");

        let auth_token = if self.cfg.disable_access_control {
            String::new()
        } else {
            self.token_fetcher
                .fetch_token()
                .await
                .map_err(NozzleError::TokenFetch)?
        };

        let factory = self.sink_factory.take().ok_or(NozzleError::AlreadyStarted)?;
        let mut sink = factory().map_err(NozzleError::Sink)?;

        self.firehose.set_idle_timeout(self.cfg.idle_timeout());
        let mut subscription = self
            .firehose
            .subscribe(&self.cfg.subscription_id, &auth_token)
            .await
            .map_err(NozzleError::Subscribe)?;

        self.state = NozzleState::Streaming;
        info!(
            subscription_id = %self.cfg.subscription_id,
            sink = sink.name(),
            flush_interval = ?self.cfg.flush_interval(),
            "streaming from firehose",
        );

        let cause = self.stream(&mut subscription, &mut sink).await;

        self.state = NozzleState::Draining;
        self.drain(&mut subscription, &mut sink, cause.as_ref()).await;

        match cause {
            Some(err) => Err(NozzleError::Firehose(err)),
            None => Err(NozzleError::Shutdown),
        }
    }

    /// The steady-state loop. Returns the terminal error of the subscription,
    /// or `None` once the shutdown token is cancelled.
    async fn stream(
        &mut self,
        subscription: &mut Subscription,
        sink: &mut S,
    ) -> Option<ConsumerError> {
        let period = self.cfg.flush_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush(sink).await {
                        error!(
                            error = %format!("{e:#}"),
                            sink = sink.name(),
                            "failed to send metrics",
                        );
                    }
                }
                Some(envelope) = subscription.messages.recv() => {
                    self.handle_message(&envelope);
                }
                res = &mut subscription.errors => {
                    // A dropped sender means the reader went away without a cause.
                    return Some(res.unwrap_or(ConsumerError::StreamEnded));
                }
            }
        }
    }

    /// Applies the termination cause, closes the subscription and performs
    /// the final flush.
    async fn drain(
        &mut self,
        subscription: &mut Subscription,
        sink: &mut S,
        cause: Option<&ConsumerError>,
    ) {
        match cause {
            Some(err) => {
                self.handle_error(err);
                info!(cause = %err, "closing connection with traffic controller");
            }
            None => info!(cause = "shutdown", "closing connection with traffic controller"),
        }
        subscription.close();

        let mut buffered = 0usize;
        while let Ok(envelope) = subscription.messages.try_recv() {
            self.handle_message(&envelope);
            buffered += 1;
        }
        if buffered > 0 {
            debug!(envelopes = buffered, "aggregated buffered envelopes before final flush");
        }

        if let Err(e) = self.flush(sink).await {
            error!(
                error = %format!("{e:#}"),
                sink = sink.name(),
                "failed to send metrics",
            );
        }
    }

    fn handle_message(&mut self, envelope: &Envelope) {
        if is_dropped_messages_alert(envelope) {
            warn!(
                "intercepted an upstream message which indicates that the nozzle or the traffic controller is not keeping up, please try scaling up the nozzle"
            );
            self.alert_slow_consumer();
        }

        self.aggregator.ingest(envelope);
        if let Some(health) = &self.health {
            health.messages_received.inc();
        }
    }

    fn handle_error(&mut self, err: &ConsumerError) {
        match classify(err) {
            CloseAction::Ignore => {
                debug!(cause = %err, "firehose closed normally");
            }
            CloseAction::AlertSlowConsumer => {
                error!(error = %err, "error while reading from the firehose");
                error!(
                    "disconnected because nozzle couldn't keep up, please try scaling up the nozzle"
                );
                self.alert_slow_consumer();
            }
            CloseAction::LogOnly => {
                error!(error = %err, "error while reading from the firehose");
            }
        }
    }

    fn alert_slow_consumer(&mut self) {
        self.aggregator.mark_slow_consumer();
        if let Some(health) = &self.health {
            health.slow_consumer_alerts.inc();
        }
    }

    /// Snapshots the window and sends it. A failed batch is merged back so
    /// it goes out with the next flush.
    async fn flush(&mut self, sink: &mut S) -> Result<()> {
        let started = Instant::now();
        let batch = self.aggregator.snapshot_and_reset();
        let points = batch.point_count();

        info!(series = batch.len(), points, "posting metrics");

        let result = sink.send(&batch).await;
        match &result {
            Ok(()) => self.aggregator.record_sent(points),
            Err(_) => self.aggregator.restore(batch),
        }

        if let Some(health) = &self.health {
            health.flushes.inc();
            health.flush_duration.observe(started.elapsed().as_secs_f64());
            health
                .pending_series
                .set(self.aggregator.pending().len() as f64);
            match &result {
                Ok(()) => health.metrics_sent.inc_by(points as f64),
                Err(_) => health.flush_errors.inc(),
            }
        }

        result
    }
}

/// True for the traffic controller's dropped-messages counter.
fn is_dropped_messages_alert(envelope: &Envelope) -> bool {
    envelope.origin == WATCHDOG_ORIGIN
        && matches!(&envelope.event, Event::CounterEvent(c) if c.name == WATCHDOG_COUNTER)
}
