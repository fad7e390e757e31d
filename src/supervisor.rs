//! Reconnect supervisor around subscription sessions.
//!
//! [`Supervisor::run`] keeps a session open for as long as possible: every
//! failed or finished session is followed by a new connect attempt, paced by
//! the configured [`RetryPolicy`]. Only a shutdown request, a connect error
//! under [`ConnectErrorAction::Stop`], or an exhausted retry budget ends the
//! loop.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use yellowstone_grpc_proto::prelude::SubscribeRequest;

use crate::retry::{with_timeout, RetryPolicy};
use crate::stream::client::{Connector, StreamError};
use crate::stream::proto::SubscriptionRequest;
use crate::stream::session::{
    run_session, shutdown_requested, SessionOutcome, UpdateHandler, DEFAULT_PING_INTERVAL,
};

/// What to do when a stream cannot be established at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectErrorAction {
    /// Treat it like any other stream failure and reconnect.
    #[default]
    Retry,
    /// Log it and stop monitoring.
    Stop,
}

/// Supervisor tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Keep-alive cadence of each session.
    pub ping_interval: Duration,
    /// Upper bound on one connect attempt.
    pub connect_timeout: Duration,
    /// Backoff between sessions and the consecutive-failure budget.
    pub reconnect: RetryPolicy,
    pub on_connect_error: ConnectErrorAction,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            reconnect: RetryPolicy::default(),
            on_connect_error: ConnectErrorAction::default(),
        }
    }
}

/// Why [`Supervisor::run`] returned.
#[derive(Debug)]
pub enum SupervisorExit {
    /// Shutdown was requested.
    Shutdown,
    /// A connect error ended monitoring under [`ConnectErrorAction::Stop`].
    ConnectFailed(StreamError),
    /// Too many consecutive failures for the retry policy.
    RetriesExhausted { failures: usize, last_error: Option<StreamError> },
}

/// Owns the connector and restarts sessions after they end.
#[derive(Debug)]
pub struct Supervisor<C> {
    connector: C,
    request: SubscribeRequest,
    settings: SupervisorSettings,
    connect_attempts: usize,
}

impl<C> Supervisor<C>
where
    C: Connector,
{
    /// Creates a supervisor that subscribes with `request` on every
    /// connect.
    pub fn new(connector: C, request: &SubscriptionRequest, settings: SupervisorSettings) -> Self {
        Self {
            connector,
            request: request.to_subscribe_request(),
            settings,
            connect_attempts: 0,
        }
    }

    /// Number of connect attempts made so far.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts
    }

    /// Connector used for every connect attempt.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Runs sessions until shutdown or a terminal supervisor condition.
    pub async fn run<H>(
        &mut self,
        handler: &mut H,
        mut shutdown: watch::Receiver<bool>,
    ) -> SupervisorExit
    where
        H: UpdateHandler + ?Sized,
    {
        let mut failures = 0usize;

        loop {
            if *shutdown.borrow() {
                return SupervisorExit::Shutdown;
            }

            self.connect_attempts += 1;
            info!(
                event = "connect_attempt",
                attempt = self.connect_attempts,
                "connecting to stream"
            );

            let timeout = self.settings.connect_timeout;
            let connected = tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => return SupervisorExit::Shutdown,
                result = with_timeout(timeout, self.connector.connect()) => {
                    result.unwrap_or_else(|_| Err(StreamError::ConnectTimeout(timeout)))
                }
            };

            let last_error = match connected {
                Ok(subscription) => {
                    let report = run_session(
                        subscription,
                        &self.request,
                        self.settings.ping_interval,
                        handler,
                        &mut shutdown,
                    )
                    .await;
                    if report.updates > 0 {
                        failures = 0;
                    }
                    match report.outcome {
                        SessionOutcome::Closed => return SupervisorExit::Shutdown,
                        SessionOutcome::Completed => None,
                        SessionOutcome::Failed(err) => Some(err),
                    }
                }
                Err(err) => {
                    error!(event = "connect_failed", error = %err, "connect failed");
                    if self.settings.on_connect_error == ConnectErrorAction::Stop {
                        return SupervisorExit::ConnectFailed(err);
                    }
                    Some(err)
                }
            };

            failures += 1;
            if !self.settings.reconnect.allows_retry(failures) {
                warn!(event = "retries_exhausted", failures, "giving up on stream");
                return SupervisorExit::RetriesExhausted {
                    failures,
                    last_error,
                };
            }

            let delay = self.settings.reconnect.delay_for_attempt(failures);
            info!(
                event = "reconnecting",
                failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnecting"
            );
            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut shutdown) => {
                    debug!(event = "backoff_interrupted");
                    return SupervisorExit::Shutdown;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
