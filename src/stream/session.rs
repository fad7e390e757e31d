//! Single subscription session with keep-alive pings.
//!
//! [`run_session`] writes the subscription request, arms a [`KeepAlive`]
//! timer, forwards inbound updates to an [`UpdateHandler`], and reports one
//! [`SessionOutcome`] when the stream ends, fails, or is closed locally.

use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use yellowstone_grpc_proto::prelude::{SubscribeRequest, SubscribeUpdate};

use crate::stream::client::{StreamError, Subscription};
use crate::stream::proto::ping_request;

/// Default keep-alive cadence.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(1000);

const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Receives every inbound update of a session.
pub trait UpdateHandler {
    fn on_update(&mut self, update: SubscribeUpdate);
}

impl<F> UpdateHandler for F
where
    F: FnMut(SubscribeUpdate),
{
    fn on_update(&mut self, update: SubscribeUpdate) {
        self(update)
    }
}

/// Terminal condition of a session, delivered exactly once.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The server ended the stream.
    Completed,
    /// The session was closed locally after a shutdown request.
    Closed,
    /// The transport reported an error.
    Failed(StreamError),
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => f.write_str("completed"),
            SessionOutcome::Closed => f.write_str("closed"),
            SessionOutcome::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Outcome of a session together with its traffic counters.
#[derive(Debug)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    /// Inbound updates forwarded to the handler.
    pub updates: u64,
    /// Keep-alive pings written successfully.
    pub pings_sent: u64,
    /// Writes that failed, subscription request included.
    pub write_failures: u64,
}

/// Periodic ping timer owned by one session.
///
/// [`KeepAlive::cancel`] consumes the timer, so it is cancelled at most
/// once and cannot tick afterwards.
#[derive(Debug)]
pub struct KeepAlive {
    interval: Interval,
    ping: SubscribeRequest,
    sent: u64,
    failed: u64,
}

impl KeepAlive {
    /// Arms the timer. The first ping is due one `period` from now.
    pub fn arm(period: Duration) -> Self {
        let period = period.max(MIN_PING_INTERVAL);
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            ping: ping_request(),
            sent: 0,
            failed: 0,
        }
    }

    /// Waits for the next ping to become due.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Queues one ping without waiting for capacity. Failures are logged
    /// and counted, never propagated.
    pub fn ping(&mut self, requests: &mpsc::Sender<SubscribeRequest>) {
        match requests.try_send(self.ping.clone()) {
            Ok(()) => self.sent += 1,
            Err(err) => {
                self.failed += 1;
                warn!(event = "ping_write_failed", error = %err, "ping write failed");
            }
        }
    }

    /// Stops the timer and returns `(sent, failed)` ping counts.
    pub fn cancel(self) -> (u64, u64) {
        debug!(
            event = "keep_alive_cancelled",
            sent = self.sent,
            failed = self.failed
        );
        (self.sent, self.failed)
    }
}

/// Runs one session until it completes, fails, or shutdown is requested.
///
/// The subscription request is written before the keep-alive timer is
/// armed. A due ping is polled ahead of inbound updates so a busy stream
/// cannot hold pings back. A failed subscription write is logged and the session keeps
/// running until the stream itself signals a terminal condition.
pub async fn run_session<H>(
    subscription: Subscription,
    request: &SubscribeRequest,
    ping_interval: Duration,
    handler: &mut H,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionReport
where
    H: UpdateHandler + ?Sized,
{
    let Subscription {
        requests,
        mut updates,
    } = subscription;
    let mut write_failures = 0;
    let mut received = 0;

    if let Err(err) = requests.send(request.clone()).await {
        write_failures += 1;
        let err = StreamError::Write(err.to_string());
        error!(event = "subscribe_write_failed", error = %err, "subscribe write failed");
    }

    let mut keep_alive = KeepAlive::arm(ping_interval);

    let outcome = loop {
        tokio::select! {
            biased;

            _ = shutdown_requested(shutdown) => break SessionOutcome::Closed,
            _ = keep_alive.tick() => keep_alive.ping(&requests),
            next = updates.next() => match next {
                Some(Ok(update)) => {
                    received += 1;
                    handler.on_update(update);
                }
                Some(Err(err)) => {
                    error!(event = "stream_error", error = %err, "stream error");
                    break SessionOutcome::Failed(err);
                }
                None => {
                    info!(event = "stream_ended", "stream ended");
                    break SessionOutcome::Completed;
                }
            },
        }
    };

    let (pings_sent, pings_failed) = keep_alive.cancel();
    drop(requests);
    info!(
        event = "stream_closed",
        outcome = %outcome,
        updates = received,
        pings_sent,
        "stream closed"
    );

    SessionReport {
        outcome,
        updates: received,
        pings_sent,
        write_failures: write_failures + pings_failed,
    }
}

/// Resolves once shutdown has been requested. Never resolves if the sender
/// is gone without requesting it.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures_util::stream;
    use tokio::sync::{mpsc, watch};
    use tokio::time::Instant;
    use yellowstone_grpc_proto::prelude::{
        subscribe_update::UpdateOneof, SubscribeRequest, SubscribeUpdate, SubscribeUpdatePong,
    };

    use super::{run_session, SessionOutcome};
    use crate::stream::client::{StreamError, Subscription};
    use crate::stream::proto::SubscriptionRequest;

    type Recorded = Arc<Mutex<Vec<(Instant, SubscribeRequest)>>>;
    type UpdateSender = mpsc::Sender<Result<SubscribeUpdate, StreamError>>;

    /// Subscription whose writes are recorded and whose updates are fed
    /// through the returned sender.
    fn scripted_subscription() -> (Subscription, Recorded, UpdateSender) {
        let (requests, mut outbound) = mpsc::channel(16);
        let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);
        tokio::spawn(async move {
            while let Some(request) = outbound.recv().await {
                sink.lock().unwrap().push((Instant::now(), request));
            }
        });

        let (update_tx, update_rx) = mpsc::channel(16);
        let updates = stream::unfold(update_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (Subscription::new(requests, updates), recorded, update_tx)
    }

    fn pong(id: i32) -> SubscribeUpdate {
        SubscribeUpdate {
            update_oneof: Some(UpdateOneof::Pong(SubscribeUpdatePong { id })),
            ..Default::default()
        }
    }

    fn request() -> SubscribeRequest {
        SubscriptionRequest::for_account("ADDR123").to_subscribe_request()
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_precedes_pings_and_pings_stop_after_close() {
        let (subscription, recorded, _update_tx) = scripted_subscription();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let session = tokio::spawn(async move {
            let mut handler = |_update: SubscribeUpdate| {};
            run_session(
                subscription,
                &request(),
                Duration::from_millis(1000),
                &mut handler,
                &mut shutdown_rx,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        shutdown_tx.send(true).expect("session listening");
        let report = session.await.expect("session task");
        assert!(matches!(report.outcome, SessionOutcome::Closed));
        assert_eq!(report.pings_sent, 3);
        assert_eq!(report.write_failures, 0);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        let writes = recorded.lock().unwrap();
        assert_eq!(writes.len(), 4, "one subscribe plus three pings");

        let (subscribed_at, first) = &writes[0];
        assert!(first.ping.is_none());
        assert!(!first.transactions.is_empty());

        for (n, (at, ping)) in writes[1..].iter().enumerate() {
            assert_eq!(ping.ping.as_ref().map(|p| p.id), Some(1));
            let expected = Duration::from_millis(1000 * (n as u64 + 1));
            assert_eq!(at.duration_since(*subscribed_at), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_completes_once() {
        let (subscription, _recorded, update_tx) = scripted_subscription();
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let seen = Arc::new(AtomicUsize::new(0));

        update_tx.send(Ok(pong(1))).await.expect("queue update");
        drop(update_tx);

        let counter = Arc::clone(&seen);
        let mut handler = move |_update: SubscribeUpdate| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        let report = run_session(
            subscription,
            &request(),
            Duration::from_millis(1000),
            &mut handler,
            &mut shutdown_rx,
        )
        .await;

        assert!(matches!(report.outcome, SessionOutcome::Completed));
        assert_eq!(report.updates, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_fails_session() {
        let (subscription, _recorded, update_tx) = scripted_subscription();
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        update_tx
            .send(Err(StreamError::Status(tonic::Status::unavailable(
                "node restarting",
            ))))
            .await
            .expect("queue error");

        let mut handler = |_update: SubscribeUpdate| {};
        let report = run_session(
            subscription,
            &request(),
            Duration::from_millis(1000),
            &mut handler,
            &mut shutdown_rx,
        )
        .await;

        match report.outcome {
            SessionOutcome::Failed(StreamError::Status(status)) => {
                assert_eq!(status.code(), tonic::Code::Unavailable);
            }
            other => panic!("unexpected outcome: {other}"),
        }
        assert_eq!(report.updates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failures_do_not_end_the_session() {
        let (requests, outbound) = mpsc::channel::<SubscribeRequest>(16);
        drop(outbound);
        let (update_tx, update_rx) = mpsc::channel(16);
        let updates = stream::unfold(update_rx, |mut rx: mpsc::Receiver<_>| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let subscription = Subscription::new(requests, updates);
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let session = tokio::spawn(async move {
            let mut handler = |_update: SubscribeUpdate| {};
            run_session(
                subscription,
                &request(),
                Duration::from_millis(1000),
                &mut handler,
                &mut shutdown_rx,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!session.is_finished());
        update_tx.send(Ok(pong(7))).await.expect("queue update");
        drop(update_tx);

        let report = session.await.expect("session task");
        assert!(matches!(report.outcome, SessionOutcome::Completed));
        assert_eq!(report.updates, 1);
        assert_eq!(report.pings_sent, 0);
        assert_eq!(report.write_failures, 3, "subscribe plus two pings");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pings_keep_their_cadence_on_a_busy_stream() {
        let (requests, mut outbound) = mpsc::channel::<SubscribeRequest>(64);
        let drain = tokio::spawn(async move { while outbound.recv().await.is_some() {} });
        let updates = stream::repeat_with(|| Ok(SubscribeUpdate::default()));
        let subscription = Subscription::new(requests, updates);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let mut handled = 0u32;
        let mut handler = move |_update: SubscribeUpdate| {
            handled += 1;
            std::thread::sleep(Duration::from_millis(1));
            if handled == 300 {
                let _ = shutdown_tx.send(true);
            }
        };
        let report = run_session(
            subscription,
            &request(),
            Duration::from_millis(25),
            &mut handler,
            &mut shutdown_rx,
        )
        .await;

        assert!(matches!(report.outcome, SessionOutcome::Closed));
        assert_eq!(report.updates, 300);
        // About twelve pings are due over the session.
        assert!(
            report.pings_sent >= 4,
            "only {} pings sent while updates were always ready",
            report.pings_sent
        );
        drain.await.expect("drain task");
    }

    #[tokio::test]
    async fn shutdown_before_start_closes_immediately() {
        let (subscription, _recorded, _update_tx) = scripted_subscription();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).expect("receiver alive");

        let mut handler = |_update: SubscribeUpdate| {};
        let report = run_session(
            subscription,
            &request(),
            Duration::from_millis(1000),
            &mut handler,
            &mut shutdown_rx,
        )
        .await;
        assert!(matches!(report.outcome, SessionOutcome::Closed));
        assert_eq!(report.pings_sent, 0);
    }
}
