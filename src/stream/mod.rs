use async_stream::stream;
use axum::response::sse::{Event, Sse};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ControlPlaneError;
use crate::evaluation::EvaluationContext;
use crate::snapshot::{admin_snapshot, queries, runtime_snapshot};

/// Per-connection distributor tunables
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Reconnection hint sent on the first frame
    pub retry_hint: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        StreamSettings {
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(20),
            retry_hint: Duration::from_secs(3),
        }
    }
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Self {
        StreamSettings {
            poll_interval: config.stream_poll_interval,
            heartbeat_interval: config.stream_heartbeat_interval,
            ..StreamSettings::default()
        }
    }
}

/// Something the distributor can poll a version marker from and assemble a
/// full snapshot payload out of. The oracle read must be cheap; assembly only
/// runs when the marker moves.
pub trait SnapshotSource: Send + 'static {
    fn label(&self) -> &'static str;
    fn version(&self) -> impl Future<Output = Result<String, ControlPlaneError>> + Send;
    fn assemble(&self) -> impl Future<Output = Result<Value, ControlPlaneError>> + Send;
}

/// Counts the connection while alive; the decrement runs exactly once on
/// drop no matter which side closed the transport.
pub struct ConnectionGuard {
    connection_id: Uuid,
    label: &'static str,
    counter: Arc<AtomicU64>,
}

impl ConnectionGuard {
    pub fn new(label: &'static str, counter: Arc<AtomicU64>) -> Self {
        let connection_id = Uuid::new_v4();
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%connection_id, stream = label, "client connected");
        ConnectionGuard {
            connection_id,
            label,
            counter,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(connection_id = %self.connection_id, stream = self.label, "client disconnected");
    }
}

/// Events a stream connection can carry, before SSE framing
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Snapshot(Value),
    Heartbeat { at: String, stream: &'static str },
    Error { message: String },
}

impl StreamEvent {
    fn heartbeat(label: &'static str) -> Self {
        StreamEvent::Heartbeat {
            at: Utc::now().to_rfc3339(),
            stream: label,
        }
    }

    fn error(error: &ControlPlaneError) -> Self {
        StreamEvent::Error {
            message: error.to_string(),
        }
    }

    fn into_sse(self) -> Event {
        let (name, payload) = match self {
            StreamEvent::Snapshot(snapshot) => ("snapshot", snapshot),
            StreamEvent::Heartbeat { at, stream } => {
                ("heartbeat", json!({ "at": at, "stream": stream }))
            }
            StreamEvent::Error { message } => ("error", json!({ "message": message })),
        };
        Event::default()
            .event(name)
            .json_data(&payload)
            .unwrap_or_else(|_| Event::default().event("error").data("serialization failed"))
    }
}

/// The distributor loop for one connection: an immediate first-paint
/// snapshot, then poll the version oracle each tick, re-emitting on change
/// and heartbeating when idle. Assembly failures become in-band error events;
/// the loop never terminates the stream on its own. Dropping the returned
/// stream cancels the timer and releases the connection.
pub fn snapshot_events<S: SnapshotSource>(
    source: S,
    settings: StreamSettings,
    guard: ConnectionGuard,
) -> impl Stream<Item = StreamEvent> {
    stream! {
        let _guard = guard;

        // First paint: the client never waits for a poll tick to see state.
        // A version is only committed once its snapshot has been delivered,
        // so a failed read or assembly is retried on the next tick instead of
        // waiting for another write to move the oracle.
        let mut known_version: Option<String> = None;
        let pending = match source.version().await {
            Ok(version) => Some(version),
            Err(error) => {
                tracing::warn!(stream = source.label(), error = %error, "initial oracle read failed");
                yield StreamEvent::error(&error);
                None
            }
        };
        match source.assemble().await {
            Ok(snapshot) => {
                known_version = pending;
                yield StreamEvent::Snapshot(snapshot);
            }
            Err(error) => {
                tracing::warn!(stream = source.label(), error = %error, "initial assembly failed");
                yield StreamEvent::error(&error);
            }
        }

        let mut ticker = tokio::time::interval(settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately; skip it
        let mut last_emit = Instant::now();

        loop {
            ticker.tick().await;

            match source.version().await {
                Ok(version) => {
                    if known_version.as_deref() != Some(version.as_str()) {
                        match source.assemble().await {
                            Ok(snapshot) => {
                                known_version = Some(version);
                                last_emit = Instant::now();
                                yield StreamEvent::Snapshot(snapshot);
                            }
                            Err(error) => {
                                // known_version stays put so the next tick
                                // retries this same version
                                tracing::warn!(stream = source.label(), error = %error, "assembly failed");
                                last_emit = Instant::now();
                                yield StreamEvent::error(&error);
                            }
                        }
                    } else if last_emit.elapsed() >= settings.heartbeat_interval {
                        last_emit = Instant::now();
                        yield StreamEvent::heartbeat(source.label());
                    }
                }
                Err(error) => {
                    tracing::warn!(stream = source.label(), error = %error, "oracle read failed");
                    last_emit = Instant::now();
                    yield StreamEvent::error(&error);
                }
            }
        }
    }
}

/// Frame the distributor loop as an SSE response, with the reconnection hint
/// on the first event
pub fn sse_response<S: SnapshotSource>(
    source: S,
    settings: StreamSettings,
    guard: ConnectionGuard,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let retry_hint = settings.retry_hint;
    let events = snapshot_events(source, settings, guard)
        .enumerate()
        .map(move |(index, event)| {
            let mut framed = event.into_sse();
            if index == 0 {
                framed = framed.retry(retry_hint);
            }
            Ok::<_, Infallible>(framed)
        });
    Sse::new(events)
}

/// Source for the public runtime stream
pub struct RuntimeSource {
    pub db: PgPool,
    pub environment: String,
    pub context: EvaluationContext,
}

impl SnapshotSource for RuntimeSource {
    fn label(&self) -> &'static str {
        "runtime"
    }

    async fn version(&self) -> Result<String, ControlPlaneError> {
        let marker = queries::read_stream_version(&self.db, &self.environment).await?;
        Ok(marker.stream_version)
    }

    async fn assemble(&self) -> Result<Value, ControlPlaneError> {
        let snapshot = runtime_snapshot(&self.db, &self.environment, &self.context, false).await?;
        Ok(serde_json::to_value(snapshot)?)
    }
}

/// Source for the admin control-plane stream
pub struct AdminSource {
    pub db: PgPool,
    pub environment: String,
    pub audit_limit: i64,
    pub open_streams: Arc<AtomicU64>,
}

impl SnapshotSource for AdminSource {
    fn label(&self) -> &'static str {
        "admin"
    }

    async fn version(&self) -> Result<String, ControlPlaneError> {
        queries::read_admin_stream_version(&self.db, &self.environment).await
    }

    async fn assemble(&self) -> Result<Value, ControlPlaneError> {
        let snapshot = admin_snapshot(
            &self.db,
            &self.environment,
            self.audit_limit,
            self.open_streams.load(Ordering::Relaxed),
        )
        .await?;
        Ok(serde_json::to_value(snapshot)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct MockSource {
        version: Arc<AtomicU64>,
        fail_assemble: Arc<AtomicBool>,
        assemblies: Arc<AtomicU64>,
    }

    impl MockSource {
        fn new() -> (Self, Arc<AtomicU64>, Arc<AtomicBool>, Arc<AtomicU64>) {
            let version = Arc::new(AtomicU64::new(1));
            let fail_assemble = Arc::new(AtomicBool::new(false));
            let assemblies = Arc::new(AtomicU64::new(0));
            let source = MockSource {
                version: version.clone(),
                fail_assemble: fail_assemble.clone(),
                assemblies: assemblies.clone(),
            };
            (source, version, fail_assemble, assemblies)
        }
    }

    impl SnapshotSource for MockSource {
        fn label(&self) -> &'static str {
            "runtime"
        }

        async fn version(&self) -> Result<String, ControlPlaneError> {
            Ok(self.version.load(Ordering::SeqCst).to_string())
        }

        async fn assemble(&self) -> Result<Value, ControlPlaneError> {
            if self.fail_assemble.load(Ordering::SeqCst) {
                return Err(ControlPlaneError::Database(sqlx::Error::PoolClosed));
            }
            self.assemblies.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "version": self.version.load(Ordering::SeqCst) }))
        }
    }

    fn settings() -> StreamSettings {
        StreamSettings::default()
    }

    fn guard() -> ConnectionGuard {
        ConnectionGuard::new("runtime", Arc::new(AtomicU64::new(0)))
    }

    fn is_snapshot(event: &StreamEvent) -> bool {
        matches!(event, StreamEvent::Snapshot(_))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_paint_before_any_tick() {
        let (source, _, _, _) = MockSource::new();
        let stream = snapshot_events(source, settings(), guard());
        tokio::pin!(stream);

        let started = Instant::now();
        let first = stream.next().await.expect("stream ended");
        assert!(is_snapshot(&first));
        // Emitted without waiting for the poll interval
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_convergence_within_one_poll_interval() {
        let (source, version, _, _) = MockSource::new();
        let stream = snapshot_events(source, settings(), guard());
        tokio::pin!(stream);

        let _init = stream.next().await.expect("no init event");

        version.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let update = stream.next().await.expect("no update event");
        assert!(is_snapshot(&update));
        assert!(
            started.elapsed() <= settings().poll_interval * 2,
            "update took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cadence_when_idle() {
        let (source, _, _, _) = MockSource::new();
        let stream = snapshot_events(source, settings(), guard());
        tokio::pin!(stream);

        let _init = stream.next().await.expect("no init event");

        let started = Instant::now();
        let first = stream.next().await.expect("stream ended");
        assert!(matches!(first, StreamEvent::Heartbeat { .. }));
        let first_at = started.elapsed();
        assert!(
            first_at >= settings().heartbeat_interval,
            "heartbeat arrived early at {:?}",
            first_at
        );
        assert!(first_at <= settings().heartbeat_interval + settings().poll_interval);

        // And no more often than the configured interval
        let second = stream.next().await.expect("stream ended");
        assert!(matches!(second, StreamEvent::Heartbeat { .. }));
        let gap = started.elapsed() - first_at;
        assert!(gap >= settings().heartbeat_interval, "gap was {:?}", gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assembly_error_is_in_band_and_stream_survives() {
        let (source, version, fail_assemble, _) = MockSource::new();
        let stream = snapshot_events(source, settings(), guard());
        tokio::pin!(stream);

        let _init = stream.next().await.expect("no init event");

        fail_assemble.store(true, Ordering::SeqCst);
        version.fetch_add(1, Ordering::SeqCst);
        let failed = stream.next().await.expect("stream ended");
        assert!(matches!(failed, StreamEvent::Error { .. }));

        // Recovery: the next version change after the fault pushes again
        fail_assemble.store(false, Ordering::SeqCst);
        version.fetch_add(1, Ordering::SeqCst);
        let recovered = stream.next().await.expect("stream ended");
        assert!(is_snapshot(&recovered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_transient_assembly_failure() {
        // One failed assembly must not strand the client on last-known-good:
        // with the fault cleared and no further oracle movement, the very
        // next tick delivers the missed snapshot.
        let (source, version, fail_assemble, assemblies) = MockSource::new();
        let stream = snapshot_events(source, settings(), guard());
        tokio::pin!(stream);

        let _init = stream.next().await.expect("no init event");

        fail_assemble.store(true, Ordering::SeqCst);
        version.fetch_add(1, Ordering::SeqCst);
        let failed = stream.next().await.expect("stream ended");
        assert!(matches!(failed, StreamEvent::Error { .. }));

        fail_assemble.store(false, Ordering::SeqCst);
        let started = Instant::now();
        let recovered = stream.next().await.expect("stream ended");
        assert!(
            is_snapshot(&recovered),
            "expected a snapshot retry, got {:?}",
            recovered
        );
        assert!(
            started.elapsed() <= settings().poll_interval * 2,
            "retry took {:?}",
            started.elapsed()
        );
        assert_eq!(assemblies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_assembly_failure_recovers_without_new_write() {
        let (source, _, fail_assemble, _) = MockSource::new();
        fail_assemble.store(true, Ordering::SeqCst);
        let stream = snapshot_events(source, settings(), guard());
        tokio::pin!(stream);

        let first = stream.next().await.expect("stream ended");
        assert!(matches!(first, StreamEvent::Error { .. }));

        // The oracle never moves again; the first paint still arrives
        fail_assemble.store(false, Ordering::SeqCst);
        let painted = stream.next().await.expect("stream ended");
        assert!(is_snapshot(&painted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reassembly_without_version_change() {
        let (source, _, _, assemblies) = MockSource::new();
        let stream = snapshot_events(source, settings(), guard());
        tokio::pin!(stream);

        let _init = stream.next().await.expect("no init event");
        // Ride through one heartbeat's worth of idle ticks
        let _heartbeat = stream.next().await.expect("stream ended");
        assert_eq!(assemblies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_guard_counts_once() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let _guard = ConnectionGuard::new("runtime", counter.clone());
            assert_eq!(counter.load(Ordering::Relaxed), 1);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_stream_releases_connection() {
        let counter = Arc::new(AtomicU64::new(0));
        let (source, _, _, _) = MockSource::new();
        {
            let guard = ConnectionGuard::new("runtime", counter.clone());
            let stream = snapshot_events(source, settings(), guard);
            tokio::pin!(stream);
            let _init = stream.next().await;
            assert_eq!(counter.load(Ordering::Relaxed), 1);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
