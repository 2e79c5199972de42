//! Reporting channel towards the control plane.
//!
//! Four payload classes go over the `agent-reports` channel (state
//! transitions, restart requests, heartbeats) and `vps-stats` (host
//! snapshots). Each class has its own bounded outbound queue absorbing bus
//! back-pressure: heartbeats and host stats drop their oldest entries, state
//! transitions and restart requests are retained. A single publisher task
//! preserves per-class FIFO ordering.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use ezstream_log::log;
use serde::Serialize;
use tokio::{sync::Notify, time};

use crate::{
    bus::Bus,
    settings,
    state::{StreamId, StreamState},
    stats::HostSnapshot,
};

/// Channel the state transitions, restart requests and heartbeats are
/// published onto.
pub const REPORTS_CHANNEL: &str = "agent-reports";

/// Channel the host snapshots are published onto.
pub const STATS_CHANNEL: &str = "vps-stats";

/// Capacity of the drop-oldest heartbeat and host stats queues.
const TELEMETRY_QUEUE_CAP: usize = 16;

/// Capacity of the retain-all state transition and restart request queue.
const RELIABLE_QUEUE_CAP: usize = 1024;

/// Consecutive successful publishes treated as a sentinel for "the control
/// plane has been restarted", flushing the retained backlog and triggering a
/// heartbeat re-announce.
const RECONNECT_OK_STREAK: u32 = 5;

/// Status of a stream as reported to the control plane.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Stream has been accepted and is being prepared.
    Starting,
    /// Sources are being staged to disk.
    Downloading,
    /// Encoder is live and publishing.
    Streaming,
    /// Stream is being stopped.
    Stopping,
    /// Stream has been stopped and removed.
    Stopped,
    /// Stream has failed terminally.
    Error,
    /// Encoder is being re-spawned in-band.
    Restarting,
    /// Stream is being switched onto new sources.
    Updating,
    /// Staging progress notification (throttled).
    Progress,
}

impl From<StreamState> for Status {
    fn from(state: StreamState) -> Self {
        match state {
            StreamState::Starting => Self::Starting,
            StreamState::Downloading => Self::Downloading,
            StreamState::Streaming => Self::Streaming,
            StreamState::Stopping => Self::Stopping,
            StreamState::Restarting => Self::Restarting,
            StreamState::Updating => Self::Updating,
            StreamState::Error => Self::Error,
        }
    }
}

/// `STATUS_UPDATE` report payload.
#[derive(Debug, Serialize)]
struct StatusUpdate {
    r#type: &'static str,
    stream_id: StreamId,
    host_id: i64,
    status: Status,
    message: String,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra: Option<serde_json::Value>,
}

/// `RESTART_REQUEST` report payload.
#[derive(Debug, Serialize)]
struct RestartRequest {
    r#type: &'static str,
    stream_id: StreamId,
    host_id: i64,
    reason: String,
    crash_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    error_type: &'static str,
    timestamp: i64,
}

/// `HEARTBEAT` report payload.
#[derive(Debug, Serialize)]
struct Heartbeat {
    r#type: &'static str,
    host_id: i64,
    active_streams: Vec<StreamId>,
    timestamp: i64,
    #[serde(skip_serializing_if = "is_false")]
    re_announce: bool,
}

/// Checks whether the given `bool` is `false`.
#[allow(clippy::trivially_copy_pass_by_ref)]
#[inline]
fn is_false(b: &bool) -> bool {
    !*b
}

/// One serialized report awaiting publication.
#[derive(Debug)]
struct Outbound {
    /// Channel to publish onto.
    channel: &'static str,

    /// Serialized JSON payload.
    payload: Vec<u8>,
}

/// Per-class outbound queues and the bus health bookkeeping.
#[derive(Debug, Default)]
struct Queues {
    /// Retain-all queue of state transitions and restart requests.
    reliable: VecDeque<Outbound>,

    /// Drop-oldest queue of heartbeats.
    heartbeat: VecDeque<Outbound>,

    /// Drop-oldest queue of host snapshots.
    stats: VecDeque<Outbound>,

    /// Indicator that a publish has failed and the retained backlog is being
    /// held until the bus proves healthy again.
    degraded: bool,

    /// Consecutive successful publishes since the last failure.
    ok_streak: u32,
}

/// Reporter publishing agent reports to the control plane via the bus.
#[derive(Clone, Debug)]
pub struct Reporter(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    host_id: i64,
    bus: Arc<dyn Bus>,
    settings: Arc<settings::Store>,
    queues: Mutex<Queues>,
    notify: Notify,
    /// Moments of the last `PROGRESS` report per stream, for throttling.
    progress: Mutex<HashMap<StreamId, Instant>>,
    /// Indicator that the next heartbeat must re-announce the active set.
    re_announce: AtomicBool,
    /// Moment of the last successful publish of any class.
    last_ok: Mutex<Instant>,
}

impl Reporter {
    /// Creates a new [`Reporter`] publishing via the given bus.
    #[must_use]
    pub fn new(
        host_id: i64,
        bus: Arc<dyn Bus>,
        settings: Arc<settings::Store>,
    ) -> Self {
        Self(Arc::new(Inner {
            host_id,
            bus,
            settings,
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            progress: Mutex::new(HashMap::new()),
            re_announce: AtomicBool::new(false),
            last_ok: Mutex::new(Instant::now()),
        }))
    }

    /// Enqueues a `STATUS_UPDATE` report.
    ///
    /// `PROGRESS` updates are throttled to at most one per stream per the
    /// configured interval; all other statuses are always enqueued.
    pub fn status(
        &self,
        stream_id: StreamId,
        status: Status,
        message: impl Into<String>,
        extra: Option<serde_json::Value>,
    ) {
        if status == Status::Progress && !self.admit_progress(stream_id) {
            return;
        }
        let message = message.into();
        log::debug!(
            "Reporting {:?} for stream {}: {}",
            status,
            stream_id,
            message,
        );
        self.enqueue_reliable(&StatusUpdate {
            r#type: "STATUS_UPDATE",
            stream_id,
            host_id: self.0.host_id,
            status,
            message,
            timestamp: Utc::now().timestamp(),
            extra,
        });
    }

    /// Enqueues a `RESTART_REQUEST` report asking the control plane to
    /// decide the stream's fate.
    pub fn restart_request(
        &self,
        stream_id: StreamId,
        reason: impl Into<String>,
        crash_count: u32,
        last_error: Option<String>,
        error_type: &'static str,
    ) {
        let reason = reason.into();
        log::warn!(
            "Requesting restart decision for stream {} (crash #{}): {}",
            stream_id,
            crash_count,
            reason,
        );
        self.enqueue_reliable(&RestartRequest {
            r#type: "RESTART_REQUEST",
            stream_id,
            host_id: self.0.host_id,
            reason,
            crash_count,
            last_error,
            error_type,
            timestamp: Utc::now().timestamp(),
        });
    }

    /// Enqueues a `HEARTBEAT` report with the given active-stream set.
    ///
    /// The re-announce flag is attached if a bus recovery was detected since
    /// the previous heartbeat, or if nothing was successfully published for
    /// over a minute.
    pub fn heartbeat(&self, active_streams: Vec<StreamId>) {
        let starving = self
            .0
            .last_ok
            .lock()
            .expect("Reporter last_ok mutex is poisoned")
            .elapsed()
            > Duration::from_secs(60);
        let re_announce =
            self.0.re_announce.swap(false, Ordering::Relaxed) || starving;
        if re_announce {
            log::info!(
                "Re-announcing {} active stream(s) to the control plane",
                active_streams.len(),
            );
        }
        let payload = to_payload(&Heartbeat {
            r#type: "HEARTBEAT",
            host_id: self.0.host_id,
            active_streams,
            timestamp: Utc::now().timestamp(),
            re_announce,
        });
        let mut queues = self.lock_queues();
        push_drop_oldest(&mut queues.heartbeat, REPORTS_CHANNEL, payload);
        drop(queues);
        self.0.notify.notify_one();
    }

    /// Enqueues a host stats snapshot.
    pub fn host_stats(&self, snapshot: &HostSnapshot) {
        let payload = to_payload(snapshot);
        let mut queues = self.lock_queues();
        push_drop_oldest(&mut queues.stats, STATS_CHANNEL, payload);
        drop(queues);
        self.0.notify.notify_one();
    }

    /// Runs the publisher loop, never returning.
    ///
    /// Intended to be spawned once; aborted on shutdown after a final
    /// [`Reporter::flush`].
    pub async fn run(self) {
        loop {
            let _ = time::timeout(
                Duration::from_millis(500),
                self.0.notify.notified(),
            )
            .await;
            self.drain().await;
        }
    }

    /// Attempts to publish everything still queued, ignoring the degraded
    /// gate. Used on shutdown so final `STOPPED` reports leave the agent.
    pub async fn flush(&self) {
        {
            let mut queues = self.lock_queues();
            queues.degraded = false;
            queues.ok_streak = RECONNECT_OK_STREAK;
        }
        self.drain().await;
    }

    /// Drains the telemetry queues, then the retained queue (unless held
    /// back by the degraded gate).
    async fn drain(&self) {
        // Telemetry first: droppable, and doubles as the connectivity probe
        // which re-opens the retained queue after a failure period.
        loop {
            let item = {
                let mut queues = self.lock_queues();
                queues
                    .heartbeat
                    .pop_front()
                    .or_else(|| queues.stats.pop_front())
            };
            let item = match item {
                Some(i) => i,
                None => break,
            };
            if !self.publish_one(&item).await {
                self.note_failure();
                return;
            }
            self.note_success();
        }

        loop {
            let item = {
                let mut queues = self.lock_queues();
                if queues.degraded && queues.ok_streak < RECONNECT_OK_STREAK {
                    return;
                }
                queues.reliable.pop_front()
            };
            let item = match item {
                Some(i) => i,
                None => break,
            };
            if self.publish_one(&item).await {
                self.note_success();
            } else {
                let mut queues = self.lock_queues();
                queues.reliable.push_front(item);
                drop(queues);
                self.note_failure();
                return;
            }
        }
    }

    /// Publishes one queued report, returning whether it succeeded.
    async fn publish_one(&self, item: &Outbound) -> bool {
        match self.0.bus.publish(item.channel, &item.payload).await {
            Ok(receivers) => {
                log::debug!(
                    "Published report to '{}' -> {} receivers",
                    item.channel,
                    receivers,
                );
                true
            }
            Err(e) => {
                log::warn!(
                    "Failed to publish report to '{}': {}",
                    item.channel,
                    e,
                );
                false
            }
        }
    }

    /// Serializes and enqueues one retained report.
    fn enqueue_reliable<T: Serialize>(&self, report: &T) {
        let payload = to_payload(report);
        let mut queues = self.lock_queues();
        if queues.reliable.len() >= RELIABLE_QUEUE_CAP {
            // Overflow of the retained queue is a fatal condition for the
            // reporting contract, though the agent itself carries on.
            log::crit!(
                "Retained report queue overflowed ({} entries), \
                 dropping the oldest report",
                queues.reliable.len(),
            );
            let _ = queues.reliable.pop_front();
        }
        queues.reliable.push_back(Outbound {
            channel: REPORTS_CHANNEL,
            payload,
        });
        drop(queues);
        self.0.notify.notify_one();
    }

    /// Checks whether a `PROGRESS` report of the given stream passes the
    /// throttle, stamping the passage.
    fn admit_progress(&self, stream_id: StreamId) -> bool {
        let interval = self.0.settings.snapshot().progress_throttle;
        let mut stamps = self
            .0
            .progress
            .lock()
            .expect("Reporter progress mutex is poisoned");
        let now = Instant::now();
        match stamps.get(&stream_id) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                let _ = stamps.insert(stream_id, now);
                true
            }
        }
    }

    /// Forgets the progress throttle stamp of the given stream.
    pub fn forget_stream(&self, stream_id: StreamId) {
        let _ = self
            .0
            .progress
            .lock()
            .expect("Reporter progress mutex is poisoned")
            .remove(&stream_id);
    }

    /// Records a successful publish, detecting recovery from a failure
    /// period.
    fn note_success(&self) {
        *self
            .0
            .last_ok
            .lock()
            .expect("Reporter last_ok mutex is poisoned") = Instant::now();
        let mut queues = self.lock_queues();
        queues.ok_streak = queues.ok_streak.saturating_add(1);
        if queues.degraded && queues.ok_streak >= RECONNECT_OK_STREAK {
            queues.degraded = false;
            drop(queues);
            log::info!(
                "Bus publishing recovered, flushing retained reports and \
                 scheduling a re-announce",
            );
            self.0.re_announce.store(true, Ordering::Relaxed);
        }
    }

    /// Records a failed publish, closing the retained queue gate.
    fn note_failure(&self) {
        let mut queues = self.lock_queues();
        queues.degraded = true;
        queues.ok_streak = 0;
    }

    /// Locks the queues, tolerating no poisoning.
    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.0.queues.lock().expect("Reporter queues mutex is poisoned")
    }
}

/// Serializes the given report into its JSON wire form.
fn to_payload<T: Serialize>(report: &T) -> Vec<u8> {
    serde_json::to_vec(report).expect("Report serialization cannot fail")
}

/// Pushes an entry into a drop-oldest telemetry queue.
fn push_drop_oldest(
    queue: &mut VecDeque<Outbound>,
    channel: &'static str,
    payload: Vec<u8>,
) {
    if queue.len() >= TELEMETRY_QUEUE_CAP {
        let _ = queue.pop_front();
    }
    queue.push_back(Outbound { channel, payload });
}

#[cfg(test)]
mod spec {
    use super::*;

    #[test]
    fn status_serializes_screaming() {
        for (status, expected) in &[
            (Status::Starting, "\"STARTING\""),
            (Status::Downloading, "\"DOWNLOADING\""),
            (Status::Streaming, "\"STREAMING\""),
            (Status::Stopping, "\"STOPPING\""),
            (Status::Stopped, "\"STOPPED\""),
            (Status::Error, "\"ERROR\""),
            (Status::Restarting, "\"RESTARTING\""),
            (Status::Updating, "\"UPDATING\""),
            (Status::Progress, "\"PROGRESS\""),
        ] {
            assert_eq!(&serde_json::to_string(status).unwrap(), expected);
        }
    }

    #[test]
    fn status_update_has_contract_fields() {
        let payload = serde_json::to_value(&StatusUpdate {
            r#type: "STATUS_UPDATE",
            stream_id: 123.into(),
            host_id: 7,
            status: Status::Streaming,
            message: "live".into(),
            timestamp: 1700000000,
            extra: None,
        })
        .unwrap();

        assert_eq!(payload["type"], "STATUS_UPDATE");
        assert_eq!(payload["stream_id"], 123);
        assert_eq!(payload["host_id"], 7);
        assert_eq!(payload["status"], "STREAMING");
        assert_eq!(payload["message"], "live");
        assert!(payload.get("extra").is_none());
    }

    #[test]
    fn heartbeat_omits_re_announce_unless_set() {
        let quiet = serde_json::to_value(&Heartbeat {
            r#type: "HEARTBEAT",
            host_id: 7,
            active_streams: vec![1.into(), 2.into()],
            timestamp: 0,
            re_announce: false,
        })
        .unwrap();
        assert!(quiet.get("re_announce").is_none());
        assert_eq!(quiet["active_streams"], serde_json::json!([1, 2]));

        let loud = serde_json::to_value(&Heartbeat {
            r#type: "HEARTBEAT",
            host_id: 7,
            active_streams: vec![],
            timestamp: 0,
            re_announce: true,
        })
        .unwrap();
        assert_eq!(loud["re_announce"], true);
    }

    #[test]
    fn restart_request_has_contract_fields() {
        let payload = serde_json::to_value(&RestartRequest {
            r#type: "RESTART_REQUEST",
            stream_id: 5.into(),
            host_id: 7,
            reason: "DTS".into(),
            crash_count: 6,
            last_error: Some("[DTS_ERRORS] storm".into()),
            error_type: "DTS_DISCONTINUITY",
            timestamp: 0,
        })
        .unwrap();

        assert_eq!(payload["type"], "RESTART_REQUEST");
        assert_eq!(payload["crash_count"], 6);
        assert_eq!(payload["error_type"], "DTS_DISCONTINUITY");
    }

    #[test]
    fn telemetry_queue_drops_oldest() {
        let mut queue = VecDeque::new();
        for n in 0..20u8 {
            push_drop_oldest(&mut queue, REPORTS_CHANNEL, vec![n]);
        }
        assert_eq!(queue.len(), TELEMETRY_QUEUE_CAP);
        assert_eq!(queue.front().unwrap().payload, vec![4]);
        assert_eq!(queue.back().unwrap().payload, vec![19]);
    }
}
