//! Agent's state: per-stream specifications, runtime records and the
//! registry tracking them.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use derive_more::{Display, From, Into};
use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{ffmpeg, settings::Tunables};

/// ID of a [`Stream`] assigned by the control plane.
///
/// Unique within one host at any instant.
///
/// [`Stream`]: StreamSpec
#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, From, Hash, Into, Ord,
    PartialEq, PartialOrd, Serialize,
)]
pub struct StreamId(i64);

/// Source of media for a stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceRef {
    /// Remote file to be downloaded into the staging directory.
    Remote {
        /// HTTP(S) URL to download the file from.
        url: Url,

        /// Size of the file advertised by the control plane, if any.
        ///
        /// Used to verify completeness of the downloaded file.
        size: Option<u64>,

        /// Preferred name of the staged file, if any.
        filename: Option<String>,
    },

    /// Local file to be validated in place.
    Local(PathBuf),
}

/// RTMP endpoint a stream is published onto.
///
/// Its [`Display`] implementation redacts the stream key, so the full
/// endpoint never leaks into logs or reports. Use
/// [`RtmpEndpoint::unredacted`] only for handing the destination to the
/// encoder process.
///
/// [`Display`]: std::fmt::Display
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RtmpEndpoint(Url);

impl RtmpEndpoint {
    /// Creates a new [`RtmpEndpoint`] out of the given [`Url`], verifying its
    /// scheme.
    #[must_use]
    pub fn new(url: Url) -> Option<Self> {
        matches!(url.scheme(), "rtmp" | "rtmps").then(|| Self(url))
    }

    /// Returns the full unredacted endpoint for passing to the encoder.
    #[inline]
    #[must_use]
    pub fn unredacted(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for RtmpEndpoint {
    /// Prints this [`RtmpEndpoint`] with its last path segment (the stream
    /// key) masked out.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let full = self.0.as_str();
        match full.trim_end_matches('/').rfind('/') {
            Some(pos) if pos > "rtmps://".len() => {
                write!(f, "{}/****", &full[..pos])
            }
            _ => write!(f, "{}", full),
        }
    }
}

/// Mode of the encoder process publishing a stream.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderMode {
    /// Remux the source as-is, repairing timestamps only.
    Copy,

    /// Re-encode the source with the configured tuning.
    Reencode,
}

/// Order of playing multiple sources of one stream.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackOrder {
    /// Sources are played in the order they were specified.
    Sequential,

    /// Sources are played in a random order.
    ///
    /// Not implemented: treated as [`PlaybackOrder::Sequential`] with a
    /// warning until the control plane clarifies the intended semantics.
    Random,
}

/// Re-encoding tuning knobs of a stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncoderTuning {
    /// x264 preset (`ultrafast`..`veryslow`).
    pub preset: String,

    /// Constant rate factor.
    pub crf: u32,

    /// Maximum video bitrate (e.g. `3000k`).
    pub maxrate: String,

    /// Audio bitrate (e.g. `128k`).
    pub audio_bitrate: String,

    /// GOP (keyframe interval) size in frames.
    pub gop: u32,
}

/// Specification of one stream, immutable for the duration of one start and
/// replaced atomically on update.
#[derive(Clone, Debug)]
pub struct StreamSpec {
    /// ID of this stream.
    pub id: StreamId,

    /// Ordered sources of media to publish (never empty).
    pub sources: Vec<SourceRef>,

    /// RTMP endpoint to publish onto.
    pub destination: RtmpEndpoint,

    /// Indicator whether the playlist is looped forever.
    pub looped: bool,

    /// Order of playing multiple sources.
    pub playback_order: PlaybackOrder,

    /// Indicator whether staged files are kept on disk once the stream
    /// stops.
    pub keep_files_after_stop: bool,

    /// Mode of the encoder process.
    pub encoder_mode: EncoderMode,

    /// Re-encoding tuning (meaningful in [`EncoderMode::Reencode`] only).
    pub tuning: EncoderTuning,
}

/// Media staged on the local filesystem for one stream.
#[derive(Clone, Debug)]
pub struct StagedMedia {
    /// Absolute paths of the staged files, in play order.
    pub local_files: Vec<PathBuf>,

    /// Path of the concat playlist file.
    ///
    /// Present iff there is more than one staged file.
    pub playlist_path: Option<PathBuf>,

    /// Time when this media was staged.
    pub created_at: SystemTime,

    /// Time when this media was last touched by the stager.
    pub last_touched: SystemTime,
}

impl StagedMedia {
    /// Returns the path to feed the encoder with: the playlist if there is
    /// one, the single staged file otherwise.
    #[must_use]
    pub fn input_path(&self) -> &Path {
        self.playlist_path
            .as_deref()
            .unwrap_or_else(|| &self.local_files[0])
    }
}

/// State of one stream in its lifecycle.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum StreamState {
    /// Stream is accepted and its encoder is about to be spawned.
    #[display(fmt = "STARTING")]
    Starting,

    /// Sources of the stream are being staged to disk.
    #[display(fmt = "DOWNLOADING")]
    Downloading,

    /// Encoder process is live and publishing.
    #[display(fmt = "STREAMING")]
    Streaming,

    /// Stream is being stopped on request.
    #[display(fmt = "STOPPING")]
    Stopping,

    /// Encoder has failed and is being re-spawned in-band.
    #[display(fmt = "RESTARTING")]
    Restarting,

    /// Stream is being switched onto newly staged sources.
    #[display(fmt = "UPDATING")]
    Updating,

    /// Stream has failed terminally and awaits the control plane's decision.
    #[display(fmt = "ERROR")]
    Error,
}

impl StreamState {
    /// Indicates whether a stream in this state is counted as active and so
    /// included into heartbeats.
    #[inline]
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting
                | Self::Downloading
                | Self::Streaming
                | Self::Restarting
                | Self::Updating
        )
    }
}

/// Intent recorded on a [`StreamRecord`] before its encoder is signalled to
/// stop, allowing the exit classifier to distinguish "we asked for this"
/// from "it died".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopIntent {
    /// Stop requested by the control plane.
    User,

    /// Stop is a part of switching onto an updated specification.
    Update,

    /// Stop is a part of the agent's shutdown.
    Shutdown,

    /// Stop forced by the supervisor upon a fatal encoder error.
    Fatal,
}

/// Kind of an error condition detected on the encoder's stderr or at its
/// exit.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// Non-monotonous DTS in the output.
    DtsDiscontinuity,

    /// Non-monotonous PTS in the output.
    PtsDiscontinuity,

    /// Input file is missing.
    FileNotFound,

    /// Input file is not accessible.
    Permission,

    /// Destination refused the connection.
    ConnRefused,

    /// Connection to the destination timed out.
    ConnTimeout,

    /// Input data is corrupt or incomplete.
    Corrupt,

    /// Encoder ran out of memory.
    Oom,

    /// RTMP-level error reported by the destination.
    Rtmp,

    /// No specific condition crossed its threshold.
    Unknown,
}

/// Set of stderr patterns matched against encoder log lines.
///
/// Index layout is fixed; [`ErrorKind::scan`] interprets the matches.
static STDERR_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new(&[
        r"(?i)no such file or directory",
        r"(?i)permission denied",
        r"(?i)invalid data found|moov atom not found",
        r"(?i)cannot allocate memory|out of memory",
        r"(?i)non-monotonous dts",
        r"(?i)non-monotonous pts",
        r"(?i)connection refused",
        r"(?i)timed out",
        r"(?i)server returned 4\d\d",
        r"(?i)rtmp",
        r"(?i)error",
    ])
    .unwrap()
});

impl ErrorKind {
    /// Scans one stderr line for a known error condition.
    ///
    /// More specific conditions win over the generic RTMP one, as FFmpeg
    /// mentions the `rtmp://` destination in most of its network errors.
    #[must_use]
    pub fn scan(line: &str) -> Option<Self> {
        let m = STDERR_PATTERNS.matches(line);
        if m.matched(0) {
            return Some(Self::FileNotFound);
        }
        if m.matched(1) {
            return Some(Self::Permission);
        }
        if m.matched(2) {
            return Some(Self::Corrupt);
        }
        if m.matched(3) {
            return Some(Self::Oom);
        }
        if m.matched(4) {
            return Some(Self::DtsDiscontinuity);
        }
        if m.matched(5) {
            return Some(Self::PtsDiscontinuity);
        }
        if m.matched(6) {
            return Some(Self::ConnRefused);
        }
        if m.matched(7) {
            return Some(Self::ConnTimeout);
        }
        if m.matched(8) || (m.matched(9) && m.matched(10)) {
            return Some(Self::Rtmp);
        }
        None
    }

    /// Number of occurrences of this [`ErrorKind`] within one encoder run
    /// that triggers a reaction.
    #[must_use]
    pub fn threshold(self) -> u32 {
        match self {
            Self::DtsDiscontinuity
            | Self::PtsDiscontinuity
            | Self::ConnRefused
            | Self::ConnTimeout
            | Self::Rtmp => 3,
            Self::FileNotFound
            | Self::Permission
            | Self::Corrupt
            | Self::Oom
            | Self::Unknown => 1,
        }
    }

    /// Indicates whether this [`ErrorKind`] is fatal, i.e. never worth an
    /// automatic restart.
    #[inline]
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::FileNotFound | Self::Permission | Self::Corrupt | Self::Oom,
        )
    }

    /// Wire name of this [`ErrorKind`] used as `error_type` of restart
    /// requests.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::DtsDiscontinuity => "DTS_DISCONTINUITY",
            Self::PtsDiscontinuity => "PTS_DISCONTINUITY",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::Permission => "PERMISSION",
            Self::ConnRefused => "CONN_REFUSED",
            Self::ConnTimeout => "CONN_TIMEOUT",
            Self::Corrupt => "CORRUPT",
            Self::Oom => "OOM",
            Self::Rtmp => "RTMP",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Short reason of this [`ErrorKind`] used in restart requests.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::DtsDiscontinuity => "DTS",
            Self::PtsDiscontinuity => "PTS",
            Self::ConnRefused | Self::ConnTimeout | Self::Rtmp => "NET",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::Permission => "PERMISSION",
            Self::Corrupt => "CORRUPT",
            Self::Oom => "OOM",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Human-readable description of this [`ErrorKind`] for report
    /// messages.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::DtsDiscontinuity => "Non-monotonous DTS in output",
            Self::PtsDiscontinuity => "Non-monotonous PTS in output",
            Self::FileNotFound => "Input file missing",
            Self::Permission => "Cannot access input file",
            Self::ConnRefused => "Cannot connect to RTMP server",
            Self::ConnTimeout => "Network timeout",
            Self::Corrupt => "Invalid or incomplete input data",
            Self::Oom => "Encoder ran out of memory",
            Self::Rtmp => "RTMP streaming error",
            Self::Unknown => "Encoder exited unexpectedly",
        }
    }

    /// Bracketed tag of this [`ErrorKind`] prepended to human-readable
    /// report messages.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::DtsDiscontinuity => "[DTS_ERRORS]",
            Self::PtsDiscontinuity => "[PTS_ERRORS]",
            Self::FileNotFound => "[FILE_NOT_FOUND]",
            Self::Permission => "[PERMISSION_ERROR]",
            Self::ConnRefused => "[CONNECTION_ERROR]",
            Self::ConnTimeout => "[TIMEOUT]",
            Self::Corrupt => "[CORRUPTED_DATA]",
            Self::Oom => "[OUT_OF_MEMORY]",
            Self::Rtmp => "[RTMP_ERROR]",
            Self::Unknown => "[UNKNOWN_ERROR]",
        }
    }
}

/// Last classified error of a stream, kept for reporting.
#[derive(Clone, Debug)]
pub struct ClassifiedError {
    /// Kind of the error.
    pub kind: ErrorKind,

    /// Human-readable message, prefixed with the kind's bracketed tag.
    pub message: String,
}

/// Classification of one encoder exit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitKind {
    /// Encoder finished with code 0 on its own.
    ///
    /// Unexpected for looping streams and surfaced as ended.
    NormalExit,

    /// Encoder was stopped on the control plane's request.
    UserStop,

    /// Encoder was stopped as a part of the agent's shutdown.
    SystemStop,

    /// Encoder was stopped to switch onto an updated specification.
    Updating,

    /// Encoder was stopped by the supervisor upon a fatal stderr condition.
    FatalStop,

    /// Encoder was killed from outside the agent.
    ExternalKill,

    /// Encoder died on its own, with the dominant [`ErrorKind`] attached.
    Crash(ErrorKind),
}

/// Classifies an encoder exit as a pure function of its exit status, the
/// recorded stop intent and the dominant stderr [`ErrorKind`].
///
/// A recorded intent always wins: an exit the agent asked for is never a
/// crash, whatever the exit code. Exit code 137 is normalized to an OOM
/// crash. A termination by SIGKILL/SIGTERM/SIGINT with no recorded intent is
/// an [`ExitKind::ExternalKill`].
#[must_use]
pub fn classify_exit(
    code: Option<i32>,
    signal: Option<i32>,
    intent: Option<StopIntent>,
    dominant: Option<ErrorKind>,
) -> ExitKind {
    match intent {
        Some(StopIntent::User) => return ExitKind::UserStop,
        Some(StopIntent::Shutdown) => return ExitKind::SystemStop,
        Some(StopIntent::Update) => return ExitKind::Updating,
        Some(StopIntent::Fatal) => return ExitKind::FatalStop,
        None => {}
    }
    match (code, signal) {
        (Some(0), _) => ExitKind::NormalExit,
        (Some(137), _) => ExitKind::Crash(ErrorKind::Oom),
        (_, Some(sig))
            if sig == libc::SIGKILL
                || sig == libc::SIGTERM
                || sig == libc::SIGINT =>
        {
            ExitKind::ExternalKill
        }
        _ => ExitKind::Crash(dominant.unwrap_or(ErrorKind::Unknown)),
    }
}

/// Specification and staged media of an update prepared while the previous
/// encoder is still running.
#[derive(Clone, Debug)]
pub struct PendingUpdate {
    /// New specification to switch onto.
    pub spec: StreamSpec,

    /// Media staged into the scratch directory, pending promotion.
    pub scratch: StagedMedia,
}

/// Aggregate of everything the agent knows about one stream.
///
/// Created on start, destroyed on terminal stop.
#[derive(Debug)]
pub struct StreamRecord {
    /// Current specification of the stream.
    pub spec: StreamSpec,

    /// Current state of the stream.
    pub state: StreamState,

    /// Media staged for the stream, if staging has completed.
    pub staged: Option<StagedMedia>,

    /// Handle of the live encoder process, if any.
    pub child: Option<Arc<ffmpeg::ChildHandle>>,

    /// Time when the stream was started.
    pub start_time: SystemTime,

    /// Time of the last state transition.
    pub last_transition: SystemTime,

    /// Automatic restarts since the last successful run.
    pub restart_count: u32,

    /// Automatic restarts over the stream's lifetime.
    pub total_restarts: u32,

    /// Last classified error of the stream.
    pub last_error: Option<ClassifiedError>,

    /// Intent recorded before the encoder is signalled to stop.
    pub stop_intent: Option<StopIntent>,

    /// Error kind of an in-band fast-restart trigger raised by the stderr
    /// reader, consumed by the exit policy.
    pub pending_trigger: Option<ErrorKind>,

    /// Update staged and awaiting the switch.
    pub pending_update: Option<PendingUpdate>,

    /// Tunables snapshot captured when the stream started.
    ///
    /// In-flight streams keep their original knobs until restarted.
    pub tunables: Arc<Tunables>,
}

impl StreamRecord {
    /// Creates a new [`StreamRecord`] for the given `spec` in the
    /// [`StreamState::Starting`] state.
    #[must_use]
    pub fn new(spec: StreamSpec, tunables: Arc<Tunables>) -> Self {
        let now = SystemTime::now();
        Self {
            spec,
            state: StreamState::Starting,
            staged: None,
            child: None,
            start_time: now,
            last_transition: now,
            restart_count: 0,
            total_restarts: 0,
            last_error: None,
            stop_intent: None,
            pending_trigger: None,
            pending_update: None,
            tunables,
        }
    }

    /// Transitions this [`StreamRecord`] into the given `state`.
    pub fn transition(&mut self, state: StreamState) {
        self.state = state;
        self.last_transition = SystemTime::now();
    }
}

/// Registry of all streams of this agent.
///
/// The registry mutex guards the "exactly one record, at most one live
/// child" invariant and is only ever held for short lookups and updates;
/// long-running operations happen outside of it. It's never held while a
/// per-stream restart lock is acquired.
#[derive(Debug, Default)]
pub struct Registry {
    /// All tracked streams, by ID.
    streams: Mutex<HashMap<StreamId, StreamRecord>>,

    /// Per-stream locks serializing start/stop/update/fast-restart.
    restart_locks: Mutex<HashMap<StreamId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Registry {
    /// Inserts the given `record` into this [`Registry`].
    ///
    /// # Errors
    ///
    /// If a record with the same [`StreamId`] exists already.
    pub fn insert(&self, record: StreamRecord) -> Result<(), anyhow::Error> {
        use std::collections::hash_map::Entry;

        let id = record.spec.id;
        match self.lock_streams().entry(id) {
            Entry::Occupied(_) => {
                Err(anyhow::anyhow!("Stream {} is running already", id))
            }
            Entry::Vacant(e) => {
                let _ = e.insert(record);
                Ok(())
            }
        }
    }

    /// Removes the record of the given stream, along with its restart lock.
    pub fn remove(&self, id: StreamId) -> Option<StreamRecord> {
        let removed = self.lock_streams().remove(&id);
        if removed.is_some() {
            let _ = self.restart_locks_mutex().remove(&id);
        }
        removed
    }

    /// Applies the given function to the record of the given stream, if any.
    pub fn with<R>(
        &self,
        id: StreamId,
        f: impl FnOnce(&mut StreamRecord) -> R,
    ) -> Option<R> {
        self.lock_streams().get_mut(&id).map(f)
    }

    /// Returns the current [`StreamState`] of the given stream, if any.
    #[must_use]
    pub fn state_of(&self, id: StreamId) -> Option<StreamState> {
        self.lock_streams().get(&id).map(|r| r.state)
    }

    /// Indicates whether the given stream is tracked at all.
    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool {
        self.lock_streams().contains_key(&id)
    }

    /// Returns IDs of all tracked streams.
    #[must_use]
    pub fn ids(&self) -> Vec<StreamId> {
        self.lock_streams().keys().copied().collect()
    }

    /// Returns IDs of all streams in an active state, sorted for stable
    /// heartbeats.
    #[must_use]
    pub fn active_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self
            .lock_streams()
            .iter()
            .filter_map(|(id, r)| r.state.is_active().then(|| *id))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the restart lock of the given stream, creating one if absent.
    #[must_use]
    pub fn restart_lock(&self, id: StreamId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.restart_locks_mutex()
                .entry(id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Locks the streams map, tolerating no poisoning.
    fn lock_streams(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<StreamId, StreamRecord>> {
        self.streams.lock().expect("Registry mutex is poisoned")
    }

    /// Locks the restart locks map, tolerating no poisoning.
    fn restart_locks_mutex(
        &self,
    ) -> std::sync::MutexGuard<
        '_,
        HashMap<StreamId, Arc<tokio::sync::Mutex<()>>>,
    > {
        self.restart_locks
            .lock()
            .expect("Registry restart locks mutex is poisoned")
    }
}

#[cfg(test)]
mod spec {
    use super::*;

    mod rtmp_endpoint {
        use super::*;

        #[test]
        fn redacts_stream_key() {
            for (input, expected) in &[
                (
                    "rtmp://a.rtmp.youtube.com/live2/secret-key",
                    "rtmp://a.rtmp.youtube.com/live2/****",
                ),
                ("rtmps://example.com/app/key", "rtmps://example.com/app/****"),
            ] {
                let url = Url::parse(input).unwrap();
                let actual =
                    RtmpEndpoint::new(url).unwrap().to_string();
                assert_eq!(&actual, expected);
            }
        }

        #[test]
        fn rejects_non_rtmp_schemes() {
            for input in &["http://example.com/x", "file:///tmp/x"] {
                let url = Url::parse(input).unwrap();
                assert!(RtmpEndpoint::new(url).is_none(), "allows {}", input);
            }
        }

        #[test]
        fn keeps_unredacted_form_intact() {
            let url =
                Url::parse("rtmp://example.com/live/abc").unwrap();
            let endpoint = RtmpEndpoint::new(url).unwrap();
            assert_eq!(endpoint.unredacted(), "rtmp://example.com/live/abc");
        }
    }

    mod error_kind {
        use super::*;

        #[test]
        fn scans_known_patterns() {
            for (line, expected) in &[
                (
                    "[flv @ 0x55] Non-monotonous DTS in output stream 0:1",
                    ErrorKind::DtsDiscontinuity,
                ),
                (
                    "Non-monotonous PTS in output stream",
                    ErrorKind::PtsDiscontinuity,
                ),
                (
                    "/tmp/in.mp4: No such file or directory",
                    ErrorKind::FileNotFound,
                ),
                ("/tmp/in.mp4: Permission denied", ErrorKind::Permission),
                (
                    "rtmp://x/live/k: Connection refused",
                    ErrorKind::ConnRefused,
                ),
                ("Connection timed out", ErrorKind::ConnTimeout),
                (
                    "Invalid data found when processing input",
                    ErrorKind::Corrupt,
                ),
                ("moov atom not found", ErrorKind::Corrupt),
                ("Cannot allocate memory", ErrorKind::Oom),
                (
                    "RTMP error: handshake failed",
                    ErrorKind::Rtmp,
                ),
                ("Server returned 403 Forbidden", ErrorKind::Rtmp),
            ] {
                assert_eq!(
                    ErrorKind::scan(line),
                    Some(*expected),
                    "line: {}",
                    line,
                );
            }
        }

        #[test]
        fn ignores_benign_lines() {
            for line in &[
                "frame= 1000 fps= 25 q=-1.0 size=   10kB",
                "Stream mapping: Stream #0:0 -> #0:0 (copy)",
                "rtmp://example.com/live opened for writing",
            ] {
                assert_eq!(ErrorKind::scan(line), None, "line: {}", line);
            }
        }

        #[test]
        fn fatal_kinds_have_unit_threshold() {
            for kind in &[
                ErrorKind::FileNotFound,
                ErrorKind::Permission,
                ErrorKind::Corrupt,
                ErrorKind::Oom,
            ] {
                assert!(kind.is_fatal());
                assert_eq!(kind.threshold(), 1);
            }
        }

        #[test]
        fn transient_kinds_require_three() {
            for kind in &[
                ErrorKind::DtsDiscontinuity,
                ErrorKind::PtsDiscontinuity,
                ErrorKind::ConnRefused,
                ErrorKind::ConnTimeout,
                ErrorKind::Rtmp,
            ] {
                assert!(!kind.is_fatal());
                assert_eq!(kind.threshold(), 3);
            }
        }
    }

    mod exit_classification {
        use super::*;

        #[test]
        fn intent_always_wins() {
            for (intent, expected) in &[
                (StopIntent::User, ExitKind::UserStop),
                (StopIntent::Shutdown, ExitKind::SystemStop),
                (StopIntent::Update, ExitKind::Updating),
                (StopIntent::Fatal, ExitKind::FatalStop),
            ] {
                // Even a non-zero exit code with an OOM-looking status is
                // not a crash once an intent was recorded.
                let actual = classify_exit(
                    Some(137),
                    None,
                    Some(*intent),
                    Some(ErrorKind::Oom),
                );
                assert_eq!(actual, *expected);
            }
        }

        #[test]
        fn zero_exit_is_normal() {
            assert_eq!(
                classify_exit(Some(0), None, None, None),
                ExitKind::NormalExit,
            );
        }

        #[test]
        fn oom_code_is_normalized() {
            assert_eq!(
                classify_exit(Some(137), None, None, None),
                ExitKind::Crash(ErrorKind::Oom),
            );
        }

        #[test]
        fn unintended_signals_are_external_kills() {
            for sig in &[libc::SIGKILL, libc::SIGTERM, libc::SIGINT] {
                assert_eq!(
                    classify_exit(None, Some(*sig), None, None),
                    ExitKind::ExternalKill,
                );
            }
        }

        #[test]
        fn crash_carries_dominant_kind() {
            assert_eq!(
                classify_exit(
                    Some(1),
                    None,
                    None,
                    Some(ErrorKind::DtsDiscontinuity),
                ),
                ExitKind::Crash(ErrorKind::DtsDiscontinuity),
            );
            assert_eq!(
                classify_exit(Some(1), None, None, None),
                ExitKind::Crash(ErrorKind::Unknown),
            );
        }
    }

    mod stream_state {
        use super::*;

        #[test]
        fn active_states_match_heartbeat_contract() {
            for (state, active) in &[
                (StreamState::Starting, true),
                (StreamState::Downloading, true),
                (StreamState::Streaming, true),
                (StreamState::Restarting, true),
                (StreamState::Updating, true),
                (StreamState::Stopping, false),
                (StreamState::Error, false),
            ] {
                assert_eq!(state.is_active(), *active, "state: {}", state);
            }
        }
    }
}
