//! [FFmpeg]-based encoder process supervision.
//!
//! One [`Encoder`] owns one FFmpeg child publishing one stream: building its
//! command line, spawning it in its own process group, watching its stderr
//! for known error conditions in real time, and driving the graceful→force
//! stop ladder.
//!
//! [FFmpeg]: https://ffmpeg.org

use std::{
    collections::{HashMap, VecDeque},
    os::unix::process::ExitStatusExt as _,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::anyhow;
use ezstream_log::log;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{mpsc, watch},
    time,
};

use crate::state::{EncoderMode, ErrorKind, StreamSpec};

/// Capacity of the stderr tail ring buffer.
const STDERR_TAIL_CAP: usize = 1000;

/// Time the encoder is given to exit after a `q` on its stdin.
const QUIT_KEY_TIMEOUT: Duration = Duration::from_secs(3);

/// Grace between SIGTERM and SIGKILL when tearing a child down for an
/// in-band restart.
const RESTART_KILL_GRACE: Duration = Duration::from_secs(2);

/// Period of health score recovery while the child stays alive.
const HEALTH_RECOVERY_PERIOD: Duration = Duration::from_secs(60);

/// Threshold crossing raised by the stderr reader.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Trigger {
    /// Kind of the error condition that crossed its threshold.
    pub kind: ErrorKind,
}

/// Shared handle to a live encoder process.
///
/// The [`Encoder`] owns the child itself; this handle carries what the rest
/// of the agent needs to observe and stop it.
#[derive(Debug)]
pub struct ChildHandle {
    /// PID of the child, which doubles as its process group ID.
    pub pid: i32,

    /// Command line the child was spawned with, destination redacted.
    pub command_line: String,

    /// Moment the child was spawned.
    pub spawn_time: Instant,

    /// Stdin of the child, consumed by the quit-key step of the stop
    /// ladder.
    stdin: Mutex<Option<ChildStdin>>,

    /// Occurrences of each [`ErrorKind`] on the child's stderr.
    counters: Mutex<HashMap<ErrorKind, u32>>,

    /// Ring buffer of the latest stderr lines.
    tail: Mutex<VecDeque<String>>,

    /// Health score in `[0.1, 1.0]`, for reporting only.
    health: Mutex<f64>,

    /// Signalled `true` once the child has been reaped.
    exited: watch::Receiver<bool>,
}

impl ChildHandle {
    /// Records one stderr line into the tail ring buffer.
    fn push_tail(&self, line: String) {
        let mut tail = self.lock_tail();
        if tail.len() >= STDERR_TAIL_CAP {
            let _ = tail.pop_front();
        }
        tail.push_back(line);
    }

    /// Returns the last `n` stderr lines joined together.
    #[must_use]
    pub fn stderr_tail(&self, n: usize) -> String {
        let tail = self.lock_tail();
        let skip = tail.len().saturating_sub(n);
        tail.iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Increments the counter of the given [`ErrorKind`], returning its new
    /// value.
    fn bump(&self, kind: ErrorKind) -> u32 {
        let mut counters = self
            .counters
            .lock()
            .expect("ChildHandle counters mutex is poisoned");
        let count = counters.entry(kind).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the dominant [`ErrorKind`] of this run: the one that crossed
    /// its threshold, preferring the most frequent.
    #[must_use]
    pub fn dominant_error(&self) -> Option<ErrorKind> {
        self.counters
            .lock()
            .expect("ChildHandle counters mutex is poisoned")
            .iter()
            .filter(|(kind, count)| **count >= kind.threshold())
            .max_by_key(|(_, count)| **count)
            .map(|(kind, _)| *kind)
    }

    /// Current health score of the child.
    #[must_use]
    pub fn health(&self) -> f64 {
        *self.health.lock().expect("ChildHandle health mutex is poisoned")
    }

    /// Degrades the health score by one classified error event.
    fn degrade_health(&self) {
        let mut health =
            self.health.lock().expect("ChildHandle health mutex is poisoned");
        *health = (*health - 0.2).max(0.1);
    }

    /// Recovers the health score by one period of continuous liveness.
    fn recover_health(&self) {
        let mut health =
            self.health.lock().expect("ChildHandle health mutex is poisoned");
        *health = (*health + 0.1).min(1.0);
    }

    /// Waits for the child to be reaped, up to the given `timeout`.
    ///
    /// Returns whether the child is known to have exited.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut exited = self.exited.clone();
        if *exited.borrow() {
            return true;
        }
        time::timeout(timeout, async {
            while exited.changed().await.is_ok() {
                if *exited.borrow() {
                    return true;
                }
            }
            // The sender is only dropped after signalling the exit.
            true
        })
        .await
        .unwrap_or(false)
    }

    /// Indicates whether the child is known to have exited already.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn lock_tail(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.tail.lock().expect("ChildHandle tail mutex is poisoned")
    }
}

/// Live encoder process of one stream.
#[derive(Debug)]
pub struct Encoder {
    /// The spawned FFmpeg child.
    pub child: Child,

    /// Shared handle to the child.
    pub handle: Arc<ChildHandle>,

    /// Threshold crossings raised by the stderr reader.
    pub triggers: mpsc::Receiver<Trigger>,

    /// Signals `exited` on the handle once the child is reaped.
    exited_tx: watch::Sender<bool>,
}

impl Encoder {
    /// Marks the child as reaped, releasing every stop-ladder waiter.
    pub fn mark_exited(&self) {
        let _ = self.exited_tx.send(true);
    }
}

/// Spawns a new encoder process for the given `spec` reading the given
/// staged `input`.
///
/// The child gets its own process group so that group signals reach any
/// grandchildren, a piped stdin for the quit key, and a dedicated stderr
/// reader maintaining the error counters of its [`ChildHandle`].
///
/// # Errors
///
/// If the FFmpeg binary cannot be spawned.
pub fn spawn(
    ffmpeg_path: &Path,
    spec: &StreamSpec,
    input: &Path,
    is_playlist: bool,
) -> Result<Encoder, anyhow::Error> {
    let args = build_args(spec, input, is_playlist);

    let mut cmd = Command::new(ffmpeg_path);
    let _ = cmd
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn FFmpeg: {}", e))?;
    let pid = child
        .id()
        .ok_or_else(|| anyhow!("Spawned FFmpeg has no PID"))?
        as i32;

    let command_line = redact_args(&args, spec);
    log::info!(
        "Spawned FFmpeg (PID {}) for stream {}: {} {}",
        pid,
        spec.id,
        ffmpeg_path.display(),
        command_line,
    );

    let stdin = child.stdin.take();
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("FFmpeg's stderr hasn't been captured"))?;

    let (exited_tx, exited_rx) = watch::channel(false);
    let handle = Arc::new(ChildHandle {
        pid,
        command_line,
        spawn_time: Instant::now(),
        stdin: Mutex::new(stdin),
        counters: Mutex::new(HashMap::new()),
        tail: Mutex::new(VecDeque::with_capacity(64)),
        health: Mutex::new(1.0),
        exited: exited_rx,
    });

    let (trigger_tx, trigger_rx) = mpsc::channel(8);
    drop(tokio::spawn(read_stderr(
        stderr,
        Arc::clone(&handle),
        trigger_tx,
    )));
    drop(tokio::spawn(recover_health(Arc::clone(&handle))));

    Ok(Encoder {
        child,
        handle,
        triggers: trigger_rx,
        exited_tx,
    })
}

/// Consumes the child's stderr line by line, maintaining the error counters
/// and raising a [`Trigger`] the moment a threshold crosses.
async fn read_stderr(
    stderr: tokio::process::ChildStderr,
    handle: Arc<ChildHandle>,
    triggers: mpsc::Sender<Trigger>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Failed to read FFmpeg stderr: {}", e);
                break;
            }
        };
        let kind = ErrorKind::scan(&line);
        handle.push_tail(line);
        if let Some(kind) = kind {
            let count = handle.bump(kind);
            handle.degrade_health();
            if count == kind.threshold() {
                log::warn!(
                    "Encoder PID {} crossed {} threshold ({} events)",
                    handle.pid,
                    kind.name(),
                    count,
                );
                // A full queue means an earlier trigger is being handled
                // already.
                let _ = triggers.try_send(Trigger { kind });
            }
        }
    }
}

/// Recovers the child's health score while it stays alive.
async fn recover_health(handle: Arc<ChildHandle>) {
    loop {
        time::sleep(HEALTH_RECOVERY_PERIOD).await;
        if handle.has_exited() {
            return;
        }
        handle.recover_health();
    }
}

/// Builds the FFmpeg argument list for the given `spec` and staged `input`.
#[must_use]
pub fn build_args(
    spec: &StreamSpec,
    input: &Path,
    is_playlist: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-re".into(),
    ];

    if is_playlist {
        args.extend(["-f".into(), "concat".into(), "-safe".into(), "0".into()]);
    }
    if spec.looped {
        args.extend(["-stream_loop".into(), "-1".into()]);
    }
    args.extend(["-i".into(), input.display().to_string()]);

    match spec.encoder_mode {
        EncoderMode::Copy => {
            args.extend([
                "-c".into(),
                "copy".into(),
                "-avoid_negative_ts".into(),
                "make_zero".into(),
                "-fflags".into(),
                "+genpts".into(),
            ]);
        }
        EncoderMode::Reencode => {
            let t = &spec.tuning;
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                t.preset.clone(),
                "-crf".into(),
                t.crf.to_string(),
                "-maxrate".into(),
                t.maxrate.clone(),
                "-bufsize".into(),
                double_rate(&t.maxrate),
                "-g".into(),
                t.gop.to_string(),
                "-pix_fmt".into(),
                "yuv420p".into(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                t.audio_bitrate.clone(),
                "-ar".into(),
                "44100".into(),
                "-ac".into(),
                "2".into(),
            ]);
        }
    }

    args.extend([
        "-f".into(),
        "flv".into(),
        spec.destination.unredacted().to_owned(),
    ]);
    args
}

/// Doubles a bitrate value like `3000k` or `4M`, preserving its unit
/// suffix. Used for deriving `-bufsize` from `-maxrate`.
#[must_use]
pub fn double_rate(rate: &str) -> String {
    let digits_end = rate
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| rate.len());
    match rate[..digits_end].parse::<u64>() {
        Ok(n) => format!("{}{}", n * 2, &rate[digits_end..]),
        Err(_) => rate.to_owned(),
    }
}

/// Renders the argument list with the destination replaced by its redacted
/// form, for logs and debugging.
fn redact_args(args: &[String], spec: &StreamSpec) -> String {
    args.iter()
        .map(|arg| {
            if arg == spec.destination.unredacted() {
                spec.destination.to_string()
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tears the child down for an in-band restart: SIGTERM to the group, a
/// short grace, then SIGKILL.
///
/// Doesn't observe the exit itself: the caller runs this concurrently with
/// reaping the child (its supervisor owns the exit future), so a child
/// dying within the grace is reaped right away and never sees the SIGKILL.
/// The exited watch is of no use here, as it only fires once that same
/// supervisor has reaped the child.
pub async fn kill_for_restart(handle: &ChildHandle) {
    signal_group(handle.pid, Signal::SIGTERM);
    time::sleep(RESTART_KILL_GRACE).await;
    signal_group(handle.pid, Signal::SIGKILL);
}

/// Sends SIGKILL to the child's whole process group without any grace.
///
/// Last resort of the shutdown drain and of stop/spawn races where the
/// stop intent is already recorded.
pub fn force_kill(handle: &ChildHandle) {
    signal_group(handle.pid, Signal::SIGKILL);
}

/// Runs the graceful→force stop ladder on the given child.
///
/// The caller must have recorded its stop intent on the stream record
/// beforehand, so the pending exit event classifies as a stop rather than a
/// crash.
///
/// 1. `q` on stdin, waiting [`QUIT_KEY_TIMEOUT`];
/// 2. SIGINT to the process group, waiting `graceful_timeout`;
/// 3. SIGKILL to the process group, waiting `force_timeout`.
///
/// Steps 1 and 2 are skipped entirely when `graceful_timeout` is zero.
///
/// # Errors
///
/// If the child is still alive after the whole ladder.
pub async fn stop(
    handle: &ChildHandle,
    graceful_timeout: Duration,
    force_timeout: Duration,
) -> Result<(), anyhow::Error> {
    if handle.has_exited() {
        return Ok(());
    }

    if !graceful_timeout.is_zero() {
        let stdin_taken = handle
            .stdin
            .lock()
            .expect("ChildHandle stdin mutex is poisoned")
            .take();
        if let Some(mut stdin) = stdin_taken {
            // FFmpeg finalizes its output on `q` where signals may not be
            // handled mid-write.
            let quit = async move {
                stdin.write_all(b"q\n").await?;
                stdin.flush().await
            };
            if let Err(e) = quit.await {
                log::debug!(
                    "Failed to write quit key to PID {}: {}",
                    handle.pid,
                    e,
                );
            }
        }
        if handle.wait_exited(QUIT_KEY_TIMEOUT).await {
            return Ok(());
        }

        signal_group(handle.pid, Signal::SIGINT);
        if handle.wait_exited(graceful_timeout).await {
            return Ok(());
        }
        log::warn!(
            "Encoder PID {} ignored graceful stop, sending SIGKILL",
            handle.pid,
        );
    }

    signal_group(handle.pid, Signal::SIGKILL);
    if handle.wait_exited(force_timeout.max(Duration::from_millis(100))).await
    {
        return Ok(());
    }
    Err(anyhow!(
        "Encoder PID {} is still alive after SIGKILL",
        handle.pid,
    ))
}

/// Sends the given signal to the child's process group, tolerating an
/// already-gone group.
fn signal_group(pid: i32, signal: Signal) {
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => {
            log::warn!(
                "Failed to send {} to process group {}: {}",
                signal,
                pid,
                e,
            );
        }
    }
}

/// Splits an [`ExitStatus`] into its exit code and terminating signal.
#[must_use]
pub fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), status.signal())
}

#[cfg(test)]
mod spec {
    use url::Url;

    use crate::state::{
        EncoderTuning, PlaybackOrder, RtmpEndpoint, SourceRef,
    };

    use super::*;

    fn spec_with(mode: EncoderMode, looped: bool) -> StreamSpec {
        StreamSpec {
            id: 1.into(),
            sources: vec![SourceRef::Local("/tmp/a.mp4".into())],
            destination: RtmpEndpoint::new(
                Url::parse("rtmp://example.com/live/abc").unwrap(),
            )
            .unwrap(),
            looped,
            playback_order: PlaybackOrder::Sequential,
            keep_files_after_stop: false,
            encoder_mode: mode,
            tuning: EncoderTuning {
                preset: "fast".into(),
                crf: 23,
                maxrate: "3000k".into(),
                audio_bitrate: "128k".into(),
                gop: 60,
            },
        }
    }

    #[test]
    fn copy_single_source_command_line() {
        let args = build_args(
            &spec_with(EncoderMode::Copy, true),
            Path::new("/tmp/a.mp4"),
            false,
        );
        assert_eq!(
            args,
            vec![
                "-hide_banner",
                "-loglevel",
                "error",
                "-re",
                "-stream_loop",
                "-1",
                "-i",
                "/tmp/a.mp4",
                "-c",
                "copy",
                "-avoid_negative_ts",
                "make_zero",
                "-fflags",
                "+genpts",
                "-f",
                "flv",
                "rtmp://example.com/live/abc",
            ],
        );
    }

    #[test]
    fn copy_playlist_uses_concat_demuxer() {
        let args = build_args(
            &spec_with(EncoderMode::Copy, true),
            Path::new("/tmp/1/playlist_1.txt"),
            true,
        );
        let head: Vec<&str> = args.iter().map(String::as_str).take(10).collect();
        assert_eq!(
            head,
            vec![
                "-hide_banner",
                "-loglevel",
                "error",
                "-re",
                "-f",
                "concat",
                "-safe",
                "0",
                "-stream_loop",
                "-1",
            ],
        );
        assert!(args.contains(&"/tmp/1/playlist_1.txt".to_owned()));
    }

    #[test]
    fn loop_flag_tracks_spec() {
        let args = build_args(
            &spec_with(EncoderMode::Copy, false),
            Path::new("/tmp/a.mp4"),
            false,
        );
        assert!(!args.contains(&"-stream_loop".to_owned()));
    }

    #[test]
    fn reencode_command_line_carries_tuning() {
        let args = build_args(
            &spec_with(EncoderMode::Reencode, true),
            Path::new("/tmp/a.mp4"),
            false,
        );
        for window in &[
            &["-c:v", "libx264"][..],
            &["-preset", "fast"][..],
            &["-crf", "23"][..],
            &["-maxrate", "3000k"][..],
            &["-bufsize", "6000k"][..],
            &["-g", "60"][..],
            &["-pix_fmt", "yuv420p"][..],
            &["-c:a", "aac"][..],
            &["-b:a", "128k"][..],
            &["-ar", "44100"][..],
            &["-ac", "2"][..],
        ] {
            let pos = args.iter().position(|a| a == window[0]);
            let pos = pos.unwrap_or_else(|| {
                panic!("missing flag {}", window[0])
            });
            assert_eq!(args[pos + 1], window[1], "flag {}", window[0]);
        }
    }

    #[test]
    fn doubles_rates_preserving_suffix() {
        for (input, expected) in &[
            ("3000k", "6000k"),
            ("4M", "8M"),
            ("2500", "5000"),
            ("auto", "auto"),
        ] {
            assert_eq!(&double_rate(input), expected);
        }
    }

    #[test]
    fn redacts_destination_in_command_line() {
        let spec = spec_with(EncoderMode::Copy, true);
        let args = build_args(&spec, Path::new("/tmp/a.mp4"), false);
        let rendered = redact_args(&args, &spec);
        assert!(!rendered.contains("abc"), "stream key leaked: {}", rendered);
        assert!(rendered.contains("rtmp://example.com/live/****"));
    }
}
