//! Runtime-tunable settings of the agent.
//!
//! Launch-immutable parameters live in [`crate::cli`]; everything here may
//! be refreshed at runtime via the `REFRESH_SETTINGS` command. Readers obtain
//! a coherent snapshot per operation; in-flight streams keep the snapshot
//! captured at their start until restarted.

use std::{
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};

use ezstream_log::log;
use serde::Deserialize;
use smart_default::SmartDefault;

use crate::state::EncoderMode;

/// Snapshot of all runtime-tunable knobs.
#[derive(Clone, Debug, PartialEq, SmartDefault)]
pub struct Tunables {
    /// Default mode of encoder processes.
    #[default(EncoderMode::Copy)]
    pub encoder_mode: EncoderMode,

    /// Default x264 preset for re-encoding.
    #[default(String::from("fast"))]
    pub preset: String,

    /// Default constant rate factor for re-encoding.
    #[default = 23]
    pub crf: u32,

    /// Default maximum video bitrate for re-encoding.
    #[default(String::from("3000k"))]
    pub maxrate: String,

    /// Default audio bitrate for re-encoding.
    #[default(String::from("128k"))]
    pub audio_bitrate: String,

    /// Default GOP size for re-encoding.
    #[default = 60]
    pub gop: u32,

    /// Time an encoder is given to exit after a graceful stop signal.
    #[default(Duration::from_secs(15))]
    pub graceful_shutdown_timeout: Duration,

    /// Time an encoder is given to die after SIGKILL before the stop is
    /// declared failed.
    #[default(Duration::from_secs(10))]
    pub force_kill_timeout: Duration,

    /// Maximum automatic restarts within one success-reset window before
    /// escalating to the control plane.
    #[default = 5]
    pub max_fast_restarts: u32,

    /// Base delay before an automatic restart.
    #[default(Duration::from_secs(2))]
    pub fast_restart_delay: Duration,

    /// Multiplier applied to the restart delay per consecutive restart.
    #[default = 2.0]
    pub restart_backoff_factor: f64,

    /// Upper bound of the automatic restart delay.
    #[default(Duration::from_secs(30))]
    pub restart_backoff_cap: Duration,

    /// Continuous encoder liveness resetting the restart counter.
    #[default(Duration::from_secs(300))]
    pub success_reset_window: Duration,

    /// Interval between heartbeats.
    #[default(Duration::from_secs(5))]
    pub heartbeat_interval: Duration,

    /// Interval between host stats reports.
    #[default(Duration::from_secs(15))]
    pub stats_report_interval: Duration,

    /// Minimum interval between `PROGRESS` reports of one stream.
    #[default(Duration::from_secs(2))]
    pub progress_throttle: Duration,

    /// Size of the command worker pool.
    #[default = 10]
    pub command_workers: usize,

    /// Host-wide bound on concurrent source downloads.
    #[default = 5]
    pub concurrent_downloads: usize,

    /// Attempts per source download before the staging fails.
    #[default = 3]
    pub download_retries: u32,

    /// Timeout of a single download request.
    #[default(Duration::from_secs(30))]
    pub download_timeout: Duration,

    /// Timeout of a media probe of one staged file.
    #[default(Duration::from_secs(5))]
    pub probe_timeout: Duration,

    /// Age after which an unreferenced staging directory is swept.
    #[default(Duration::from_secs(24 * 3600))]
    pub staging_retention: Duration,

    /// Period of the staging garbage collection sweeps.
    #[default(Duration::from_secs(3600))]
    pub sweep_period: Duration,
}

/// Partial update of [`Tunables`] received from the control plane.
///
/// Unknown fields are ignored; durations are humantime strings (`"15s"`,
/// `"24h"`).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Patch {
    /// New default encoder mode.
    pub encoder_mode: Option<EncoderMode>,
    /// New default x264 preset.
    pub preset: Option<String>,
    /// New default constant rate factor.
    pub crf: Option<u32>,
    /// New default maximum video bitrate.
    pub maxrate: Option<String>,
    /// New default audio bitrate.
    pub audio_bitrate: Option<String>,
    /// New default GOP size.
    pub gop: Option<u32>,
    /// New graceful stop timeout.
    #[serde(default, with = "serde_humantime")]
    pub graceful_shutdown_timeout: Option<Duration>,
    /// New force kill timeout.
    #[serde(default, with = "serde_humantime")]
    pub force_kill_timeout: Option<Duration>,
    /// New automatic restart budget.
    pub max_fast_restarts: Option<u32>,
    /// New base restart delay.
    #[serde(default, with = "serde_humantime")]
    pub fast_restart_delay: Option<Duration>,
    /// New restart delay multiplier.
    pub restart_backoff_factor: Option<f64>,
    /// New restart delay upper bound.
    #[serde(default, with = "serde_humantime")]
    pub restart_backoff_cap: Option<Duration>,
    /// New success-reset window.
    #[serde(default, with = "serde_humantime")]
    pub success_reset_window: Option<Duration>,
    /// New heartbeat interval.
    #[serde(default, with = "serde_humantime")]
    pub heartbeat_interval: Option<Duration>,
    /// New host stats interval.
    #[serde(default, with = "serde_humantime")]
    pub stats_report_interval: Option<Duration>,
    /// New progress throttle interval.
    #[serde(default, with = "serde_humantime")]
    pub progress_throttle: Option<Duration>,
    /// New command worker pool size.
    pub command_workers: Option<usize>,
    /// New concurrent downloads bound.
    pub concurrent_downloads: Option<usize>,
    /// New per-download attempts bound.
    pub download_retries: Option<u32>,
    /// New single download request timeout.
    #[serde(default, with = "serde_humantime")]
    pub download_timeout: Option<Duration>,
    /// New media probe timeout.
    #[serde(default, with = "serde_humantime")]
    pub probe_timeout: Option<Duration>,
    /// New staging retention age.
    #[serde(default, with = "serde_humantime")]
    pub staging_retention: Option<Duration>,
    /// New garbage collection period.
    #[serde(default, with = "serde_humantime")]
    pub sweep_period: Option<Duration>,
}

/// Store of the current [`Tunables`] snapshot.
///
/// Writes atomically replace the snapshot; readers never observe torn
/// values.
#[derive(Debug, Default)]
pub struct Store(RwLock<Arc<Tunables>>);

impl Store {
    /// Returns the current [`Tunables`] snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Tunables> {
        Arc::clone(&self.0.read().expect("Settings store is poisoned"))
    }

    /// Applies the given [`Patch`] onto the current snapshot, atomically
    /// replacing it.
    ///
    /// Returns descriptions of all effective changes (empty if the patch
    /// changed nothing).
    pub fn apply(&self, patch: Patch) -> Vec<String> {
        let mut next = Tunables::clone(&self.snapshot());
        let mut changed = Vec::new();

        merge("encoder_mode", &mut next.encoder_mode, patch.encoder_mode,
              &mut changed);
        merge("preset", &mut next.preset, patch.preset, &mut changed);
        merge("crf", &mut next.crf, patch.crf, &mut changed);
        merge("maxrate", &mut next.maxrate, patch.maxrate, &mut changed);
        merge("audio_bitrate", &mut next.audio_bitrate, patch.audio_bitrate,
              &mut changed);
        merge("gop", &mut next.gop, patch.gop, &mut changed);
        merge("graceful_shutdown_timeout", &mut next.graceful_shutdown_timeout,
              patch.graceful_shutdown_timeout, &mut changed);
        merge("force_kill_timeout", &mut next.force_kill_timeout,
              patch.force_kill_timeout, &mut changed);
        merge("max_fast_restarts", &mut next.max_fast_restarts,
              patch.max_fast_restarts, &mut changed);
        merge("fast_restart_delay", &mut next.fast_restart_delay,
              patch.fast_restart_delay, &mut changed);
        merge("restart_backoff_factor", &mut next.restart_backoff_factor,
              patch.restart_backoff_factor, &mut changed);
        merge("restart_backoff_cap", &mut next.restart_backoff_cap,
              patch.restart_backoff_cap, &mut changed);
        merge("success_reset_window", &mut next.success_reset_window,
              patch.success_reset_window, &mut changed);
        merge("heartbeat_interval", &mut next.heartbeat_interval,
              patch.heartbeat_interval, &mut changed);
        merge("stats_report_interval", &mut next.stats_report_interval,
              patch.stats_report_interval, &mut changed);
        merge("progress_throttle", &mut next.progress_throttle,
              patch.progress_throttle, &mut changed);
        merge("command_workers", &mut next.command_workers,
              patch.command_workers, &mut changed);
        merge("concurrent_downloads", &mut next.concurrent_downloads,
              patch.concurrent_downloads, &mut changed);
        merge("download_retries", &mut next.download_retries,
              patch.download_retries, &mut changed);
        merge("download_timeout", &mut next.download_timeout,
              patch.download_timeout, &mut changed);
        merge("probe_timeout", &mut next.probe_timeout, patch.probe_timeout,
              &mut changed);
        merge("staging_retention", &mut next.staging_retention,
              patch.staging_retention, &mut changed);
        merge("sweep_period", &mut next.sweep_period, patch.sweep_period,
              &mut changed);

        if !changed.is_empty() {
            *self.0.write().expect("Settings store is poisoned") =
                Arc::new(next);
            log::info!("Settings updated: {}", changed.join(", "));
        }
        changed
    }
}

/// Overwrites `dst` with the patched value, recording the effective change.
fn merge<T: PartialEq + fmt::Debug>(
    name: &str,
    dst: &mut T,
    src: Option<T>,
    changed: &mut Vec<String>,
) {
    if let Some(new) = src {
        if *dst != new {
            changed.push(format!("{}: {:?} -> {:?}", name, dst, new));
            *dst = new;
        }
    }
}

#[cfg(test)]
mod spec {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let t = Tunables::default();
        assert_eq!(t.graceful_shutdown_timeout, Duration::from_secs(15));
        assert_eq!(t.force_kill_timeout, Duration::from_secs(10));
        assert_eq!(t.max_fast_restarts, 5);
        assert_eq!(t.fast_restart_delay, Duration::from_secs(2));
        assert_eq!(t.success_reset_window, Duration::from_secs(300));
        assert_eq!(t.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(t.stats_report_interval, Duration::from_secs(15));
        assert_eq!(t.progress_throttle, Duration::from_secs(2));
        assert_eq!(t.command_workers, 10);
        assert_eq!(t.concurrent_downloads, 5);
        assert_eq!(t.download_retries, 3);
    }

    #[test]
    fn applies_partial_patch_atomically() {
        let store = Store::default();
        let patch: Patch = serde_json::from_value(serde_json::json!({
            "max_fast_restarts": 7,
            "heartbeat_interval": "10s",
            "unknown_future_knob": true,
        }))
        .unwrap();

        let changed = store.apply(patch);

        assert_eq!(changed.len(), 2);
        let snap = store.snapshot();
        assert_eq!(snap.max_fast_restarts, 7);
        assert_eq!(snap.heartbeat_interval, Duration::from_secs(10));
        // Untouched knobs keep their defaults.
        assert_eq!(snap.command_workers, 10);
    }

    #[test]
    fn reports_no_changes_for_identical_values() {
        let store = Store::default();
        let patch = Patch {
            max_fast_restarts: Some(5),
            ..Patch::default()
        };
        assert!(store.apply(patch).is_empty());
    }

    #[test]
    fn in_flight_snapshots_are_unaffected() {
        let store = Store::default();
        let captured = store.snapshot();
        let _ = store.apply(Patch {
            max_fast_restarts: Some(9),
            ..Patch::default()
        });
        assert_eq!(captured.max_fast_restarts, 5);
        assert_eq!(store.snapshot().max_fast_restarts, 9);
    }
}
