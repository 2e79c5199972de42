//! Per-stream lifecycle management.
//!
//! Every started stream is driven by one supervisor task walking the state
//! machine: stage sources → spawn the encoder → observe it → classify its
//! exit → decide between finalizing, escalating and re-spawning. Commands
//! from the control plane interact with the supervisor through the stream's
//! record and restart lock.

use std::{convert::TryFrom, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::anyhow;
use ezstream_log::log;
use futures::{FutureExt as _, TryFutureExt as _};
use tokio::time;

use crate::{
    agent::Agent,
    ffmpeg,
    report::Status,
    settings::Tunables,
    state::{
        classify_exit, ClassifiedError, ErrorKind, ExitKind, PendingUpdate,
        PlaybackOrder, StagedMedia, StopIntent, StreamId, StreamRecord,
        StreamSpec, StreamState,
    },
};

/// Time a freshly spawned encoder must stay alive before the stream is
/// considered live.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Global deadline of stopping all streams on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// What a supervisor found at one of its cancellation checkpoints.
enum Checkpoint {
    /// Nothing changed, carry on.
    Proceed,

    /// A stop arrived; finalize the stream.
    Stop,

    /// An update is staged and pending the switch.
    Update(PendingUpdate),

    /// The record is gone; the supervisor has nothing left to do.
    Gone,
}

/// Outcome of the crash policy.
enum CrashOutcome {
    /// Budget allows another in-band restart.
    Respawn,

    /// A pending update preempted the restart.
    Update(PendingUpdate),

    /// The stream was finalized one way or another.
    Done,
}

impl Agent {
    /// Accepts a new stream, creating its record and spawning its
    /// supervisor task.
    ///
    /// Returns as soon as the record exists; progress is reported through
    /// state-transition reports.
    ///
    /// # Errors
    ///
    /// If the spec is unusable or a stream with this ID is running already.
    pub fn start_stream(&self, spec: StreamSpec) -> Result<(), anyhow::Error> {
        let id = spec.id;
        anyhow::ensure!(!spec.sources.is_empty(), "Stream {} has no sources", id);
        if spec.playback_order == PlaybackOrder::Random {
            log::warn!(
                "Random playback order of stream {} is not implemented, \
                 playing sequentially",
                id,
            );
        }

        let record = StreamRecord::new(spec, self.settings().snapshot());
        self.registry().insert(record)?;
        self.reporter().status(id, Status::Starting, "Preparing stream", None);

        let agent = self.clone();
        drop(tokio::spawn(
            AssertUnwindSafe(async move { agent.drive(id).await })
                .catch_unwind()
                .unwrap_or_else(move |p| {
                    log::crit!(
                        "Panicked while supervising stream {}: {}",
                        id,
                        crate::display_panic(&p),
                    );
                }),
        ));
        Ok(())
    }

    /// Stops the given stream with the given intent.
    ///
    /// Idempotent: stopping an absent stream is a no-op and publishes
    /// nothing. `force` clamps the graceful timeouts to zero, going
    /// straight to SIGKILL.
    ///
    /// # Errors
    ///
    /// If the encoder outlives even SIGKILL.
    pub async fn stop_stream(
        &self,
        id: StreamId,
        intent: StopIntent,
        force: bool,
    ) -> Result<(), anyhow::Error> {
        // The intent must be recorded before any signal reaches the child,
        // so its exit never classifies as a crash.
        let recorded = self.registry().with(id, |r| {
            r.stop_intent = Some(intent);
            r.transition(StreamState::Stopping);
            (r.child.clone(), Arc::clone(&r.tunables))
        });
        let (child, tunables) = match recorded {
            Some(r) => r,
            None => {
                log::debug!("Stream {} is not running, stop is a no-op", id);
                return Ok(());
            }
        };

        let why = match intent {
            StopIntent::Shutdown => "Stopping stream - agent shutdown",
            _ => "Stopping stream - user request",
        };
        self.reporter().status(id, Status::Stopping, why, None);

        if let Some(handle) = child {
            let lock = self.registry().restart_lock(id);
            let _guard = lock.lock().await;
            let graceful = if force {
                Duration::ZERO
            } else {
                tunables.graceful_shutdown_timeout
            };
            ffmpeg::stop(&handle, graceful, tunables.force_kill_timeout)
                .await?;
        }
        // With no live child the supervisor observes the STOPPING state at
        // its next checkpoint and finalizes.
        Ok(())
    }

    /// Updates a live stream onto a new specification without interrupting
    /// it while the new sources stage.
    ///
    /// The new sources stage into a scratch directory while the old encoder
    /// keeps publishing; only once they validate is the old encoder stopped
    /// and the stream switched. On staging failure the update rolls back
    /// with no effect on the running stream.
    ///
    /// # Errors
    ///
    /// If the stream is not live, or the old encoder fails to stop.
    pub async fn update_stream(
        &self,
        id: StreamId,
        new_spec: StreamSpec,
    ) -> Result<(), anyhow::Error> {
        let lock = self.registry().restart_lock(id);
        let _guard = lock.lock().await;

        let tunables = self
            .registry()
            .with(id, |r| {
                (r.state == StreamState::Streaming)
                    .then(|| Arc::clone(&r.tunables))
            })
            .flatten()
            .ok_or_else(|| {
                anyhow!("Stream {} is not live, cannot update", id)
            })?;

        let _ = self
            .registry()
            .with(id, |r| r.transition(StreamState::Updating));
        self.reporter().status(
            id,
            Status::Updating,
            format!(
                "Staging {} updated source file(s)",
                new_spec.sources.len(),
            ),
            None,
        );

        let scratch_dir = self.stager().scratch_dir(id);
        let reporter = self.reporter().clone();
        let staged = self
            .stager()
            .stage(id, &new_spec.sources, &scratch_dir, &tunables, move |pct| {
                reporter.status(
                    id,
                    Status::Progress,
                    format!("Downloading updated sources: {}%", pct),
                    Some(serde_json::json!({ "progress_percentage": pct })),
                );
            })
            .await;

        let scratch = match staged {
            Ok(staged) => staged,
            Err(e) => {
                // Roll back: the running stream is untouched.
                self.stager().cleanup_scratch(id).await;
                let _ = self.registry().with(id, |r| {
                    if r.state == StreamState::Updating {
                        r.transition(StreamState::Streaming);
                    }
                });
                self.reporter().status(
                    id,
                    Status::Error,
                    format!("[STAGING_FAILED] update failed: {}", e),
                    None,
                );
                return Ok(());
            }
        };

        // A stop that arrived while staging wins over the update.
        let swap = self.registry().with(id, |r| {
            if r.state != StreamState::Updating || r.stop_intent.is_some() {
                None
            } else {
                r.pending_update = Some(PendingUpdate {
                    spec: new_spec,
                    scratch,
                });
                r.stop_intent = Some(StopIntent::Update);
                Some(r.child.clone())
            }
        });
        match swap {
            None | Some(None) => {
                self.stager().cleanup_scratch(id).await;
                Ok(())
            }
            Some(Some(child)) => {
                if let Some(handle) = child {
                    ffmpeg::stop(
                        &handle,
                        tunables.graceful_shutdown_timeout,
                        tunables.force_kill_timeout,
                    )
                    .await?;
                }
                // With no live child the supervisor's checkpoint picks the
                // pending update up on its own.
                Ok(())
            }
        }
    }

    /// Removes the staged files of the given stream.
    ///
    /// # Errors
    ///
    /// If the stream is active and `force` is not set.
    pub async fn cleanup_files(
        &self,
        id: StreamId,
        force: bool,
    ) -> Result<(), anyhow::Error> {
        if let Some(state) = self.registry().state_of(id) {
            if state.is_active() && !force {
                anyhow::bail!(
                    "Stream {} is active, refusing to remove its files \
                     without force",
                    id,
                );
            }
        }
        self.stager().cleanup_stream(id).await;
        Ok(())
    }

    /// Emits an immediate heartbeat carrying the current active-stream set.
    pub fn sync_state(&self) {
        self.reporter().heartbeat(self.registry().active_ids());
    }

    /// Stops every live stream with the shutdown intent, bounded by a
    /// global deadline, force-killing whatever encoder survives it.
    pub async fn shutdown_streams(&self) {
        let ids = self.registry().ids();
        if ids.is_empty() {
            return;
        }
        log::info!("Stopping {} live stream(s) for shutdown", ids.len());

        let stops = futures::future::join_all(
            ids.iter()
                .map(|id| self.stop_stream(*id, StopIntent::Shutdown, false)),
        );
        if time::timeout(SHUTDOWN_DEADLINE, stops).await.is_err() {
            log::warn!(
                "Shutdown deadline exceeded, force-killing remaining \
                 encoders",
            );
            for id in self.registry().ids() {
                if let Some(Some(handle)) =
                    self.registry().with(id, |r| r.child.clone())
                {
                    ffmpeg::force_kill(&handle);
                }
            }
        }

        // Let the supervisor tasks emit their final STOPPED reports.
        let _ = time::timeout(Duration::from_secs(5), async {
            while !self.registry().ids().is_empty() {
                time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
    }

    /// Supervises one stream from staging to its terminal state.
    async fn drive(self, id: StreamId) {
        if let Some(staged) = self.stage_phase(id).await {
            self.encoder_loop(id, staged).await;
        }
    }

    /// Stages the stream's sources, reporting progress.
    ///
    /// Returns [`None`] once the stream has been finalized (staging failed,
    /// or a stop raced the staging).
    async fn stage_phase(&self, id: StreamId) -> Option<StagedMedia> {
        let (sources, tunables) = self.registry().with(id, |r| {
            r.transition(StreamState::Downloading);
            (r.spec.sources.clone(), Arc::clone(&r.tunables))
        })?;
        self.reporter().status(
            id,
            Status::Downloading,
            format!("Preparing {} source file(s)", sources.len()),
            None,
        );

        let dir = self.stager().stream_dir(id);
        let reporter = self.reporter().clone();
        let staged = match self
            .stager()
            .stage(id, &sources, &dir, &tunables, move |pct| {
                reporter.status(
                    id,
                    Status::Progress,
                    format!("Downloading sources: {}%", pct),
                    Some(serde_json::json!({ "progress_percentage": pct })),
                );
            })
            .await
        {
            Ok(staged) => staged,
            Err(e) => {
                if self.registry().state_of(id)
                    == Some(StreamState::Stopping)
                {
                    self.finish_stopped(id, "Stream stopped").await;
                } else {
                    self.fail_stream(id, format!("[STAGING_FAILED] {}", e))
                        .await;
                }
                return None;
            }
        };

        if self.registry().state_of(id) == Some(StreamState::Stopping) {
            self.finish_stopped(id, "Stream stopped").await;
            return None;
        }

        self.registry().with(id, |r| {
            r.staged = Some(staged.clone());
            r.transition(StreamState::Starting);
        })?;
        Some(staged)
    }

    /// Spawns and re-spawns the stream's encoder until a terminal exit.
    async fn encoder_loop(&self, id: StreamId, mut staged: StagedMedia) {
        'run: loop {
            let (spec, tunables) = match self
                .registry()
                .with(id, |r| (r.spec.clone(), Arc::clone(&r.tunables)))
            {
                Some(s) => s,
                None => return,
            };

            let mut encoder = match ffmpeg::spawn(
                &self.opts().ffmpeg_path,
                &spec,
                staged.input_path(),
                staged.playlist_path.is_some(),
            ) {
                Ok(encoder) => encoder,
                Err(e) => {
                    self.fail_stream(id, format!("[SPAWN_FAILED] {}", e))
                        .await;
                    return;
                }
            };
            let handle = Arc::clone(&encoder.handle);

            if self
                .registry()
                .with(id, |r| r.child = Some(Arc::clone(&handle)))
                .is_none()
            {
                // The record vanished mid-spawn; don't leave an orphan.
                ffmpeg::force_kill(&handle);
                let _ = encoder.child.wait().await;
                encoder.mark_exited();
                return;
            }

            // The encoder must survive a settle delay before the stream
            // counts as live.
            let settle =
                time::timeout(SETTLE_DELAY, encoder.child.wait()).await;
            let status = match settle {
                Ok(early_exit) => early_exit,
                Err(_) => {
                    let promoted = self
                        .registry()
                        .with(id, |r| {
                            if r.stop_intent.is_none()
                                && r.state != StreamState::Stopping
                            {
                                r.transition(StreamState::Streaming);
                                true
                            } else {
                                false
                            }
                        })
                        .unwrap_or(false);
                    if promoted {
                        self.reporter().status(
                            id,
                            Status::Streaming,
                            "Stream is live",
                            None,
                        );
                    } else {
                        // A stop raced the spawn and its intent is already
                        // recorded; tear the child down right away.
                        ffmpeg::force_kill(&handle);
                    }
                    self.monitor(id, &mut encoder).await
                }
            };

            encoder.mark_exited();
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    let _ = self.registry().with(id, |r| r.child = None);
                    self.fail_stream(
                        id,
                        format!(
                            "[UNKNOWN_ERROR] Failed to observe encoder: {}",
                            e,
                        ),
                    )
                    .await;
                    return;
                }
            };

            let runtime = handle.spawn_time.elapsed();
            let exit_info = self.registry().with(id, |r| {
                r.child = None;
                if runtime >= tunables.success_reset_window {
                    r.restart_count = 0;
                }
                (r.stop_intent, r.pending_trigger.take(), r.restart_count)
            });
            let (intent, trigger_kind, restart_count) = match exit_info {
                Some(i) => i,
                None => return,
            };

            let (code, signal) = ffmpeg::exit_parts(status);
            let dominant = trigger_kind.or_else(|| handle.dominant_error());
            let exit = classify_exit(code, signal, intent, dominant);
            log::info!(
                "Encoder of stream {} exited as {:?} (code {:?}, signal \
                 {:?}) after {:?}",
                id,
                exit,
                code,
                signal,
                runtime,
            );

            match exit {
                ExitKind::UserStop => {
                    self.finish_stopped(id, "Stream stopped by user").await;
                    return;
                }
                ExitKind::SystemStop => {
                    self.finish_stopped(id, "Stream stopped - agent shutdown")
                        .await;
                    return;
                }
                ExitKind::NormalExit => {
                    // Unexpected for looping streams, but the encoder is
                    // done and said so.
                    self.finish_stopped(id, "Playback ended").await;
                    return;
                }
                ExitKind::Updating => {
                    let pending = self
                        .registry()
                        .with(id, |r| r.pending_update.take())
                        .flatten();
                    match pending {
                        Some(pending) => {
                            match self.apply_update(id, pending).await {
                                Some(new_staged) => {
                                    staged = new_staged;
                                    continue 'run;
                                }
                                None => return,
                            }
                        }
                        // The update was aborted after the intent was
                        // recorded; nothing to switch onto.
                        None => {
                            self.finish_stopped(id, "Stream stopped").await;
                            return;
                        }
                    }
                }
                ExitKind::FatalStop => {
                    let kind = dominant.unwrap_or(ErrorKind::Unknown);
                    self.escalate(id, kind, restart_count + 1, &handle);
                    return;
                }
                ExitKind::Crash(_) | ExitKind::ExternalKill => {
                    // An external kill is treated as a crash, and the
                    // stderr evidence (or a consumed restart trigger) still
                    // names its kind: an in-band teardown reaps as a signal
                    // death, yet must restart and escalate under the kind
                    // that provoked it.
                    let kind = match exit {
                        ExitKind::Crash(kind) => kind,
                        _ => dominant.unwrap_or(ErrorKind::Unknown),
                    };
                    if kind.is_fatal() {
                        self.escalate(id, kind, restart_count + 1, &handle);
                        return;
                    }
                    match self
                        .crash_policy(id, kind, &tunables, &handle)
                        .await
                    {
                        CrashOutcome::Respawn => continue 'run,
                        CrashOutcome::Update(pending) => {
                            match self.apply_update(id, pending).await {
                                Some(new_staged) => {
                                    staged = new_staged;
                                    continue 'run;
                                }
                                None => return,
                            }
                        }
                        CrashOutcome::Done => return,
                    }
                }
            }
        }
    }

    /// Observes a live encoder until it exits, reacting to stderr
    /// threshold crossings with in-band teardowns.
    async fn monitor(
        &self,
        id: StreamId,
        encoder: &mut ffmpeg::Encoder,
    ) -> std::io::Result<std::process::ExitStatus> {
        loop {
            let trigger = tokio::select! {
                status = encoder.child.wait() => return status,
                trigger = encoder.triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    // The stderr reader is gone; just await the exit.
                    None => return encoder.child.wait().await,
                },
            };
            if !self.note_trigger(id, trigger) {
                continue;
            }
            // Tear the child down while keeping its exit polled, so a death
            // within the SIGTERM grace is reaped right away and skips the
            // SIGKILL.
            tokio::select! {
                status = encoder.child.wait() => return status,
                () = ffmpeg::kill_for_restart(&encoder.handle) => {}
            }
            return encoder.child.wait().await;
        }
    }

    /// Records a stderr threshold crossing on the stream's record, so the
    /// exit policy can decide on a restart.
    ///
    /// Returns whether the encoder should be torn down for it.
    fn note_trigger(&self, id: StreamId, trigger: ffmpeg::Trigger) -> bool {
        // Stops and updates own the child; don't fight them.
        if self.registry().state_of(id) != Some(StreamState::Streaming) {
            return false;
        }
        let _ = self.registry().with(id, |r| {
            if trigger.kind.is_fatal() {
                r.stop_intent = Some(StopIntent::Fatal);
            }
            r.pending_trigger = Some(trigger.kind);
        });
        log::warn!(
            "Tearing encoder of stream {} down upon {}",
            id,
            trigger.kind.name(),
        );
        true
    }

    /// Decides what happens after a non-fatal crash: another in-band
    /// restart within the budget, or an escalation to the control plane.
    async fn crash_policy(
        &self,
        id: StreamId,
        kind: ErrorKind,
        tunables: &Tunables,
        handle: &ffmpeg::ChildHandle,
    ) -> CrashOutcome {
        let restart_count = match self
            .registry()
            .with(id, |r| r.restart_count)
        {
            Some(count) => count,
            None => return CrashOutcome::Done,
        };
        if restart_count >= tunables.max_fast_restarts {
            self.escalate(id, kind, restart_count + 1, handle);
            return CrashOutcome::Done;
        }

        let lock = self.registry().restart_lock(id);
        let _guard = lock.lock().await;

        match self.checkpoint(id) {
            Checkpoint::Proceed => {}
            Checkpoint::Stop => {
                self.finish_stopped(id, "Stream stopped").await;
                return CrashOutcome::Done;
            }
            Checkpoint::Update(pending) => {
                return CrashOutcome::Update(pending)
            }
            Checkpoint::Gone => return CrashOutcome::Done,
        }

        let attempt = match self.registry().with(id, |r| {
            r.restart_count += 1;
            r.total_restarts += 1;
            r.last_error = Some(ClassifiedError {
                kind,
                message: format!("{} {}", kind.tag(), kind.describe()),
            });
            r.transition(StreamState::Restarting);
            r.restart_count
        }) {
            Some(attempt) => attempt,
            None => return CrashOutcome::Done,
        };
        self.reporter().status(
            id,
            Status::Restarting,
            format!(
                "{} {}, restarting encoder (attempt {}/{})",
                kind.tag(),
                kind.describe(),
                attempt,
                tunables.max_fast_restarts,
            ),
            Some(serde_json::json!({ "health_score": handle.health() })),
        );

        time::sleep(restart_delay(tunables, attempt)).await;

        // A stop or update may have preempted the restart while sleeping.
        match self.checkpoint(id) {
            Checkpoint::Proceed => {
                match self
                    .registry()
                    .with(id, |r| r.transition(StreamState::Starting))
                {
                    Some(()) => CrashOutcome::Respawn,
                    None => CrashOutcome::Done,
                }
            }
            Checkpoint::Stop => {
                self.finish_stopped(id, "Stream stopped").await;
                CrashOutcome::Done
            }
            Checkpoint::Update(pending) => CrashOutcome::Update(pending),
            Checkpoint::Gone => CrashOutcome::Done,
        }
    }

    /// Reads what, if anything, preempted the supervisor since its last
    /// look at the record.
    fn checkpoint(&self, id: StreamId) -> Checkpoint {
        self.registry()
            .with(id, |r| match r.state {
                StreamState::Stopping => Checkpoint::Stop,
                StreamState::Updating => match r.pending_update.take() {
                    Some(pending) => Checkpoint::Update(pending),
                    None => Checkpoint::Proceed,
                },
                _ => Checkpoint::Proceed,
            })
            .unwrap_or(Checkpoint::Gone)
    }

    /// Switches the stream onto the staged update, promoting its scratch
    /// files into place.
    ///
    /// Returns the promoted media, or [`None`] once the stream has been
    /// finalized because the promotion failed.
    async fn apply_update(
        &self,
        id: StreamId,
        pending: PendingUpdate,
    ) -> Option<StagedMedia> {
        let PendingUpdate { spec, scratch } = pending;
        match self.stager().promote_scratch(id, scratch).await {
            Ok(staged) => {
                self.registry().with(id, |r| {
                    r.spec = spec;
                    r.staged = Some(staged.clone());
                    r.stop_intent = None;
                    r.pending_trigger = None;
                    r.transition(StreamState::Starting);
                })?;
                log::info!("Stream {} switched onto updated sources", id);
                Some(staged)
            }
            Err(e) => {
                self.fail_stream(
                    id,
                    format!("[STAGING_FAILED] update switch failed: {}", e),
                )
                .await;
                None
            }
        }
    }

    /// Finalizes a stopped stream: staged files are removed (unless kept
    /// by spec), the record is dropped and the terminal report goes out.
    async fn finish_stopped(&self, id: StreamId, message: &str) {
        let keep = self
            .registry()
            .with(id, |r| r.spec.keep_files_after_stop)
            .unwrap_or(true);
        if !keep {
            self.stager().cleanup_stream(id).await;
        }
        let _ = self.registry().remove(id);
        self.reporter().forget_stream(id);
        self.reporter().status(id, Status::Stopped, message, None);
    }

    /// Finalizes a terminally failed stream without asking the control
    /// plane for a restart (staging and spawn failures).
    ///
    /// Staged files are left for the sweeper, so a re-issued START within
    /// the retention window can reuse them.
    async fn fail_stream(&self, id: StreamId, message: String) {
        let _ = self.registry().with(id, |r| {
            r.transition(StreamState::Error);
            r.last_error = Some(ClassifiedError {
                kind: ErrorKind::Unknown,
                message: message.clone(),
            });
        });
        log::error!("Stream {} failed: {}", id, message);
        self.reporter().status(id, Status::Error, message, None);
        let _ = self.registry().remove(id);
        self.reporter().forget_stream(id);
    }

    /// Escalates a stream to the control plane: terminal ERROR report plus
    /// a restart request carrying the crash evidence.
    fn escalate(
        &self,
        id: StreamId,
        kind: ErrorKind,
        crash_count: u32,
        handle: &ffmpeg::ChildHandle,
    ) {
        let message = format!("{} {}", kind.tag(), kind.describe());
        let _ = self.registry().with(id, |r| {
            r.transition(StreamState::Error);
            r.last_error = Some(ClassifiedError {
                kind,
                message: message.clone(),
            });
        });
        log::error!(
            "Stream {} escalated to the control plane after {} crash(es): {}",
            id,
            crash_count,
            message,
        );
        self.reporter().status(
            id,
            Status::Error,
            message.clone(),
            Some(serde_json::json!({ "health_score": handle.health() })),
        );

        let tail = handle.stderr_tail(5);
        let last_error = if tail.is_empty() { message } else { tail };
        self.reporter().restart_request(
            id,
            kind.reason(),
            crash_count,
            Some(last_error),
            kind.name(),
        );

        let _ = self.registry().remove(id);
        self.reporter().forget_stream(id);
    }
}

/// Computes the delay before the given restart attempt: exponential in the
/// attempt number, capped.
fn restart_delay(tunables: &Tunables, attempt: u32) -> Duration {
    let base = tunables.fast_restart_delay.as_secs_f64();
    let factor = tunables.restart_backoff_factor.max(1.0);
    let exp = i32::try_from(attempt.saturating_sub(1).min(16)).unwrap_or(16);
    let delay = base * factor.powi(exp);
    Duration::from_secs_f64(
        delay.min(tunables.restart_backoff_cap.as_secs_f64()),
    )
}

#[cfg(test)]
mod spec {
    use super::*;

    mod restart_delays {
        use super::*;

        #[test]
        fn grows_exponentially_up_to_the_cap() {
            let tunables = Tunables::default();
            for (attempt, expected_secs) in
                &[(1, 2), (2, 4), (3, 8), (4, 16), (5, 30), (6, 30)]
            {
                assert_eq!(
                    restart_delay(&tunables, *attempt),
                    Duration::from_secs(*expected_secs),
                    "attempt {}",
                    attempt,
                );
            }
        }

        #[test]
        fn tolerates_degenerate_factors() {
            let tunables = Tunables {
                restart_backoff_factor: 0.0,
                ..Tunables::default()
            };
            assert_eq!(
                restart_delay(&tunables, 3),
                Duration::from_secs(2),
            );
        }
    }

    mod registry_contract {
        use std::sync::Arc;

        use url::Url;

        use crate::state::{
            EncoderMode, EncoderTuning, Registry, RtmpEndpoint, SourceRef,
        };

        use super::*;

        fn spec_for(id: i64) -> StreamSpec {
            StreamSpec {
                id: id.into(),
                sources: vec![SourceRef::Local("/tmp/a.mp4".into())],
                destination: RtmpEndpoint::new(
                    Url::parse("rtmp://example.com/live/k").unwrap(),
                )
                .unwrap(),
                looped: true,
                playback_order: PlaybackOrder::Sequential,
                keep_files_after_stop: false,
                encoder_mode: EncoderMode::Copy,
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
        fn rejects_duplicate_starts() {
            let registry = Registry::default();
            let tunables = Arc::new(Tunables::default());
            registry
                .insert(StreamRecord::new(spec_for(1), Arc::clone(&tunables)))
                .unwrap();
            let second = registry
                .insert(StreamRecord::new(spec_for(1), tunables));
            assert!(second.is_err());
            assert_eq!(registry.ids(), vec![1.into()]);
        }

        #[test]
        fn active_ids_exclude_terminal_states() {
            let registry = Registry::default();
            let tunables = Arc::new(Tunables::default());
            for id in 1..=3 {
                registry
                    .insert(StreamRecord::new(
                        spec_for(id),
                        Arc::clone(&tunables),
                    ))
                    .unwrap();
            }
            let _ = registry.with(2.into(), |r| {
                r.transition(StreamState::Stopping)
            });
            let _ = registry.with(3.into(), |r| {
                r.transition(StreamState::Error)
            });

            assert_eq!(registry.active_ids(), vec![1.into()]);
        }
    }
}
