//! Command dispatching.
//!
//! Consumes command envelopes from the host's bus channel, validates them
//! and fans them out to the stream manager on a bounded worker pool.
//! Commands targeting the same stream serialize on its restart lock;
//! cross-stream commands run in parallel.

use std::{
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use anyhow::anyhow;
use ezstream_log::log;
use futures::{FutureExt as _, StreamExt as _, TryFutureExt as _};
use serde::Deserialize;
use tokio::sync::Semaphore;
use url::Url;

use crate::{
    agent::Agent,
    bus,
    settings::{Patch, Tunables},
    state::{
        EncoderMode, EncoderTuning, PlaybackOrder, RtmpEndpoint, SourceRef,
        StopIntent, StreamId, StreamSpec,
    },
};

/// Command envelope as received from the control plane.
///
/// The payload shape varies by command; unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    /// Tag of the command.
    pub command: String,

    /// Command-specific configuration object.
    #[serde(default)]
    pub config: Option<serde_json::Value>,

    /// Target stream, when not carried inside `config`.
    #[serde(default)]
    pub stream_id: Option<StreamId>,

    /// Force flag of `CLEANUP_FILES`.
    #[serde(default)]
    pub force: bool,
}

impl Envelope {
    /// Returns the target stream of this envelope, preferring `config.id`
    /// over the root-level `stream_id`.
    fn target(&self) -> Option<StreamId> {
        self.config
            .as_ref()
            .and_then(|c| c.get("id"))
            .and_then(serde_json::Value::as_i64)
            .map(StreamId::from)
            .or(self.stream_id)
    }
}

/// One `video_files` entry of a stream configuration.
#[derive(Debug, Deserialize)]
struct VideoFile {
    /// Remote URL of the file.
    #[serde(default)]
    url: Option<Url>,

    /// Remote URL of the file (the control plane's older field name).
    #[serde(default)]
    download_url: Option<Url>,

    /// Local path of the file.
    #[serde(default)]
    path: Option<PathBuf>,

    /// Preferred staged file name.
    #[serde(default)]
    filename: Option<String>,

    /// Advertised file size, used for download verification.
    #[serde(default)]
    size: Option<u64>,
}

/// Wire form of a stream configuration carried by `START_STREAM` and
/// `UPDATE_STREAM`.
#[derive(Debug, Deserialize)]
struct SpecPayload {
    id: StreamId,
    #[serde(default)]
    video_files: Vec<VideoFile>,
    #[serde(default)]
    rtmp_url: Option<String>,
    #[serde(default)]
    stream_key: Option<String>,
    #[serde(rename = "loop", default = "default_true")]
    looped: bool,
    #[serde(default)]
    playback_order: Option<PlaybackOrder>,
    #[serde(default)]
    keep_files_after_stop: bool,
    #[serde(default)]
    encoder_mode: Option<EncoderMode>,
    #[serde(default)]
    preset: Option<String>,
    #[serde(default)]
    crf: Option<u32>,
    #[serde(default)]
    maxrate: Option<String>,
    #[serde(default)]
    abr: Option<String>,
    #[serde(default)]
    gop: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Parses a stream configuration object into a [`StreamSpec`], filling
/// omitted encoder knobs from the current [`Tunables`] snapshot.
fn parse_spec(
    config: serde_json::Value,
    tunables: &Tunables,
) -> Result<StreamSpec, anyhow::Error> {
    let payload: SpecPayload = serde_json::from_value(config)
        .map_err(|e| anyhow!("Malformed stream config: {}", e))?;

    let mut sources = Vec::with_capacity(payload.video_files.len());
    for (n, file) in payload.video_files.into_iter().enumerate() {
        if let Some(path) = file.path {
            sources.push(SourceRef::Local(path));
            continue;
        }
        let url = file.url.or(file.download_url).ok_or_else(|| {
            anyhow!("video_files[{}] has neither url nor path", n)
        })?;
        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "video_files[{}] has non-HTTP(S) URL '{}'",
            n,
            url,
        );
        sources.push(SourceRef::Remote {
            url,
            size: file.size,
            filename: file.filename,
        });
    }
    anyhow::ensure!(!sources.is_empty(), "No video files were provided");

    let base = payload
        .rtmp_url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| anyhow!("No rtmp_url was provided"))?;
    let full = match payload.stream_key.filter(|k| !k.is_empty()) {
        Some(key) => format!("{}/{}", base.trim_end_matches('/'), key),
        None => base,
    };
    let destination = Url::parse(&full)
        .map_err(|e| anyhow!("Invalid RTMP destination: {}", e))
        .and_then(|url| {
            RtmpEndpoint::new(url)
                .ok_or_else(|| anyhow!("Destination is not an RTMP URL"))
        })?;

    Ok(StreamSpec {
        id: payload.id,
        sources,
        destination,
        looped: payload.looped,
        playback_order: payload
            .playback_order
            .unwrap_or(PlaybackOrder::Sequential),
        keep_files_after_stop: payload.keep_files_after_stop,
        encoder_mode: payload.encoder_mode.unwrap_or(tunables.encoder_mode),
        tuning: EncoderTuning {
            preset: payload.preset.unwrap_or_else(|| tunables.preset.clone()),
            crf: payload.crf.unwrap_or(tunables.crf),
            maxrate: payload
                .maxrate
                .unwrap_or_else(|| tunables.maxrate.clone()),
            audio_bitrate: payload
                .abr
                .unwrap_or_else(|| tunables.audio_bitrate.clone()),
            gop: payload.gop.unwrap_or(tunables.gop),
        },
    })
}

/// Runs the command dispatch loop, never returning on its own.
///
/// Subscribed last on startup so no command is processed before the rest of
/// the agent is live; aborted first on shutdown so no command is processed
/// while streams drain.
pub async fn run(agent: Agent) {
    let channel = bus::commands_channel(agent.opts().host_id);
    let mut commands = agent.bus().subscribe(&channel).await;
    let workers = Arc::new(Semaphore::new(
        agent.settings().snapshot().command_workers.max(1),
    ));
    log::info!("Listening for commands on '{}'", channel);

    while let Some(payload) = commands.next().await {
        let permit = match Arc::clone(&workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let agent = agent.clone();
        drop(tokio::spawn(
            AssertUnwindSafe(async move {
                let _permit = permit;
                handle_message(agent, &payload).await;
            })
            .catch_unwind()
            .unwrap_or_else(|p| {
                log::crit!(
                    "Panicked while handling a command: {}",
                    crate::display_panic(&p),
                );
            }),
        ));
    }
}

/// Parses and executes one command envelope, timing the execution.
async fn handle_message(agent: Agent, payload: &[u8]) {
    let envelope: Envelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::error!(
                "Dropping malformed command envelope: {} ({})",
                e,
                String::from_utf8_lossy(payload),
            );
            return;
        }
    };

    let command = envelope.command.clone();
    let target = envelope.target();
    log::info!(
        "Received {} command (stream: {:?})",
        command,
        target,
    );

    let started = Instant::now();
    let result = execute(&agent, envelope).await;
    let elapsed = started.elapsed();
    match result {
        Ok(()) => {
            log::info!(
                "{} (stream: {:?}) completed in {}",
                command,
                target,
                humantime::format_duration(elapsed),
            );
        }
        Err(e) => {
            log::error!(
                "{} (stream: {:?}) failed in {}: {}",
                command,
                target,
                humantime::format_duration(elapsed),
                e,
            );
        }
    }
}

/// Executes one parsed command envelope.
async fn execute(
    agent: &Agent,
    envelope: Envelope,
) -> Result<(), anyhow::Error> {
    match envelope.command.as_str() {
        "START_STREAM" => {
            let config = envelope
                .config
                .ok_or_else(|| anyhow!("START_STREAM carries no config"))?;
            let spec = parse_spec(config, &agent.settings().snapshot())?;
            agent.start_stream(spec)
        }

        "STOP_STREAM" => {
            let id = envelope
                .target()
                .ok_or_else(|| anyhow!("STOP_STREAM names no stream"))?;
            agent.stop_stream(id, StopIntent::User, false).await
        }

        "FORCE_KILL_STREAM" => {
            let id = envelope
                .target()
                .ok_or_else(|| anyhow!("FORCE_KILL_STREAM names no stream"))?;
            agent.stop_stream(id, StopIntent::User, true).await
        }

        "UPDATE_STREAM" => {
            let config = envelope
                .config
                .ok_or_else(|| anyhow!("UPDATE_STREAM carries no config"))?;
            let spec = parse_spec(config, &agent.settings().snapshot())?;
            agent.update_stream(spec.id, spec).await
        }

        "SYNC_STATE" => {
            agent.sync_state();
            Ok(())
        }

        "CLEANUP_FILES" => {
            let id = envelope
                .target()
                .ok_or_else(|| anyhow!("CLEANUP_FILES names no stream"))?;
            agent.cleanup_files(id, envelope.force).await
        }

        "REFRESH_SETTINGS" => {
            match envelope.config {
                Some(config) => {
                    let patch: Patch = serde_json::from_value(config)
                        .map_err(|e| {
                            anyhow!("Malformed settings payload: {}", e)
                        })?;
                    let changed = agent.settings().apply(patch);
                    if changed.is_empty() {
                        log::info!("Settings refresh changed nothing");
                    }
                }
                None => {
                    log::info!(
                        "Settings refresh carried no payload; active \
                         snapshot: {:?}",
                        agent.settings().snapshot(),
                    );
                }
            }
            Ok(())
        }

        "UPDATE_AGENT" => {
            // Agent self-update is handled by the deployment tooling; the
            // command is acknowledged so the control plane doesn't retry.
            log::info!("UPDATE_AGENT acknowledged");
            Ok(())
        }

        other => {
            log::warn!("Dropping unknown command '{}'", other);
            Ok(())
        }
    }
}

#[cfg(test)]
mod spec {
    use super::*;

    mod envelopes {
        use super::*;

        #[test]
        fn prefers_config_id_over_root_stream_id() {
            let envelope: Envelope = serde_json::from_str(
                r#"{ "command": "STOP_STREAM",
                     "stream_id": 7,
                     "config": { "id": 123 } }"#,
            )
            .unwrap();
            assert_eq!(envelope.target(), Some(123.into()));
        }

        #[test]
        fn falls_back_to_root_stream_id() {
            let envelope: Envelope = serde_json::from_str(
                r#"{ "command": "STOP_STREAM", "stream_id": 7 }"#,
            )
            .unwrap();
            assert_eq!(envelope.target(), Some(7.into()));
        }

        #[test]
        fn ignores_unknown_fields() {
            let envelope: Envelope = serde_json::from_str(
                r#"{ "command": "SYNC_STATE", "issued_by": "ops" }"#,
            )
            .unwrap();
            assert_eq!(envelope.command, "SYNC_STATE");
            assert_eq!(envelope.target(), None);
            assert!(!envelope.force);
        }
    }

    mod spec_parsing {
        use super::*;

        fn full_config() -> serde_json::Value {
            serde_json::json!({
                "id": 123,
                "video_files": [
                    { "url": "https://cdn.example.com/a.mp4",
                      "size": 2097152 },
                    { "path": "/srv/media/b.mp4" },
                    { "download_url": "https://cdn.example.com/c.mp4",
                      "filename": "c.mp4" },
                ],
                "rtmp_url": "rtmp://example.com/live/",
                "stream_key": "abc",
                "loop": true,
                "playback_order": "sequential",
                "keep_files_after_stop": false,
                "encoder_mode": "reencode",
                "preset": "veryfast",
                "crf": 20,
                "maxrate": "4000k",
                "abr": "160k",
                "gop": 120,
            })
        }

        #[test]
        fn parses_a_full_config() {
            let spec =
                parse_spec(full_config(), &Tunables::default()).unwrap();

            assert_eq!(spec.id, 123.into());
            assert_eq!(spec.sources.len(), 3);
            assert!(matches!(
                &spec.sources[0],
                SourceRef::Remote { size: Some(2097152), .. },
            ));
            assert!(matches!(&spec.sources[1], SourceRef::Local(_)));
            assert!(matches!(
                &spec.sources[2],
                SourceRef::Remote { filename: Some(_), .. },
            ));
            assert_eq!(
                spec.destination.unredacted(),
                "rtmp://example.com/live/abc",
            );
            assert!(spec.looped);
            assert_eq!(spec.encoder_mode, EncoderMode::Reencode);
            assert_eq!(spec.tuning.preset, "veryfast");
            assert_eq!(spec.tuning.crf, 20);
            assert_eq!(spec.tuning.audio_bitrate, "160k");
            assert_eq!(spec.tuning.gop, 120);
        }

        #[test]
        fn fills_omitted_knobs_from_tunables() {
            let config = serde_json::json!({
                "id": 5,
                "video_files": [ { "url": "https://x.example/a.mp4" } ],
                "rtmp_url": "rtmp://example.com/live/k",
            });
            let spec =
                parse_spec(config, &Tunables::default()).unwrap();

            assert!(spec.looped, "loop must default to true");
            assert_eq!(spec.encoder_mode, EncoderMode::Copy);
            assert_eq!(spec.playback_order, PlaybackOrder::Sequential);
            assert_eq!(spec.tuning.preset, "fast");
            assert_eq!(spec.tuning.maxrate, "3000k");
        }

        #[test]
        fn rejects_configs_without_sources_or_destination() {
            let no_files = serde_json::json!({
                "id": 5,
                "rtmp_url": "rtmp://example.com/live/k",
            });
            assert!(parse_spec(no_files, &Tunables::default()).is_err());

            let no_rtmp = serde_json::json!({
                "id": 5,
                "video_files": [ { "url": "https://x.example/a.mp4" } ],
            });
            assert!(parse_spec(no_rtmp, &Tunables::default()).is_err());
        }

        #[test]
        fn rejects_non_http_sources() {
            let config = serde_json::json!({
                "id": 5,
                "video_files": [ { "url": "ftp://x.example/a.mp4" } ],
                "rtmp_url": "rtmp://example.com/live/k",
            });
            assert!(parse_spec(config, &Tunables::default()).is_err());
        }
    }
}
