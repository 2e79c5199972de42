//! Staging of source media files.
//!
//! Remote sources are downloaded into a per-stream subdirectory of the
//! staging root, validated, and (when there is more than one of them) listed
//! in a concat playlist the encoder consumes. A background sweeper reaps
//! staging directories no live stream references anymore.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, SystemTime},
};

use chrono::Utc;
use ezstream_log::log;
use futures::{StreamExt as _, TryStreamExt as _};
use tokio::{
    fs,
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    process::Command,
    sync::Semaphore,
    time,
};
use tokio_util::compat::FuturesAsyncReadCompatExt as _;
use url::Url;

use crate::{
    settings::Tunables,
    state::{Registry, SourceRef, StagedMedia, StreamId},
};

/// Failure of staging the sources of one stream.
#[derive(Debug)]
pub enum StageError {
    /// The specification carried no sources at all.
    NoSources,

    /// A source failed to download within its retry budget.
    DownloadFailed(String),

    /// A staged file is missing, empty, or not probe-parseable.
    Unreadable(String),

    /// The staging filesystem ran out of space.
    OutOfSpace,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSources => write!(f, "No sources were provided"),
            Self::DownloadFailed(why) => {
                write!(f, "Failed to download source: {}", why)
            }
            Self::Unreadable(why) => {
                write!(f, "Source file is not usable: {}", why)
            }
            Self::OutOfSpace => {
                write!(f, "Not enough disk space for staging")
            }
        }
    }
}

impl std::error::Error for StageError {}

/// Stager of source media files for the streams of this agent.
#[derive(Debug)]
pub struct Stager {
    /// Root directory all streams stage under.
    root: PathBuf,

    /// Path to the FFprobe binary used for validation.
    ffprobe: PathBuf,

    /// HTTP client performing source downloads.
    http: reqwest::Client,

    /// Host-wide bound on concurrent downloads.
    downloads: Semaphore,
}

impl Stager {
    /// Creates a new [`Stager`] staging under the given `root`.
    #[must_use]
    pub fn new(root: PathBuf, ffprobe: PathBuf, concurrency: usize) -> Self {
        Self {
            root,
            ffprobe,
            http: reqwest::Client::new(),
            downloads: Semaphore::new(concurrency.max(1)),
        }
    }

    /// Returns the staging directory of the given stream.
    #[must_use]
    pub fn stream_dir(&self, id: StreamId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Returns the scratch directory updates of the given stream are staged
    /// into while its previous encoder keeps running.
    #[must_use]
    pub fn scratch_dir(&self, id: StreamId) -> PathBuf {
        self.root.join(format!("{}_update", id))
    }

    /// Stages the given `sources` into the given directory, producing the
    /// [`StagedMedia`] to feed an encoder with.
    ///
    /// Remote sources are downloaded concurrently (bounded host-wide), each
    /// retried with an exponential backoff. Local sources are validated in
    /// place. `progress` is invoked with a 0..=100 percentage as sources
    /// complete.
    ///
    /// # Errors
    ///
    /// See [`StageError`].
    pub async fn stage(
        &self,
        id: StreamId,
        sources: &[SourceRef],
        dir: &Path,
        tunables: &Tunables,
        progress: impl Fn(u8) + Send + Sync,
    ) -> Result<StagedMedia, StageError> {
        if sources.is_empty() {
            return Err(StageError::NoSources);
        }

        fs::create_dir_all(dir).await.map_err(fs_error)?;

        let total = sources.len();
        let completed = AtomicUsize::new(0);
        let progress = &progress;
        let completed = &completed;

        let mut stage_futures = Vec::with_capacity(sources.len());
        for (n, source) in sources.iter().enumerate() {
            stage_futures.push(async move {
                let path = match source {
                    SourceRef::Local(path) => {
                        self.validate(path, tunables).await?;
                        path.clone()
                    }
                    SourceRef::Remote {
                        url,
                        size,
                        filename,
                    } => {
                        let name = filename
                            .as_deref()
                            .map(sanitize_filename)
                            .unwrap_or_else(|| {
                                remote_filename(url, n)
                            });
                        let dest = dir.join(name);
                        self.download(url, *size, &dest, tunables)
                            .await?;
                        self.validate(&dest, tunables).await?;
                        dest
                    }
                };
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                progress((done * 100 / total) as u8);
                Ok::<_, StageError>(path)
            });
        }

        let local_files: Vec<PathBuf> = futures::stream::iter(stage_futures)
            .buffered(total.min(tunables.concurrent_downloads.max(1)))
            .try_collect()
            .await?;

        let playlist_path = if local_files.len() > 1 {
            Some(
                write_playlist(dir, &local_files)
                    .await
                    .map_err(fs_error)?,
            )
        } else {
            None
        };

        log::info!(
            "Staged {} file(s) for stream {} into {}",
            local_files.len(),
            id,
            dir.display(),
        );

        let now = SystemTime::now();
        Ok(StagedMedia {
            local_files,
            playlist_path,
            created_at: now,
            last_touched: now,
        })
    }

    /// Downloads one source into `dest`, retrying with an exponential
    /// backoff and verifying completeness against the advertised size
    /// (within 1 %).
    async fn download(
        &self,
        url: &Url,
        advertised: Option<u64>,
        dest: &Path,
        tunables: &Tunables,
    ) -> Result<(), StageError> {
        let _permit = self
            .downloads
            .acquire()
            .await
            .map_err(|_| StageError::DownloadFailed("stager closed".into()))?;

        let attempts = tunables.download_retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.try_download(url, advertised, dest, tunables).await {
                Ok(()) => return Ok(()),
                Err(StageError::OutOfSpace) => {
                    return Err(StageError::OutOfSpace)
                }
                Err(e) => {
                    last_error = e.to_string();
                    log::warn!(
                        "Download attempt {}/{} of '{}' failed: {}",
                        attempt,
                        attempts,
                        url,
                        e,
                    );
                    if attempt < attempts {
                        let delay = Duration::from_secs(
                            1 << u64::from(attempt.min(5)),
                        );
                        time::sleep(delay).await;
                    }
                }
            }
        }
        Err(StageError::DownloadFailed(format!(
            "'{}' after {} attempts: {}",
            url, attempts, last_error,
        )))
    }

    /// Performs a single download attempt, streaming the body into a
    /// `.part` file renamed into place once complete.
    async fn try_download(
        &self,
        url: &Url,
        advertised: Option<u64>,
        dest: &Path,
        tunables: &Tunables,
    ) -> Result<(), StageError> {
        let timeout = tunables.download_timeout;

        let resp = time::timeout(
            timeout,
            self.http.get(url.clone()).send(),
        )
        .await
        .map_err(|_| {
            StageError::DownloadFailed(format!("GET '{}' timed out", url))
        })?
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| StageError::DownloadFailed(e.to_string()))?;

        let advertised = advertised.or_else(|| resp.content_length());

        let part = PathBuf::from(format!("{}.part", dest.display()));
        let mut file =
            fs::File::create(&part).await.map_err(fs_error)?;
        let mut body = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .into_async_read()
            .compat();

        let mut written: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = time::timeout(timeout, body.read(&mut buf))
                .await
                .map_err(|_| {
                    StageError::DownloadFailed(format!(
                        "reading '{}' stalled",
                        url,
                    ))
                })?
                .map_err(|e| StageError::DownloadFailed(e.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buf[..read]).await.map_err(fs_error)?;
            written += read as u64;
        }
        file.flush().await.map_err(fs_error)?;
        drop(file);

        if let Some(expected) = advertised.filter(|e| *e > 0) {
            let tolerance = expected / 100;
            let diff = if written > expected {
                written - expected
            } else {
                expected - written
            };
            if diff > tolerance {
                let _ = fs::remove_file(&part).await;
                return Err(StageError::DownloadFailed(format!(
                    "'{}' is partial: {} of {} bytes",
                    url, written, expected,
                )));
            }
        }

        fs::rename(&part, dest).await.map_err(fs_error)?;
        log::debug!(
            "Downloaded '{}' to '{}' ({} bytes)",
            url,
            dest.display(),
            written,
        );
        Ok(())
    }

    /// Validates one staged file: a readable regular file of at least 1 KiB
    /// that the media probe accepts.
    async fn validate(
        &self,
        path: &Path,
        tunables: &Tunables,
    ) -> Result<(), StageError> {
        let meta = fs::metadata(path).await.map_err(|e| {
            StageError::Unreadable(format!("{}: {}", path.display(), e))
        })?;
        if !meta.is_file() {
            return Err(StageError::Unreadable(format!(
                "{} is not a regular file",
                path.display(),
            )));
        }
        if meta.len() < 1024 {
            return Err(StageError::Unreadable(format!(
                "{} is too small ({} bytes)",
                path.display(),
                meta.len(),
            )));
        }

        let mut cmd = Command::new(&self.ffprobe);
        let _ = cmd
            .args(&["-v", "error", "-show_format"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let status = time::timeout(tunables.probe_timeout, async {
            cmd.status().await
        })
        .await
        .map_err(|_| {
            StageError::Unreadable(format!(
                "probing {} timed out",
                path.display(),
            ))
        })?
        .map_err(|e| {
            StageError::Unreadable(format!("failed to spawn probe: {}", e))
        })?;
        if !status.success() {
            return Err(StageError::Unreadable(format!(
                "probe rejected {}",
                path.display(),
            )));
        }
        Ok(())
    }

    /// Promotes scratch-staged media of an update into the stream's main
    /// directory, replacing whatever was staged there before.
    ///
    /// Must only be called once the previous encoder has exited.
    ///
    /// # Errors
    ///
    /// If files cannot be moved into place.
    pub async fn promote_scratch(
        &self,
        id: StreamId,
        scratch: StagedMedia,
    ) -> Result<StagedMedia, StageError> {
        let final_dir = self.stream_dir(id);

        if fs::metadata(&final_dir).await.is_ok() {
            fs::remove_dir_all(&final_dir).await.map_err(fs_error)?;
        }
        fs::create_dir_all(&final_dir).await.map_err(fs_error)?;

        let mut local_files = Vec::with_capacity(scratch.local_files.len());
        for path in &scratch.local_files {
            if !path.starts_with(self.scratch_dir(id)) {
                // Local sources are used in place, not moved.
                local_files.push(path.clone());
                continue;
            }
            let name = path.file_name().ok_or_else(|| {
                StageError::Unreadable(format!(
                    "{} has no file name",
                    path.display(),
                ))
            })?;
            let dest = final_dir.join(name);
            move_file(path, &dest).await.map_err(fs_error)?;
            local_files.push(dest);
        }

        let playlist_path = if local_files.len() > 1 {
            Some(
                write_playlist(&final_dir, &local_files)
                    .await
                    .map_err(fs_error)?,
            )
        } else {
            None
        };

        let _ = fs::remove_dir_all(self.scratch_dir(id)).await;

        let now = SystemTime::now();
        Ok(StagedMedia {
            local_files,
            playlist_path,
            created_at: scratch.created_at,
            last_touched: now,
        })
    }

    /// Removes the staging directory of the given stream, if any, along
    /// with its update scratch.
    pub async fn cleanup_stream(&self, id: StreamId) {
        remove_staging_dir(&self.stream_dir(id)).await;
        remove_staging_dir(&self.scratch_dir(id)).await;
    }

    /// Removes only the update scratch directory of the given stream.
    pub async fn cleanup_scratch(&self, id: StreamId) {
        remove_staging_dir(&self.scratch_dir(id)).await;
    }

    /// Runs the staging garbage collection loop, never returning.
    ///
    /// Each sweep removes staging subdirectories last modified beyond the
    /// retention age and not referenced by any live stream.
    pub async fn run_sweeper(
        &self,
        registry: std::sync::Arc<Registry>,
        settings: std::sync::Arc<crate::settings::Store>,
    ) {
        loop {
            let snapshot = settings.snapshot();
            time::sleep(snapshot.sweep_period).await;
            self.sweep(&registry, snapshot.staging_retention).await;
        }
    }

    /// Performs one garbage collection sweep.
    async fn sweep(&self, registry: &Registry, retention: Duration) {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::error!(
                        "Failed to list staging root {}: {}",
                        self.root.display(),
                        e,
                    );
                }
                return;
            }
        };

        let mut removed = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let id = match parse_staging_dir(&name.to_string_lossy()) {
                Some(id) => id,
                None => continue,
            };
            if registry.contains(id) {
                continue;
            }
            let stale = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .map_or(false, |age| age > retention);
            if !stale {
                continue;
            }
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => log::warn!(
                    "Failed to sweep staging dir {}: {}",
                    entry.path().display(),
                    e,
                ),
            }
        }
        if removed > 0 {
            log::info!("Swept {} stale staging dir(s)", removed);
        }
    }
}

/// Removes one staging directory, tolerating its absence.
async fn remove_staging_dir(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => log::info!("Removed staging dir {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::error!(
            "Failed to remove staging dir {}: {}",
            dir.display(),
            e,
        ),
    }
}

/// Parses a staging subdirectory name into the [`StreamId`] owning it.
///
/// Both `{id}` and `{id}_update` layouts belong to a stream; anything else
/// is foreign and left alone.
fn parse_staging_dir(name: &str) -> Option<StreamId> {
    name.strip_suffix("_update")
        .unwrap_or(name)
        .parse::<i64>()
        .ok()
        .map(StreamId::from)
}

/// Writes a concat playlist listing the given files in play order, removing
/// older playlists of the same directory first.
///
/// Looping is the encoder's job, so every entry appears exactly once.
async fn write_playlist(
    dir: &Path,
    files: &[PathBuf],
) -> std::io::Result<PathBuf> {
    let mut entries = fs::read_dir(dir).await?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("playlist_") && name.ends_with(".txt") {
            let _ = fs::remove_file(entry.path()).await;
        }
    }

    let path = dir.join(format!("playlist_{}.txt", Utc::now().timestamp()));
    let mut contents = String::new();
    for file in files {
        contents.push_str(&format!("file '{}'\n", playlist_escape(file)));
    }
    fs::write(&path, contents).await?;
    Ok(path)
}

/// Escapes a path for a single-quoted concat playlist entry.
fn playlist_escape(path: &Path) -> String {
    path.display().to_string().replace('\'', "'\\''")
}

/// Sanitizes a file name to the `[A-Za-z0-9._-]` alphabet, collapsing
/// substitution runs and truncating overlong names while preserving the
/// extension.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_sub = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
            out.push(c);
            prev_sub = false;
        } else if !prev_sub {
            out.push('_');
            prev_sub = true;
        }
    }
    let mut out = out.trim_matches('_').to_owned();
    if out.is_empty() {
        out = "file".to_owned();
    }
    if out.len() > 200 {
        let (stem, ext) = match out.rfind('.') {
            Some(dot) if out.len() - dot <= 16 => {
                (&out[..dot], out[dot..].to_owned())
            }
            _ => (out.as_str(), String::new()),
        };
        let cut = 200 - ext.len();
        out = format!("{}{}", &stem[..stem.len().min(cut)], ext);
    }
    out
}

/// Derives a staged file name for a remote source from its URL.
fn remote_filename(url: &Url, index: usize) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .filter(|s| !s.is_empty())
        .map(sanitize_filename)
        .unwrap_or_else(|| format!("source_{}", index))
}

/// Moves one file, falling back to copy-and-delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    let _ = fs::copy(from, to).await?;
    fs::remove_file(from).await
}

/// Maps a filesystem error into a [`StageError`], detecting exhausted
/// space.
fn fs_error(e: std::io::Error) -> StageError {
    if e.raw_os_error() == Some(libc::ENOSPC) {
        StageError::OutOfSpace
    } else {
        StageError::Unreadable(e.to_string())
    }
}

#[cfg(test)]
mod spec {
    use super::*;

    mod sanitizing {
        use super::*;

        #[test]
        fn keeps_safe_characters() {
            assert_eq!(sanitize_filename("intro-01_final.mp4"),
                       "intro-01_final.mp4");
        }

        #[test]
        fn substitutes_and_collapses_unsafe_runs() {
            for (input, expected) in &[
                ("my video (1).mp4", "my_video_1_.mp4"),
                ("weird///name.mp4", "weird_name.mp4"),
                ("привет.mp4", ".mp4"),
                ("???", "file"),
            ] {
                assert_eq!(&sanitize_filename(input), expected);
            }
        }

        #[test]
        fn truncates_overlong_names_preserving_extension() {
            let long = format!("{}.mp4", "a".repeat(300));
            let out = sanitize_filename(&long);
            assert_eq!(out.len(), 200);
            assert!(out.ends_with(".mp4"));
        }
    }

    mod playlists {
        use super::*;

        #[test]
        fn escapes_embedded_quotes() {
            let path = Path::new("/tmp/it's here.mp4");
            assert_eq!(playlist_escape(path), "/tmp/it'\\''s here.mp4");
        }

        #[tokio::test]
        async fn writes_one_line_per_file_and_removes_older() {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("playlist_1.txt"), "stale")
                .await
                .unwrap();

            let files = vec![
                PathBuf::from("/tmp/a.mp4"),
                PathBuf::from("/tmp/b.mp4"),
                PathBuf::from("/tmp/c.mp4"),
            ];
            let playlist =
                write_playlist(dir.path(), &files).await.unwrap();

            let contents = fs::read_to_string(&playlist).await.unwrap();
            assert_eq!(
                contents,
                "file '/tmp/a.mp4'\nfile '/tmp/b.mp4'\nfile '/tmp/c.mp4'\n",
            );
            assert!(
                fs::metadata(dir.path().join("playlist_1.txt"))
                    .await
                    .is_err(),
                "older playlist survived",
            );
        }
    }

    mod staging_dirs {
        use super::*;

        #[test]
        fn parses_stream_and_scratch_dirs() {
            assert_eq!(parse_staging_dir("123"), Some(123.into()));
            assert_eq!(parse_staging_dir("123_update"), Some(123.into()));
            assert_eq!(parse_staging_dir("lost+found"), None);
            assert_eq!(parse_staging_dir("tmpdata"), None);
        }
    }

    mod remote_names {
        use super::*;

        #[test]
        fn derives_from_url_path() {
            let url =
                Url::parse("https://cdn.example.com/media/clip%201.mp4")
                    .unwrap();
            assert_eq!(remote_filename(&url, 0), "clip_201.mp4");
        }

        #[test]
        fn falls_back_to_index() {
            let url = Url::parse("https://cdn.example.com/").unwrap();
            assert_eq!(remote_filename(&url, 3), "source_3");
        }
    }
}
