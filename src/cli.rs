//! CLI (command line interface).

use std::{fmt, path::PathBuf, str::FromStr as _};

use anyhow::anyhow;
use ezstream_log::slog;
use structopt::StructOpt;

/// CLI (command line interface) of the streaming agent.
#[derive(Clone, Debug, StructOpt)]
#[structopt(about = "Per-host streaming agent")]
pub struct Opts {
    /// Debug mode of the agent.
    #[structopt(short, long, help = "Enables debug mode")]
    pub debug: bool,

    /// ID of the host this agent runs on, assigned by the control plane.
    #[structopt(
        long,
        env = "EZSTREAM_HOST_ID",
        help = "ID of this host",
        long_help = "ID of the host this agent runs on, assigned by the \
                     control plane"
    )]
    pub host_id: i64,

    /// Host of the message bus to receive commands from and report to.
    #[structopt(
        long,
        env = "EZSTREAM_BUS_HOST",
        default_value = "127.0.0.1",
        help = "Message bus host",
        long_help = "Host of the message bus to receive commands from and \
                     report to"
    )]
    pub bus_host: String,

    /// Port of the message bus.
    #[structopt(
        long,
        env = "EZSTREAM_BUS_PORT",
        default_value = "6379",
        help = "Message bus port",
        long_help = "Port of the message bus"
    )]
    pub bus_port: u16,

    /// Credential to authenticate on the message bus with.
    #[structopt(
        long,
        env = "EZSTREAM_BUS_PASSWORD",
        help = "Message bus password",
        long_help = "Credential to authenticate on the message bus with \
                     (no authentication if omitted)"
    )]
    pub bus_password: Option<String>,

    /// Root directory where source media files are staged.
    #[structopt(
        long,
        env = "EZSTREAM_STAGING_ROOT",
        default_value = "/tmp/ezstream_downloads",
        help = "Path to stage media files in",
        long_help = "Root directory where source media files are downloaded \
                     to and prepared in (one subdirectory per stream)"
    )]
    pub staging_root: PathBuf,

    /// Path to [FFmpeg] binary.
    ///
    /// [FFmpeg]: https://ffmpeg.org
    #[structopt(
        long,
        env = "FFMPEG_PATH",
        default_value = "/usr/local/bin/ffmpeg",
        help = "Path to FFmpeg binary",
        long_help = "Path to FFmpeg binary"
    )]
    pub ffmpeg_path: PathBuf,

    /// Path to [FFprobe] binary used for validating staged media files.
    ///
    /// [FFprobe]: https://ffmpeg.org/ffprobe.html
    #[structopt(
        long,
        env = "FFPROBE_PATH",
        default_value = "/usr/local/bin/ffprobe",
        help = "Path to FFprobe binary",
        long_help = "Path to FFprobe binary used for validating staged media \
                     files"
    )]
    pub ffprobe_path: PathBuf,

    /// Verbosity level of the agent logs.
    #[structopt(
        short,
        long,
        parse(try_from_str = Self::parse_log_level),
        help = "Logs verbosity level: \
                OFF | CRIT | ERRO | WARN | INFO | DEBG | TRCE"
    )]
    pub verbose: Option<slog::Level>,
}

impl Opts {
    /// Parses CLI [`Opts`] from command line arguments.
    ///
    /// Prints the error message and quits the program in case of failure.
    #[inline]
    #[must_use]
    pub fn from_args() -> Self {
        <Self as StructOpt>::from_args()
    }

    /// Parses [`slog::Level`] from the given string.
    ///
    /// This function is required, because [`slog::Level`]'s [`FromStr`]
    /// implementation returns `()`, which is not [`Display`] as [`StructOpt`]
    /// requires.
    ///
    /// # Errors
    ///
    /// If [`slog::Level`] failed to parse from the string.
    ///
    /// [`Display`]: std::fmt::Display
    /// [`FromStr`]: std::str::FromStr
    pub fn parse_log_level(lvl: &str) -> Result<slog::Level, anyhow::Error> {
        #[allow(clippy::map_err_ignore)]
        slog::Level::from_str(lvl).map_err(|_| {
            anyhow!(
                "'{}' is invalid verbosity level, allowed levels are: \
                 OFF | CRIT | ERRO | WARN | INFO | DEBG | TRCE",
                lvl,
            )
        })
    }
}

/// Error type indicating non-zero process exit code.
pub struct Failure;

impl fmt::Debug for Failure {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "")
    }
}

impl From<()> for Failure {
    #[inline]
    fn from(_: ()) -> Self {
        Self
    }
}
