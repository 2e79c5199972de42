//! Per-host streaming agent.
//!
//! Accepts commands from a central control plane over a pub/sub message
//! bus, runs long-lived [FFmpeg] relay processes publishing staged media as
//! [RTMP] live streams, and reports state, health and host resources back —
//! recovering from transient encoder failures on its own, within a bounded
//! budget.
//!
//! [FFmpeg]: https://ffmpeg.org
//! [RTMP]: https://en.wikipedia.org/wiki/Real-Time_Messaging_Protocol

#![deny(
    rustdoc::broken_intra_doc_links,
    missing_debug_implementations,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code
)]
#![warn(
    deprecated_in_future,
    missing_docs,
    unreachable_pub,
    unused_import_braces,
    unused_labels,
    unused_lifetimes,
    unused_qualifications,
    unused_results
)]

pub mod agent;
pub mod bus;
pub mod cli;
pub mod dispatch;
pub mod ffmpeg;
pub mod manager;
pub mod report;
pub mod settings;
pub mod stage;
pub mod state;
pub mod stats;

use std::{any::Any, mem};

use ezstream_log::slog;

pub use self::agent::Agent;

/// Runs the application.
///
/// # Errors
///
/// If running has failed and could not be performed. The appropriate error
/// is logged.
pub fn run() -> Result<(), cli::Failure> {
    let mut cfg = cli::Opts::from_args();
    cfg.verbose = cfg.verbose.or_else(|| {
        if cfg.debug {
            Some(slog::Level::Debug)
        } else {
            None
        }
    });

    // This guard should be held till the end of the program for the logger
    // to present in global context.
    mem::forget(ezstream_log::init(cfg.verbose));

    agent::run(cfg)
}

/// Interprets given [panic payload][1] as displayable message.
///
/// [1]: std::panic::PanicInfo::payload
pub fn display_panic<'a>(err: &'a (dyn Any + Send + 'static)) -> &'a str {
    if let Some(s) = err.downcast_ref::<&str>() {
        return s;
    }
    if let Some(s) = err.downcast_ref::<String>() {
        return s.as_str();
    }
    "Box<Any>"
}
