//! Composition root of the agent.
//!
//! One process-wide [`Agent`] value wires all components together and hands
//! them out explicitly; there is no package-level state. Startup brings the
//! reporting side up first and subscribes to commands last, so no command is
//! ever processed before its dependencies are live.

use std::sync::Arc;

use ezstream_log::log;
use tokio::{
    fs,
    signal::unix::{signal, SignalKind},
    time,
};

use crate::{
    bus::{RedisBus, SharedBus},
    cli::{Failure, Opts},
    dispatch,
    report::Reporter,
    settings,
    stage::Stager,
    state::Registry,
    stats::Collector,
};

/// Handle to the composed agent, cheap to clone and pass around.
///
/// Components receive this handle plus a stream ID and look state up
/// through it, which keeps the object graph acyclic.
#[derive(Clone, Debug)]
pub struct Agent(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    opts: Opts,
    settings: Arc<settings::Store>,
    bus: SharedBus,
    registry: Arc<Registry>,
    reporter: Reporter,
    stager: Arc<Stager>,
    stats: Arc<Collector>,
}

impl Agent {
    /// Launch-immutable configuration of this agent.
    #[inline]
    #[must_use]
    pub(crate) fn opts(&self) -> &Opts {
        &self.0.opts
    }

    /// Runtime-tunable settings store.
    #[inline]
    #[must_use]
    pub(crate) fn settings(&self) -> &Arc<settings::Store> {
        &self.0.settings
    }

    /// Message bus of this agent.
    #[inline]
    #[must_use]
    pub(crate) fn bus(&self) -> &SharedBus {
        &self.0.bus
    }

    /// Registry of this agent's streams.
    #[inline]
    #[must_use]
    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.0.registry
    }

    /// Reporter towards the control plane.
    #[inline]
    #[must_use]
    pub(crate) fn reporter(&self) -> &Reporter {
        &self.0.reporter
    }

    /// Stager of source media files.
    #[inline]
    #[must_use]
    pub(crate) fn stager(&self) -> &Arc<Stager> {
        &self.0.stager
    }

    /// Host stats collector.
    #[inline]
    #[must_use]
    pub(crate) fn stats(&self) -> &Arc<Collector> {
        &self.0.stats
    }
}

/// Runs the agent until a shutdown signal, then drains it.
///
/// # Errors
///
/// If the agent cannot be brought up. The actual error is written to logs.
#[tokio::main]
pub async fn run(opts: Opts) -> Result<(), Failure> {
    // Connect the bus first, so a dead control plane fails the start fast.
    let bus_client = RedisBus::new(
        &opts.bus_host,
        opts.bus_port,
        opts.bus_password.clone(),
    )
    .map_err(|e| log::error!("Failed to configure bus client: {}", e))?;
    bus_client
        .ping()
        .await
        .map_err(|e| log::error!("Failed to reach the bus: {}", e))?;
    log::info!("Connected to bus at {}:{}", opts.bus_host, opts.bus_port);
    let bus: SharedBus = Arc::new(bus_client);

    fs::create_dir_all(&opts.staging_root).await.map_err(|e| {
        log::error!(
            "Failed to create staging root {}: {}",
            opts.staging_root.display(),
            e,
        )
    })?;

    let settings = Arc::new(settings::Store::default());
    let snapshot = settings.snapshot();
    let stager = Arc::new(Stager::new(
        opts.staging_root.clone(),
        opts.ffprobe_path.clone(),
        snapshot.concurrent_downloads,
    ));
    let stats = Arc::new(Collector::new(opts.host_id, opts.staging_root.clone()));
    let reporter =
        Reporter::new(opts.host_id, Arc::clone(&bus), Arc::clone(&settings));

    let agent = Agent(Arc::new(Inner {
        opts,
        settings,
        bus,
        registry: Arc::new(Registry::default()),
        reporter,
        stager,
        stats,
    }));

    // Startup order: reporting first, command intake last.
    let reporter_task = tokio::spawn(agent.reporter().clone().run());
    let stats_task = tokio::spawn(stats_loop(agent.clone()));
    let heartbeat_task = tokio::spawn(heartbeat_loop(agent.clone()));
    let sweeper_task = tokio::spawn(sweeper_loop(agent.clone()));
    let dispatcher_task = tokio::spawn(dispatch::run(agent.clone()));

    log::info!("Agent is up (host {})", agent.opts().host_id);

    wait_for_shutdown().await?;
    log::info!("Shutting down");

    // Stop taking commands, drain every stream under the global deadline,
    // then flush the reporter so the final STOPPED reports leave.
    dispatcher_task.abort();
    agent.shutdown_streams().await;
    sweeper_task.abort();
    heartbeat_task.abort();
    stats_task.abort();
    agent.reporter().flush().await;
    reporter_task.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Completes once SIGINT or SIGTERM arrives.
async fn wait_for_shutdown() -> Result<(), Failure> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| log::error!("Failed to install SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
        log::error!("Failed to install SIGTERM handler: {}", e)
    })?;
    tokio::select! {
        _ = sigint.recv() => log::info!("Received SIGINT"),
        _ = sigterm.recv() => log::info!("Received SIGTERM"),
    }
    Ok(())
}

/// Emits heartbeats with the current active-stream set.
async fn heartbeat_loop(agent: Agent) {
    loop {
        agent.reporter().heartbeat(agent.registry().active_ids());
        time::sleep(agent.settings().snapshot().heartbeat_interval).await;
    }
}

/// Samples the host and emits its stats.
async fn stats_loop(agent: Agent) {
    loop {
        let active = agent.registry().active_ids().len();
        let snapshot = agent.stats().sample(active).await;
        agent.reporter().host_stats(&snapshot);
        time::sleep(agent.settings().snapshot().stats_report_interval).await;
    }
}

/// Sweeps stale staging directories.
async fn sweeper_loop(agent: Agent) {
    agent
        .stager()
        .run_sweeper(
            Arc::clone(agent.registry()),
            Arc::clone(agent.settings()),
        )
        .await;
}
