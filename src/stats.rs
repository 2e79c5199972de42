//! Host resource statistics collection.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::Serialize;
use sysinfo::{
    CpuExt as _, DiskExt as _, NetworkExt as _, NetworksExt as _, System,
    SystemExt as _,
};
use tokio::{sync::Mutex, time};

/// Snapshot of the host's resource usage reported to the control plane.
#[derive(Clone, Debug, Serialize)]
pub struct HostSnapshot {
    /// ID of this host.
    pub host_id: i64,

    /// CPU usage percentage, averaged over a 1 second interval.
    pub cpu_usage: f64,

    /// RAM usage percentage.
    pub ram_usage: f64,

    /// Usage percentage of the filesystem holding the staging root.
    pub disk_usage: f64,

    /// Total size of that filesystem, GiB.
    pub disk_total_gb: f64,

    /// Used space of that filesystem, GiB.
    pub disk_used_gb: f64,

    /// Free space of that filesystem, GiB.
    pub disk_free_gb: f64,

    /// Count of streams in an active state.
    pub active_streams: usize,

    /// Bytes sent since the previous snapshot, MiB.
    pub network_sent_mb: f64,

    /// Bytes received since the previous snapshot, MiB.
    pub network_recv_mb: f64,

    /// Unix timestamp of the snapshot.
    pub timestamp: i64,
}

/// Collector of [`HostSnapshot`]s.
///
/// Sampling results are cached for a few seconds to amortize syscalls when
/// snapshots are requested more often than they change meaningfully.
#[derive(Debug)]
pub struct Collector {
    host_id: i64,
    staging_root: PathBuf,
    sys: Mutex<System>,
    /// Cumulative network counters observed by the previous sample.
    prev_net: Mutex<Option<(u64, u64)>>,
    cache: Mutex<Option<(Instant, HostSnapshot)>>,
}

/// Time a collected [`HostSnapshot`] stays cached.
const CACHE_TTL: Duration = Duration::from_secs(5);

impl Collector {
    /// Creates a new [`Collector`] for the given host.
    #[must_use]
    pub fn new(host_id: i64, staging_root: PathBuf) -> Self {
        Self {
            host_id,
            staging_root,
            sys: Mutex::new(System::new()),
            prev_net: Mutex::new(None),
            cache: Mutex::new(None),
        }
    }

    /// Samples the host, returning a fresh or recently cached
    /// [`HostSnapshot`].
    pub async fn sample(&self, active_streams: usize) -> HostSnapshot {
        if let Some((at, snapshot)) = &*self.cache.lock().await {
            if at.elapsed() < CACHE_TTL {
                return snapshot.clone();
            }
        }

        let snapshot = self.collect(active_streams).await;
        *self.cache.lock().await =
            Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    /// Performs the actual sampling.
    async fn collect(&self, active_streams: usize) -> HostSnapshot {
        let mut sys = self.sys.lock().await;

        // CPU usage is computed between two refreshes.
        sys.refresh_cpu();
        time::sleep(Duration::from_secs(1)).await;
        sys.refresh_cpu();
        let cpu_usage = f64::from(sys.global_cpu_info().cpu_usage());

        sys.refresh_memory();
        let ram_usage = if sys.total_memory() > 0 {
            sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        sys.refresh_disks_list();
        sys.refresh_disks();
        let (disk_total, disk_free) = staging_filesystem(
            &self.staging_root,
            sys.disks()
                .iter()
                .map(|d| (d.mount_point(), d.total_space(), d.available_space())),
        );
        let disk_used = disk_total.saturating_sub(disk_free);
        let disk_usage = if disk_total > 0 {
            disk_used as f64 / disk_total as f64 * 100.0
        } else {
            0.0
        };

        sys.refresh_networks_list();
        sys.refresh_networks();
        let (sent_total, recv_total) = sys.networks().iter().fold(
            (0u64, 0u64),
            |(sent, recv), (_, data)| {
                (
                    sent + data.total_transmitted(),
                    recv + data.total_received(),
                )
            },
        );
        drop(sys);

        let mut prev_net = self.prev_net.lock().await;
        let (sent_delta, recv_delta) = match *prev_net {
            Some((prev_sent, prev_recv)) => (
                sent_total.saturating_sub(prev_sent),
                recv_total.saturating_sub(prev_recv),
            ),
            None => (0, 0),
        };
        *prev_net = Some((sent_total, recv_total));
        drop(prev_net);

        const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
        const MIB: f64 = 1024.0 * 1024.0;

        HostSnapshot {
            host_id: self.host_id,
            cpu_usage: round1(cpu_usage),
            ram_usage: round1(ram_usage),
            disk_usage: round1(disk_usage),
            disk_total_gb: round1(disk_total as f64 / GIB),
            disk_used_gb: round1(disk_used as f64 / GIB),
            disk_free_gb: round1(disk_free as f64 / GIB),
            active_streams,
            network_sent_mb: round1(sent_delta as f64 / MIB),
            network_recv_mb: round1(recv_delta as f64 / MIB),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Picks the filesystem holding the given `path` among the mounted ones by
/// the longest matching mount point, returning its `(total, free)` sizes.
fn staging_filesystem<'a>(
    path: &Path,
    disks: impl Iterator<Item = (&'a Path, u64, u64)>,
) -> (u64, u64) {
    disks
        .filter(|(mount, ..)| path.starts_with(mount))
        .max_by_key(|(mount, ..)| mount.as_os_str().len())
        .map_or((0, 0), |(_, total, free)| (total, free))
}

/// Rounds the given value to one decimal place, as reported on the wire.
fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod spec {
    use super::*;

    #[test]
    fn rounds_to_one_decimal() {
        for (input, expected) in
            &[(0.0, 0.0), (1.2345, 1.2), (99.96, 100.0), (33.35, 33.4)]
        {
            assert!((round1(*input) - expected).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn picks_longest_mount_point() {
        let disks = vec![
            (Path::new("/"), 100, 50),
            (Path::new("/tmp"), 40, 10),
        ];
        let (total, free) = staging_filesystem(
            Path::new("/tmp/ezstream_downloads"),
            disks.into_iter(),
        );
        assert_eq!((total, free), (40, 10));
    }

    #[test]
    fn falls_back_to_zero_without_a_match() {
        let disks = vec![(Path::new("/mnt/data"), 100, 50)];
        let (total, free) =
            staging_filesystem(Path::new("/tmp"), disks.into_iter());
        assert_eq!((total, free), (0, 0));
    }

    #[test]
    fn snapshot_serializes_contract_fields() {
        let payload = serde_json::to_value(&HostSnapshot {
            host_id: 7,
            cpu_usage: 12.3,
            ram_usage: 45.6,
            disk_usage: 78.9,
            disk_total_gb: 100.0,
            disk_used_gb: 78.9,
            disk_free_gb: 21.1,
            active_streams: 2,
            network_sent_mb: 1.5,
            network_recv_mb: 2.5,
            timestamp: 1700000000,
        })
        .unwrap();

        assert_eq!(payload["host_id"], 7);
        assert_eq!(payload["active_streams"], 2);
        assert_eq!(payload["cpu_usage"], 12.3);
        assert_eq!(payload["timestamp"], 1700000000);
    }
}
