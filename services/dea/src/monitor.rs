//! Resource accounting and admission control.
//!
//! The [`Monitor`] counts reserved memory and clients against the node's
//! configured maximums. A start is admitted with
//! [`Monitor::try_add_tracked_resources`], which checks and reserves under
//! one lock. Recovered instances are counted unconditionally with
//! [`Monitor::add_instance_resources`].
//!
//! Lock order: an instance's write lock is always taken before the monitor
//! lock, never the other way round.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use dea_messages::InstanceUsage;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::droplet::{DropletInstance, DropletInstanceProperties};

/// Discovery delay added per instance of the droplet already on this node.
pub const TAINT_PER_APP: Duration = Duration::from_millis(10);
/// Discovery delay at full memory reservation, scaled linearly.
pub const TAINT_FOR_MEMORY: Duration = Duration::from_millis(100);
/// Upper bound on the discovery delay.
pub const TAINT_MAX: Duration = Duration::from_millis(250);

/// Minimum time between two disk usage dumps.
pub const DISK_USAGE_DUMP_INTERVAL: Duration = Duration::from_secs(30 * 60);

const DU_SUMMARY_FILE: &str = "apps.du.summary";
const DU_DETAIL_FILE: &str = "apps.du";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStats {
    pub reserved_memory_mb: u64,
    /// Last measured resident memory across instances, in KB.
    pub memory_usage_kb: u64,
    pub clients: u64,
}

/// Node-wide resource counters.
#[derive(Debug)]
pub struct Monitor {
    counters: RwLock<MonitorStats>,
    max_memory_mb: u64,
    max_clients: u64,
    last_du_dump: Mutex<Option<Instant>>,
}

impl Monitor {
    pub fn new(max_memory_mb: u64, max_clients: u64) -> Self {
        Self {
            counters: RwLock::new(MonitorStats::default()),
            max_memory_mb,
            max_clients,
            last_du_dump: Mutex::new(None),
        }
    }

    pub fn max_memory_mb(&self) -> u64 {
        self.max_memory_mb
    }

    pub fn max_clients(&self) -> u64 {
        self.max_clients
    }

    pub fn stats(&self) -> MonitorStats {
        *self.counters.read()
    }

    pub fn reserved_memory_mb(&self) -> u64 {
        self.counters.read().reserved_memory_mb
    }

    pub fn clients(&self) -> u64 {
        self.counters.read().clients
    }

    pub fn memory_usage_kb(&self) -> u64 {
        self.counters.read().memory_usage_kb
    }

    pub fn set_memory_usage_kb(&self, kb: u64) {
        self.counters.write().memory_usage_kb = kb;
    }

    /// Would one more instance of `mem_mb` fit under both limits?
    pub fn has_room_for(&self, mem_mb: u64) -> bool {
        fits(&self.counters.read(), mem_mb, self.max_memory_mb, self.max_clients)
    }

    /// Reserve `props` only if it fits. No-op if already counted.
    pub fn try_add_tracked_resources(&self, props: &mut DropletInstanceProperties) -> bool {
        if props.resources_tracked {
            return false;
        }
        let mut counters = self.counters.write();
        if !fits(&counters, props.mem_quota_mb(), self.max_memory_mb, self.max_clients) {
            return false;
        }
        track(&mut counters, props);
        true
    }

    /// Count `instance` against node totals. No-op if already counted.
    pub fn add_instance_resources(&self, instance: &DropletInstance) -> bool {
        let mut data = instance.write();
        self.add_tracked_resources(&mut data.properties)
    }

    /// Inverse of [`Monitor::add_instance_resources`]. No-op if not counted.
    pub fn remove_instance_resources(&self, instance: &DropletInstance) -> bool {
        let mut data = instance.write();
        self.remove_tracked_resources(&mut data.properties)
    }

    /// Same as [`Monitor::add_instance_resources`] for a caller that
    /// already holds the instance write lock.
    pub fn add_tracked_resources(&self, props: &mut DropletInstanceProperties) -> bool {
        if props.resources_tracked {
            return false;
        }
        track(&mut self.counters.write(), props);
        true
    }

    pub fn remove_tracked_resources(&self, props: &mut DropletInstanceProperties) -> bool {
        if !props.resources_tracked {
            return false;
        }
        let mut counters = self.counters.write();
        props.resources_tracked = false;
        counters.clients = counters.clients.saturating_sub(1);
        counters.reserved_memory_mb = counters
            .reserved_memory_mb
            .saturating_sub(props.mem_quota_mb());
        debug!(
            instance_id = %props.instance_id,
            reserved_memory_mb = counters.reserved_memory_mb,
            clients = counters.clients,
            "Released instance resources"
        );
        true
    }

    /// Delay before answering a discovery broadcast.
    ///
    /// Nodes already running the droplet, or holding more reserved memory,
    /// answer later so that emptier nodes tend to win placement.
    pub fn discover_taint(&self, instances_of_droplet: usize) -> Duration {
        let per_app = TAINT_PER_APP * instances_of_droplet as u32;
        let memory = if self.max_memory_mb == 0 {
            Duration::ZERO
        } else {
            let ratio = self.reserved_memory_mb() as f64 / self.max_memory_mb as f64;
            TAINT_FOR_MEMORY.mul_f64(ratio.clamp(0.0, 1.0))
        };
        (per_app + memory).min(TAINT_MAX)
    }

    /// Write `apps.du.summary` and `apps.du` into `db_dir`.
    ///
    /// Returns `Ok(false)` without touching the disk if the previous dump
    /// was less than [`DISK_USAGE_DUMP_INTERVAL`] ago.
    pub fn dump_apps_dir_disk_usage(&self, apps_dir: &Path, db_dir: &Path) -> io::Result<bool> {
        {
            let mut last = self.last_du_dump.lock();
            if last.is_some_and(|at| at.elapsed() < DISK_USAGE_DUMP_INTERVAL) {
                return Ok(false);
            }
            *last = Some(Instant::now());
        }

        let mut entries = Vec::new();
        if apps_dir.is_dir() {
            for entry in fs::read_dir(apps_dir)? {
                let entry = entry?;
                let size = dir_size(&entry.path()).unwrap_or(0);
                entries.push((entry.file_name().to_string_lossy().into_owned(), size));
            }
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let total: u64 = entries.iter().map(|(_, size)| size).sum();

        fs::create_dir_all(db_dir)?;
        fs::write(
            db_dir.join(DU_SUMMARY_FILE),
            format!("{total}\t{}\n", apps_dir.display()),
        )?;
        let mut detail = fs::File::create(db_dir.join(DU_DETAIL_FILE))?;
        for (name, size) in &entries {
            writeln!(detail, "{size}\t{name}")?;
        }

        info!(total_bytes = total, dirs = entries.len(), "Dumped apps disk usage");
        Ok(true)
    }
}

fn fits(counters: &MonitorStats, mem_mb: u64, max_memory_mb: u64, max_clients: u64) -> bool {
    counters.clients < max_clients
        && counters
            .reserved_memory_mb
            .checked_add(mem_mb)
            .is_some_and(|total| total <= max_memory_mb)
}

fn track(counters: &mut MonitorStats, props: &mut DropletInstanceProperties) {
    props.resources_tracked = true;
    counters.clients += 1;
    counters.reserved_memory_mb = counters.reserved_memory_mb.saturating_add(props.mem_quota_mb());
    debug!(
        instance_id = %props.instance_id,
        reserved_memory_mb = counters.reserved_memory_mb,
        clients = counters.clients,
        "Tracking instance resources"
    );
}

// =============================================================================
// Usage sampling
// =============================================================================

/// Raw per-process counters read from `/proc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSample {
    pub rss_kb: u64,
    /// user + system time in clock ticks.
    pub cpu_ticks: u64,
}

impl ProcessSample {
    #[cfg(target_os = "linux")]
    pub fn read(pid: u32) -> io::Result<Self> {
        let status = fs::read_to_string(format!("/proc/{pid}/status"))?;
        let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
        let invalid = |what: &'static str| io::Error::new(io::ErrorKind::InvalidData, what);
        Ok(Self {
            rss_kb: parse_status_rss(&status).ok_or_else(|| invalid("no VmRSS"))?,
            cpu_ticks: parse_stat_ticks(&stat).ok_or_else(|| invalid("malformed stat"))?,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn read(_pid: u32) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process sampling requires /proc",
        ))
    }
}

/// Take one usage sample for `pid`, whose files live in `dir`.
///
/// `previous_ticks` is the CPU tick count from the last sample, taken
/// `interval` ago. Returns the sample and the new tick count, or `None` if
/// the process could not be read.
pub fn sample_usage(
    pid: u32,
    dir: &Path,
    previous_ticks: Option<u64>,
    interval: Duration,
) -> Option<(InstanceUsage, u64)> {
    let sample = ProcessSample::read(pid).ok()?;
    let cpu = match previous_ticks {
        Some(prev) => cpu_percent(sample.cpu_ticks.saturating_sub(prev), interval),
        None => 0.0,
    };
    let usage = InstanceUsage {
        mem: sample.rss_kb,
        cpu,
        disk: dir_size(dir).unwrap_or(0),
        time: Utc::now().timestamp(),
    };
    Some((usage, sample.cpu_ticks))
}

fn cpu_percent(delta_ticks: u64, interval: Duration) -> f32 {
    let secs = interval.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    let ticks_per_sec = clock_ticks_per_sec();
    ((delta_ticks as f64 / ticks_per_sec) / secs * 100.0) as f32
}

fn clock_ticks_per_sec() -> f64 {
    #[cfg(unix)]
    {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as f64;
        }
    }
    100.0
}

fn parse_status_rss(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// utime + stime from `/proc/<pid>/stat`.
///
/// The command name may contain spaces, so fields are counted from the
/// closing parenthesis.
fn parse_stat_ticks(content: &str) -> Option<u64> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                total += dir_size(&entry.path())?;
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
        }
    } else if path.is_file() {
        total = fs::metadata(path)?.len();
    }
    Ok(total)
}
