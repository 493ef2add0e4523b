use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::{sync::oneshot, task::JoinHandle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub cpu_ms: u64,
    pub rss_kb: u64,
}

/// Running maxima of what the sampler has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub cpu_ms: Option<u64>,
    pub peak_rss_kb: Option<u64>,
}

impl Usage {
    pub fn record(&mut self, s: Sample) {
        self.cpu_ms = Some(self.cpu_ms.map_or(s.cpu_ms, |c| c.max(s.cpu_ms)));
        self.peak_rss_kb = Some(self.peak_rss_kb.map_or(s.rss_kb, |m| m.max(s.rss_kb)));
    }

    pub fn memory_mb(&self) -> Option<f64> {
        self.peak_rss_kb.map(|kb| kb as f64 / 1024.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitHit {
    Time,
    Memory,
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_sec() -> u64 {
    use once_cell::sync::Lazy;
    static TICKS: Lazy<u64> = Lazy::new(|| {
        let t = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if t > 0 {
            t as u64
        } else {
            100
        }
    });
    *TICKS
}

/// Reads cpu time and resident memory of `pid` from procfs.
#[cfg(target_os = "linux")]
pub fn sample(pid: u32) -> Option<Sample> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces, so split after its closing paren
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let cpu_ms = (utime + stime) * 1000 / clock_ticks_per_sec();

    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let rss_kb = status
        .lines()
        .find_map(|l| l.strip_prefix("VmRSS:"))
        .and_then(|v| v.split_whitespace().next())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    Some(Sample { cpu_ms, rss_kb })
}

#[cfg(not(target_os = "linux"))]
pub fn sample(_pid: u32) -> Option<Sample> {
    None
}

pub struct SamplerConfig {
    pub pid: u32,
    pub started: Instant,
    pub interval: Duration,
    pub time_limit: Option<Duration>,
    pub memory_limit_mb: Option<u64>,
}

/// Polls the process until a limit is crossed, then reports it once.
/// The task never ends on its own otherwise; it is aborted at teardown.
pub fn spawn(
    cfg: SamplerConfig,
    usage: Arc<Mutex<Usage>>,
    hit: oneshot::Sender<LimitHit>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        let memory_limit_kb = cfg.memory_limit_mb.map(|mb| mb * 1024);
        loop {
            ticker.tick().await;
            if let Some(s) = sample(cfg.pid) {
                let peak = {
                    let mut u = usage.lock().unwrap_or_else(|p| p.into_inner());
                    u.record(s);
                    u.peak_rss_kb.unwrap_or(0)
                };
                if memory_limit_kb.map_or(false, |limit| peak > limit) {
                    log::debug!("pid {} exceeded memory limit ({} KB)", cfg.pid, peak);
                    let _ = hit.send(LimitHit::Memory);
                    return;
                }
            }
            if cfg
                .time_limit
                .map_or(false, |limit| cfg.started.elapsed() > limit)
            {
                log::debug!("pid {} exceeded time limit", cfg.pid);
                let _ = hit.send(LimitHit::Time);
                return;
            }
        }
    })
}
