//! Per-worker CPU load sampling.
//!
//! `Listener::request_load` gathers one [`ResourceUsage`] snapshot per
//! worker and folds it, together with the previous [`Load`], into
//! per-worker utilization percentages: `100 · Δcpu / Δt` over the
//! sampling interval, with the global figure being the mean across
//! workers. The first sample has no interval to compare against and
//! reports zeros.

use std::io;
use std::time::{Duration, Instant};

/// Cumulative CPU time consumed by one worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceUsage {
    user: Duration,
    system: Duration,
}

impl ResourceUsage {
    #[must_use]
    pub fn new(user: Duration, system: Duration) -> Self {
        Self { user, system }
    }

    /// Snapshot for the calling thread, microsecond precision.
    pub fn for_current_thread() -> io::Result<Self> {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            user: timeval_to_duration(usage.ru_utime),
            system: timeval_to_duration(usage.ru_stime),
        })
    }

    #[must_use]
    pub fn user(&self) -> Duration {
        self.user
    }

    #[must_use]
    pub fn system(&self) -> Duration {
        self.system
    }

    fn total_micros(&self) -> u128 {
        self.user.as_micros() + self.system.as_micros()
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1_000)
}

/// One load sample: the raw per-worker usage records plus the derived
/// percentages.
#[derive(Debug, Clone, Default)]
pub struct Load {
    tick: Option<Instant>,
    raw: Vec<ResourceUsage>,
    workers: Vec<f64>,
    global: f64,
}

impl Load {
    /// Folds fresh usage snapshots against a previous sample.
    pub(crate) fn next(previous: &Load, usages: Vec<ResourceUsage>, now: Instant) -> Load {
        let prev_tick = match previous.tick {
            Some(tick) if !previous.raw.is_empty() => tick,
            // First sample: no interval to derive percentages from.
            _ => {
                return Load {
                    tick: Some(now),
                    workers: vec![0.0; usages.len()],
                    global: 0.0,
                    raw: usages,
                }
            }
        };

        let elapsed_micros = now.duration_since(prev_tick).as_micros().max(1) as f64;
        let mut workers = Vec::with_capacity(usages.len());
        let mut global = 0.0;
        for (current, last) in usages.iter().zip(&previous.raw) {
            let used = current.total_micros().saturating_sub(last.total_micros()) as f64;
            let pct = used * 100.0 / elapsed_micros;
            workers.push(pct);
            global += pct;
        }
        if !workers.is_empty() {
            global /= workers.len() as f64;
        }

        Load {
            tick: Some(now),
            raw: usages,
            workers,
            global,
        }
    }

    /// When this sample was taken; `None` for the empty default.
    #[must_use]
    pub fn tick(&self) -> Option<Instant> {
        self.tick
    }

    /// Raw usage records, in worker order.
    #[must_use]
    pub fn raw(&self) -> &[ResourceUsage] {
        &self.raw
    }

    /// Per-worker utilization percentages, in worker order.
    #[must_use]
    pub fn workers(&self) -> &[f64] {
        &self.workers
    }

    /// Mean utilization across workers.
    #[must_use]
    pub fn global(&self) -> f64 {
        self.global
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn micros(n: u64) -> Duration {
        Duration::from_micros(n)
    }

    #[test]
    fn first_sample_reports_zeros() {
        let usages = vec![ResourceUsage::default(); 3];
        let load = Load::next(&Load::default(), usages, Instant::now());
        assert_eq!(load.workers(), &[0.0, 0.0, 0.0]);
        assert_eq!(load.global(), 0.0);
        assert_eq!(load.raw().len(), 3);
        assert!(load.tick().is_some());
    }

    #[test]
    fn percentages_follow_cpu_deltas() {
        let t0 = Instant::now();
        let first = Load::next(
            &Load::default(),
            vec![
                ResourceUsage::new(micros(1_000), micros(0)),
                ResourceUsage::new(micros(2_000), micros(500)),
            ],
            t0,
        );

        // 100ms later: worker 0 burned 50ms of CPU, worker 1 stayed idle.
        let t1 = t0 + Duration::from_millis(100);
        let second = Load::next(
            &first,
            vec![
                ResourceUsage::new(micros(41_000), micros(10_000)),
                ResourceUsage::new(micros(2_000), micros(500)),
            ],
            t1,
        );

        assert_eq!(second.workers().len(), 2);
        assert!((second.workers()[0] - 50.0).abs() < 1e-6);
        assert!((second.workers()[1]).abs() < 1e-6);
        assert!((second.global() - 25.0).abs() < 1e-6);
    }

    #[test]
    fn global_is_the_mean_of_workers() {
        let t0 = Instant::now();
        let first = Load::next(
            &Load::default(),
            vec![ResourceUsage::default(); 4],
            t0,
        );
        let second = Load::next(
            &first,
            vec![
                ResourceUsage::new(micros(10_000), micros(0)),
                ResourceUsage::new(micros(20_000), micros(0)),
                ResourceUsage::new(micros(30_000), micros(0)),
                ResourceUsage::new(micros(40_000), micros(0)),
            ],
            t0 + Duration::from_millis(100),
        );

        let mean = second.workers().iter().sum::<f64>() / second.workers().len() as f64;
        assert!((second.global() - mean).abs() < 1e-9);
    }

    #[test]
    fn usage_counters_never_run_backwards() {
        let t0 = Instant::now();
        let first = Load::next(
            &Load::default(),
            vec![ResourceUsage::new(micros(5_000), micros(0))],
            t0,
        );
        // A smaller current reading clamps to zero instead of underflowing.
        let second = Load::next(
            &first,
            vec![ResourceUsage::new(micros(1_000), micros(0))],
            t0 + Duration::from_millis(10),
        );
        assert_eq!(second.workers(), &[0.0]);
    }

    #[test]
    fn current_thread_usage_is_monotonic() {
        let before = ResourceUsage::for_current_thread().expect("getrusage");
        // Burn a little CPU so the counters move.
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_add(i).rotate_left(7);
        }
        std::hint::black_box(acc);
        let after = ResourceUsage::for_current_thread().expect("getrusage");
        assert!(after.total_micros() >= before.total_micros());
    }
}
