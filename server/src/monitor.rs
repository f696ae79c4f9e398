//! Host resource polling
//!
//! A [`ResourcePoller`] samples CPU, memory and disk figures on a fixed
//! interval and keeps the latest values in a snapshot that any task can read
//! without waiting for the next sample.

use crate::error::SampleError;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSnapshot {
    /// Percent, 0 to 100
    pub cpu_usage: f32,
    /// Percent, 0 to 100
    pub memory_usage: f32,
    /// Free space in megabytes
    pub disk_space_mb: f64,
}

impl ResourceSnapshot {
    fn clamped(self) -> Self {
        let percent = |v: f32| if v.is_finite() { v.clamp(0.0, 100.0) } else { 0.0 };
        Self {
            cpu_usage: percent(self.cpu_usage),
            memory_usage: percent(self.memory_usage),
            disk_space_mb: if self.disk_space_mb.is_finite() {
                self.disk_space_mb.max(0.0)
            } else {
                0.0
            },
        }
    }
}

/// Source of resource figures.
pub trait ResourceSampler: Send + 'static {
    fn sample(&mut self) -> Result<ResourceSnapshot, SampleError>;
}

/// Samples the machine the server runs on.
pub struct HostSampler {
    system: System,
    disks: Disks,
    disk_root: PathBuf,
}

impl HostSampler {
    pub fn new() -> Self {
        let root = if cfg!(windows) { "C:\\" } else { "/" };
        Self::for_path(root)
    }

    /// Reports free space of the disk holding `path`.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            disk_root: path.into(),
        }
    }

    /// The mounted disk with the longest mount point that contains the root.
    fn free_disk_bytes(&self) -> Option<u64> {
        self.disks
            .list()
            .iter()
            .filter(|disk| self.disk_root.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space())
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for HostSampler {
    fn sample(&mut self) -> Result<ResourceSnapshot, SampleError> {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.disks.refresh_list();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(SampleError("total memory reported as zero".into()));
        }
        let memory_usage = (self.system.used_memory() as f64 / total as f64 * 100.0) as f32;

        let free = self.free_disk_bytes().ok_or_else(|| {
            SampleError(format!("no disk mounted at {}", self.disk_root.display()))
        })?;

        Ok(ResourceSnapshot {
            cpu_usage: self.system.global_cpu_info().cpu_usage(),
            memory_usage,
            disk_space_mb: free as f64 / BYTES_PER_MB,
        })
    }
}

struct PollWorker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Box<dyn ResourceSampler>>,
}

/// Periodically refreshes a shared [`ResourceSnapshot`].
///
/// The sampler is moved into the background task while polling and handed
/// back on `stop`, so a stopped poller can be started again.
pub struct ResourcePoller {
    snapshot: Arc<RwLock<ResourceSnapshot>>,
    period: Duration,
    sampler: Mutex<Option<Box<dyn ResourceSampler>>>,
    worker: Mutex<Option<PollWorker>>,
}

impl ResourcePoller {
    /// Creates a stopped poller that will sample every `period`.
    ///
    /// Until the first sample lands, [`stats`](Self::stats) reports an
    /// all-zero snapshot.
    pub fn new(sampler: impl ResourceSampler, period: Duration) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(ResourceSnapshot::default())),
            period,
            sampler: Mutex::new(Some(Box::new(sampler))),
            worker: Mutex::new(None),
        }
    }

    /// Begins polling; the first sample is taken immediately. Returns false
    /// if the poller is already running.
    pub fn start(&self) -> bool {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return false;
        }
        let Some(sampler) = lock(&self.sampler).take() else {
            warn!("Resource poller has no sampler to run");
            return false;
        };

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(poll(
            sampler,
            Arc::clone(&self.snapshot),
            self.period,
            shutdown_rx,
        ));
        *worker = Some(PollWorker { shutdown, handle });

        info!("Resource poller started ({:?} interval)", self.period);
        true
    }

    /// Halts polling and waits for the task to exit. Safe to call when the
    /// poller never started or has already stopped.
    pub async fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };

        let _ = worker.shutdown.send(());
        match worker.handle.await {
            Ok(sampler) => {
                *lock(&self.sampler) = Some(sampler);
                info!("Resource poller stopped");
            }
            Err(e) => warn!("Resource poller task failed: {}", e),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Latest successful sample.
    ///
    /// Never blocks on the sampler: a slow or failing read leaves the
    /// previous snapshot in place.
    pub fn stats(&self) -> ResourceSnapshot {
        *self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cpu_usage(&self) -> f32 {
        self.stats().cpu_usage
    }

    pub fn memory_usage(&self) -> f32 {
        self.stats().memory_usage
    }

    pub fn disk_space_mb(&self) -> f64 {
        self.stats().disk_space_mb
    }
}

/// Runs until the shutdown sender fires or is dropped.
async fn poll(
    mut sampler: Box<dyn ResourceSampler>,
    snapshot: Arc<RwLock<ResourceSnapshot>>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) -> Box<dyn ResourceSampler> {
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticks.tick() => match sampler.sample() {
                Ok(sample) => {
                    let sample = sample.clamped();
                    debug!(
                        "Resources: cpu {:.1}%, memory {:.1}%, disk {:.0} MB free",
                        sample.cpu_usage, sample.memory_usage, sample.disk_space_mb
                    );
                    *snapshot.write().unwrap_or_else(PoisonError::into_inner) = sample;
                }
                Err(e) => warn!("{}; keeping previous snapshot", e),
            },
        }
    }

    sampler
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    /// Replays scripted samples, repeating the last one when exhausted.
    struct ScriptedSampler {
        script: VecDeque<Result<ResourceSnapshot, SampleError>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedSampler {
        fn new(script: Vec<Result<ResourceSnapshot, SampleError>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    script: script.into(),
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    impl ResourceSampler for ScriptedSampler {
        fn sample(&mut self) -> Result<ResourceSnapshot, SampleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.script.len() > 1 {
                self.script.pop_front().unwrap()
            } else {
                self.script.front().cloned().unwrap()
            }
        }
    }

    fn snapshot(cpu: f32, memory: f32, disk: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_usage: cpu,
            memory_usage: memory,
            disk_space_mb: disk,
        }
    }

    /// Tests percentage and disk clamping
    #[test]
    fn test_clamping() {
        let clamped = snapshot(150.0, -3.0, -10.0).clamped();
        assert_approx_eq!(clamped.cpu_usage, 100.0);
        assert_approx_eq!(clamped.memory_usage, 0.0);
        assert_approx_eq!(clamped.disk_space_mb, 0.0);

        let clamped = snapshot(f32::NAN, 42.5, f64::INFINITY).clamped();
        assert_approx_eq!(clamped.cpu_usage, 0.0);
        assert_approx_eq!(clamped.memory_usage, 42.5);
        assert_approx_eq!(clamped.disk_space_mb, 0.0);
    }

    /// Tests that the first sample is taken on start
    #[tokio::test(start_paused = true)]
    async fn test_first_sample_is_immediate() {
        let (sampler, calls) = ScriptedSampler::new(vec![Ok(snapshot(12.0, 34.0, 5000.0))]);
        let poller = ResourcePoller::new(sampler, Duration::from_secs(5));
        assert_eq!(poller.stats(), ResourceSnapshot::default());

        assert!(poller.start());
        sleep(Duration::from_millis(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_approx_eq!(poller.cpu_usage(), 12.0);
        assert_approx_eq!(poller.memory_usage(), 34.0);
        assert_approx_eq!(poller.disk_space_mb(), 5000.0);
        poller.stop().await;
    }

    /// Tests that a failed sample keeps the last good one
    #[tokio::test(start_paused = true)]
    async fn test_failed_sample_keeps_previous_snapshot() {
        let (sampler, calls) = ScriptedSampler::new(vec![
            Ok(snapshot(10.0, 20.0, 300.0)),
            Err(SampleError("sensor offline".into())),
            Ok(snapshot(50.0, 60.0, 700.0)),
        ]);
        let poller = ResourcePoller::new(sampler, Duration::from_secs(1));
        poller.start();

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_approx_eq!(poller.cpu_usage(), 10.0);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_approx_eq!(poller.cpu_usage(), 50.0);
        poller.stop().await;
    }

    /// Tests clamping of sampler output
    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_values_are_clamped() {
        let (sampler, _) = ScriptedSampler::new(vec![Ok(snapshot(180.0, 101.0, -1.0))]);
        let poller = ResourcePoller::new(sampler, Duration::from_secs(1));
        poller.start();
        sleep(Duration::from_millis(10)).await;

        let stats = poller.stats();
        assert_approx_eq!(stats.cpu_usage, 100.0);
        assert_approx_eq!(stats.memory_usage, 100.0);
        assert_approx_eq!(stats.disk_space_mb, 0.0);
        poller.stop().await;
    }

    /// Tests stop and restart of the poller
    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_sampling_and_allows_restart() {
        let (sampler, calls) = ScriptedSampler::new(vec![Ok(snapshot(1.0, 1.0, 1.0))]);
        let poller = ResourcePoller::new(sampler, Duration::from_secs(1));

        poller.stop().await;
        assert!(poller.start());
        assert!(!poller.start());
        sleep(Duration::from_millis(2500)).await;
        poller.stop().await;
        assert!(!poller.is_running());

        let after_stop = calls.load(Ordering::SeqCst);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);

        assert!(poller.start());
        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop + 1);
        poller.stop().await;
        poller.stop().await;
    }

    /// Tests the real host sampler
    #[test]
    fn test_host_sampler_reads_machine() {
        let mut sampler = HostSampler::new();
        if let Ok(sample) = sampler.sample() {
            let sample = sample.clamped();
            assert!((0.0..=100.0).contains(&sample.memory_usage));
            assert!(sample.disk_space_mb >= 0.0);
        }
    }
}
