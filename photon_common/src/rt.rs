//! Real-time task plumbing.
//!
//! ## RT setup sequence
//! 1. `mlockall(MCL_CURRENT | MCL_FUTURE)` - lock all pages.
//! 2. Prefault stack pages.
//! 3. `sched_setaffinity` - pin to an isolated CPU core.
//! 4. `sched_setscheduler(SCHED_FIFO, prio)` - RT priority.
//!
//! All RT system calls sit behind the `rt` cargo feature and become
//! no-ops in simulation builds, so tests and development machines run
//! without privileges.
//!
//! Periodic pacing goes through the [`Pacer`] trait: the production
//! implementation sleeps to absolute deadlines for drift-free cycles,
//! while [`ManualPacer`] advances a virtual clock so tests can drive
//! the step generator deterministically.

use std::time::Duration;

/// Errors during RT setup.
#[derive(Debug, thiserror::Error)]
pub enum RtError {
    #[error("RT setup error: {0}")]
    Setup(String),
}

/// CPU/priority hints for a real-time task.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtConfig {
    /// CPU core to pin to, if any.
    pub cpu: Option<usize>,
    /// SCHED_FIFO priority, if any.
    pub priority: Option<i32>,
}

/// Lock all current and future memory pages.
///
/// No-op when the `rt` feature is not enabled.
#[cfg(feature = "rt")]
fn rt_mlockall() -> Result<(), RtError> {
    use nix::sys::mman::{MlockAllFlags, mlockall};
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
        .map_err(|e| RtError::Setup(format!("mlockall failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_mlockall() -> Result<(), RtError> {
    Ok(()) // No-op in simulation mode
}

/// Prefault stack pages to prevent page faults during RT execution.
fn prefault_stack() {
    let mut buf = [0u8; 64 * 1024];
    for byte in buf.iter_mut() {
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

/// Pin the current thread to a specific CPU core.
#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), RtError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| RtError::Setup(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| RtError::Setup(format!("sched_setaffinity failed: {e}")))?;
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), RtError> {
    Ok(())
}

/// Set SCHED_FIFO with the given RT priority on the current thread.
#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), RtError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(RtError::Setup(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), RtError> {
    Ok(())
}

/// Apply the full RT setup sequence to the current thread.
///
/// Must run before the task enters its periodic loop. In simulation
/// builds every RT call is a no-op.
pub fn rt_setup(config: RtConfig) -> Result<(), RtError> {
    rt_mlockall()?;
    prefault_stack();
    if let Some(cpu) = config.cpu {
        rt_set_affinity(cpu)?;
    }
    if let Some(priority) = config.priority {
        rt_set_scheduler(priority)?;
    }
    Ok(())
}

// ─── Pacing ─────────────────────────────────────────────────────────

/// Periodic wait abstraction for real-time loops.
pub trait Pacer: Send {
    /// Configured loop period.
    fn period(&self) -> Duration;

    /// Block until the next period boundary.
    fn wait(&mut self);

    /// Re-anchor the deadline to "now" (after a suspension).
    fn rearm(&mut self);
}

/// Absolute-deadline pacer on the monotonic clock.
///
/// Deadlines advance by whole periods from an anchor, so a late wake
/// does not accumulate drift.
pub struct MonotonicPacer {
    period: Duration,
    next: std::time::Instant,
}

impl MonotonicPacer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: std::time::Instant::now() + period,
        }
    }
}

impl Pacer for MonotonicPacer {
    fn period(&self) -> Duration {
        self.period
    }

    fn wait(&mut self) {
        let now = std::time::Instant::now();
        if let Some(remaining) = self.next.checked_duration_since(now) {
            std::thread::sleep(remaining);
        }
        self.next += self.period;
        // If we overran more than a full period, re-anchor instead of
        // bursting to catch up.
        if self.next < std::time::Instant::now() {
            self.next = std::time::Instant::now() + self.period;
        }
    }

    fn rearm(&mut self) {
        self.next = std::time::Instant::now() + self.period;
    }
}

/// Test-only pacer advancing a virtual clock; never blocks.
pub struct ManualPacer {
    period: Duration,
    /// Virtual time elapsed across all waits.
    pub elapsed: Duration,
    /// Number of periods waited.
    pub waits: u64,
}

impl ManualPacer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            elapsed: Duration::ZERO,
            waits: 0,
        }
    }
}

impl Pacer for ManualPacer {
    fn period(&self) -> Duration {
        self.period
    }

    fn wait(&mut self) {
        self.elapsed += self.period;
        self.waits += 1;
    }

    fn rearm(&mut self) {}
}

/// Spawn a named thread that applies `config` before running `body`.
///
/// RT setup failures are logged and the thread continues without RT
/// scheduling; simulation builds never fail here.
pub fn spawn_task<F>(name: &str, config: RtConfig, body: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let label = name.to_owned();
    std::thread::Builder::new()
        .name(label.clone())
        .spawn(move || {
            if let Err(e) = rt_setup(config) {
                tracing::warn!(task = %label, "RT setup degraded: {e}");
            }
            body();
        })
        .expect("thread spawn")
}
