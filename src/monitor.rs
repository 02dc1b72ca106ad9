//! Resource monitor for the engine subprocess.
//!
//! Runs on its own thread next to the orchestrator's blocking `wait()`. The
//! two sides share a [`CancelToken`] and a stop channel:
//!
//! - monitor detects a breach → records the reason in the token, asks the
//!   engine's process group to terminate, force-kills it after a grace period
//! - waiter sees the child exit → drops the stop channel, which wakes the
//!   monitor immediately
//!
//! The waiter owns the child handle and reaps it, so no zombie is left behind.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};
#[cfg(not(unix))]
use sysinfo::Signal;

use crate::config::Limits;

/// Default time between polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default time between the terminate request and the hard kill.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Why the monitor stopped the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Timeout { elapsed: Duration },
    OutOfMemory { rss_bytes: u64 },
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { elapsed } => write!(f, "timed out after {:.1}s", elapsed.as_secs_f64()),
            Self::OutOfMemory { rss_bytes } => {
                write!(f, "memory exceeded ({:.1}MB resident)", *rss_bytes as f64 / (1024.0 * 1024.0))
            }
        }
    }
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<StopReason>>,
}

/// Shared "stop the engine" signal. Cloning shares the same token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with `reason`. Returns false if already cancelled; the first
    /// reason is kept.
    pub fn cancel(&self, reason: StopReason) -> bool {
        let mut slot = self.inner.reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        self.inner.cancelled.store(true, Ordering::Release);
        true
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.inner.reason.lock()
    }
}

/// OS access the monitor needs. Swappable so the polling logic can be
/// exercised without real processes.
pub trait ProcessProbe: Send + 'static {
    /// Resident memory of `pid` in bytes, `None` if the process is gone.
    fn rss_bytes(&mut self, pid: u32) -> Option<u64>;

    /// Politely ask `pid` and its process group to exit. Returns false if
    /// nothing was left to signal.
    fn terminate(&mut self, pid: u32) -> bool;

    /// Force-kill `pid` and its process group. Returns false if nothing was
    /// left to signal.
    fn kill(&mut self, pid: u32) -> bool;
}

/// [`ProcessProbe`] backed by `sysinfo`.
///
/// On unix the engine leads its own process group, so signals go to the
/// whole group and reach anything the engine started.
pub struct SystemProbe {
    system: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self { system: System::new() }
    }

    fn refresh(&mut self, pid: Pid) {
        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProbe {
    fn rss_bytes(&mut self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        self.refresh(pid);
        self.system.process(pid).map(|p| p.memory())
    }

    #[cfg(unix)]
    fn terminate(&mut self, pid: u32) -> bool {
        signal_group(pid, libc::SIGTERM)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        self.refresh(pid);
        match self.system.process(pid) {
            // Platforms without SIGTERM fall back to a hard kill.
            Some(p) => p.kill_with(Signal::Term).unwrap_or_else(|| p.kill()),
            None => false,
        }
    }

    #[cfg(unix)]
    fn kill(&mut self, pid: u32) -> bool {
        signal_group(pid, libc::SIGKILL)
    }

    #[cfg(not(unix))]
    fn kill(&mut self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        self.refresh(pid);
        self.system.process(pid).map(|p| p.kill()).unwrap_or(false)
    }
}

/// Send `signal` to the process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    // 0 and 1 would address our own group or every process we may signal.
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    // SAFETY: kill(2) takes no pointers; a negative pid addresses a group.
    unsafe { libc::kill(-pgid, signal) == 0 }
}

/// Polls a process against [`Limits`].
pub struct ResourceMonitor<P = SystemProbe> {
    limits: Limits,
    interval: Duration,
    grace: Duration,
    probe: P,
}

impl ResourceMonitor<SystemProbe> {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            interval: POLL_INTERVAL,
            grace: KILL_GRACE,
            probe: SystemProbe::new(),
        }
    }
}

impl<P: ProcessProbe> ResourceMonitor<P> {
    /// Replace the OS probe.
    pub fn with_probe<Q: ProcessProbe>(self, probe: Q) -> ResourceMonitor<Q> {
        ResourceMonitor {
            limits: self.limits,
            interval: self.interval,
            grace: self.grace,
            probe,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Start polling `pid` on a background thread.
    pub fn spawn(self, pid: u32, token: CancelToken) -> MonitorHandle {
        let (stop_tx, stop_rx) = channel::<()>();
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name(format!("monitor-{pid}"))
            .spawn(move || self.run(pid, &thread_token, &stop_rx));

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::error!("failed to start resource monitor: {e}");
                None
            }
        };

        MonitorHandle {
            stop_tx: Some(stop_tx),
            handle,
            token,
        }
    }

    fn run(mut self, pid: u32, token: &CancelToken, stop_rx: &Receiver<()>) {
        let started = Instant::now();
        let max_rss = self.limits.max_memory_bytes();
        loop {
            match stop_rx.recv_timeout(self.interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let elapsed = started.elapsed();
            if elapsed > self.limits.timeout {
                self.breach(pid, token, StopReason::Timeout { elapsed }, stop_rx);
                return;
            }

            let Some(rss) = self.probe.rss_bytes(pid) else {
                // Exited between polls; the waiter will notice.
                tracing::debug!(pid, "monitored process is gone");
                return;
            };
            tracing::trace!(pid, rss_mb = rss / (1024 * 1024), elapsed_s = elapsed.as_secs(), "poll");
            if rss > max_rss {
                self.breach(pid, token, StopReason::OutOfMemory { rss_bytes: rss }, stop_rx);
                return;
            }
        }
    }

    fn breach(&mut self, pid: u32, token: &CancelToken, reason: StopReason, stop_rx: &Receiver<()>) {
        // Once the waiter has reaped the engine its pid may belong to
        // someone else; never signal past that point.
        if !still_waiting(stop_rx) {
            return;
        }
        tracing::warn!(pid, "stopping engine: {reason}");
        token.cancel(reason);

        if !self.probe.terminate(pid) {
            return;
        }
        match stop_rx.recv_timeout(self.grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                if still_waiting(stop_rx) {
                    tracing::warn!(pid, "engine ignored terminate, killing");
                    self.probe.kill(pid);
                }
            }
        }
    }
}

/// The waiter has not seen the process exit yet.
fn still_waiting(stop_rx: &Receiver<()>) -> bool {
    matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

/// Handle to a running monitor thread.
pub struct MonitorHandle {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    token: CancelToken,
}

impl MonitorHandle {
    /// Tell the monitor the process has exited, join it, and return the
    /// breach that stopped the process, if any.
    pub fn finish(mut self) -> Option<StopReason> {
        self.stop();
        self.token.reason()
    }

    fn stop(&mut self) {
        // Dropping the sender disconnects the channel and wakes the monitor.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// Fake process whose memory is set by the test.
    #[derive(Clone, Default)]
    struct FakeProbe {
        rss: Arc<AtomicU64>,
        gone: Arc<AtomicBool>,
        /// Process exits when asked to terminate
        obeys_terminate: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ProcessProbe for FakeProbe {
        fn rss_bytes(&mut self, _pid: u32) -> Option<u64> {
            if self.gone.load(Ordering::SeqCst) {
                None
            } else {
                Some(self.rss.load(Ordering::SeqCst))
            }
        }

        fn terminate(&mut self, _pid: u32) -> bool {
            self.calls.lock().push("terminate");
            if self.obeys_terminate {
                self.gone.store(true, Ordering::SeqCst);
            }
            true
        }

        fn kill(&mut self, _pid: u32) -> bool {
            self.calls.lock().push("kill");
            self.gone.store(true, Ordering::SeqCst);
            true
        }
    }

    fn limits(timeout_ms: u64, max_memory_mb: u64) -> Limits {
        Limits::new(Duration::from_millis(timeout_ms), max_memory_mb)
    }

    #[test]
    fn test_token_first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel(StopReason::OutOfMemory { rss_bytes: 1 }));
        assert!(!token.cancel(StopReason::Timeout { elapsed: Duration::ZERO }));
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(StopReason::OutOfMemory { rss_bytes: 1 }));
    }

    #[test]
    fn test_timeout_terminates_then_kills() {
        let probe = FakeProbe::default();
        let calls = probe.calls.clone();
        let token = CancelToken::new();

        let handle = ResourceMonitor::new(limits(100, 1024))
            .with_probe(probe)
            .with_interval(Duration::from_millis(20))
            .with_grace(Duration::from_millis(50))
            .spawn(1, token.clone());

        thread::sleep(Duration::from_millis(400));
        assert!(token.is_cancelled());
        let reason = handle.finish();
        assert!(matches!(reason, Some(StopReason::Timeout { .. })));
        assert_eq!(*calls.lock(), vec!["terminate", "kill"]);
    }

    #[test]
    fn test_memory_breach() {
        let probe = FakeProbe {
            obeys_terminate: true,
            ..Default::default()
        };
        probe.rss.store(64 * 1024 * 1024, Ordering::SeqCst);
        let rss = probe.rss.clone();
        let calls = probe.calls.clone();
        let token = CancelToken::new();

        let handle = ResourceMonitor::new(limits(60_000, 128))
            .with_probe(probe)
            .with_interval(Duration::from_millis(20))
            .spawn(1, token.clone());

        thread::sleep(Duration::from_millis(100));
        assert!(!token.is_cancelled(), "under the cap");

        rss.store(256 * 1024 * 1024, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200));

        let reason = handle.finish();
        assert_eq!(reason, Some(StopReason::OutOfMemory { rss_bytes: 256 * 1024 * 1024 }));
        assert_eq!(*calls.lock(), vec!["terminate"]);
    }

    #[test]
    fn test_finish_before_breach() {
        let token = CancelToken::new();
        let started = Instant::now();
        let handle = ResourceMonitor::new(limits(60_000, 1024))
            .with_probe(FakeProbe::default())
            .spawn(1, token.clone());

        assert_eq!(handle.finish(), None);
        assert!(!token.is_cancelled());
        // Stop channel wakes the monitor instead of waiting out the interval.
        assert!(started.elapsed() < POLL_INTERVAL);
    }

    #[test]
    fn test_vanished_process_is_not_an_error() {
        let probe = FakeProbe::default();
        probe.gone.store(true, Ordering::SeqCst);
        let calls = probe.calls.clone();
        let token = CancelToken::new();

        let handle = ResourceMonitor::new(limits(60_000, 1))
            .with_probe(probe)
            .with_interval(Duration::from_millis(10))
            .spawn(1, token.clone());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(handle.finish(), None);
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_no_signal_after_process_was_reaped() {
        let probe = FakeProbe::default();
        let calls = probe.calls.clone();
        let token = CancelToken::new();
        let mut monitor = ResourceMonitor::new(limits(10, 1024)).with_probe(probe);

        let (stop_tx, stop_rx) = channel::<()>();
        drop(stop_tx);
        monitor.breach(1, &token, StopReason::Timeout { elapsed: Duration::from_millis(20) }, &stop_rx);

        assert!(calls.lock().is_empty());
        assert!(!token.is_cancelled(), "an engine that exited on its own did not time out");
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_group_rejects_reserved_ids() {
        assert!(!signal_group(0, libc::SIGTERM));
        assert!(!signal_group(1, libc::SIGTERM));
        assert!(!signal_group(u32::MAX, libc::SIGTERM));
    }

    #[test]
    fn test_stop_reason_display() {
        let r = StopReason::Timeout { elapsed: Duration::from_millis(1500) };
        assert_eq!(r.to_string(), "timed out after 1.5s");
        let r = StopReason::OutOfMemory { rss_bytes: 5 * 1024 * 1024 };
        assert!(r.to_string().contains("5.0MB"));
    }
}
