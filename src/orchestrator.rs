//! Engine process orchestration.
//!
//! One [`Orchestrator::run`] call = one engine process:
//!
//! 1. render the control script into a temp file
//! 2. spawn `blender -b <target> --python-exit-code 1 --python <script>`
//! 3. stream stdout/stderr on reader threads, start the [`ResourceMonitor`]
//! 4. block in `wait()` until the engine exits or the monitor stops it
//! 5. build a [`TransferResult`] from stop reason, exit code and stdout
//!
//! The temp script is removed when the run returns, whatever the outcome.
//! An output file written during a failed run is removed as well.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::job::{FailureKind, TransferJob, TransferResult};
use crate::monitor::{CancelToken, ProcessProbe, ResourceMonitor, StopReason, SystemProbe, KILL_GRACE, POLL_INTERVAL};
use crate::report::{EngineLine, EngineReport};
use crate::script::{ScriptGenerator, EXIT_NO_ANIMATION, EXIT_NO_ARMATURE};

/// Engine executable looked up on PATH when none is given.
pub const DEFAULT_ENGINE: &str = "blender";

/// Stderr lines kept for failure detail.
const STDERR_TAIL: usize = 20;

/// How to start the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    program: PathBuf,
}

impl EngineCommand {
    /// Use `program` as-is, without checking it exists.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// Resolve an explicit path, or `blender` on PATH.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let name = explicit.unwrap_or_else(|| Path::new(DEFAULT_ENGINE));
        let program = which::which(name).map_err(|e| Error::launch(name, e))?;
        tracing::debug!("engine executable: {}", program.display());
        Ok(Self { program })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, target: &Path, script: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-b")
            .arg(target)
            .args(["--python-exit-code", "1", "--python"])
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group: the monitor signals the engine together with
        // anything it spawns.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

/// Runs transfer jobs through the engine, one process per job.
pub struct Orchestrator {
    engine: EngineCommand,
    generator: ScriptGenerator,
    poll_interval: Duration,
    kill_grace: Duration,
}

impl Orchestrator {
    pub fn new(engine: EngineCommand) -> Result<Self> {
        Ok(Self {
            engine,
            generator: ScriptGenerator::new()?,
            poll_interval: POLL_INTERVAL,
            kill_grace: KILL_GRACE,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn engine(&self) -> &EngineCommand {
        &self.engine
    }

    /// Run `job` to completion. Never panics; local errors (script, spawn,
    /// wait) become a [`FailureKind::ProcessLaunchFailure`] result.
    pub fn run(&self, job: &TransferJob) -> TransferResult {
        let _span = tracing::info_span!("transfer", source = %job.name()).entered();
        let started = Instant::now();
        let output_before = modified(&job.output);

        let mut result = match self.execute(job, output_before) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("{e}");
                TransferResult::failed(job, FailureKind::ProcessLaunchFailure, e.to_string())
            }
        };

        if !result.is_success() {
            discard_output(&job.output, output_before);
        }
        result.elapsed_secs = started.elapsed().as_secs_f64();
        result
    }

    fn execute(&self, job: &TransferJob, output_before: Option<SystemTime>) -> Result<TransferResult> {
        let script = self.generator.render(job)?;
        let script_file = write_script(&script)?;
        tracing::debug!("control script: {}", script_file.path().display());

        let mut child = self
            .engine
            .command(&job.target, script_file.path())
            .spawn()
            .map_err(|e| Error::launch(self.engine.program(), e))?;
        let pid = child.id();
        tracing::info!(pid, "engine started: {} -b {}", self.engine.program().display(), job.target.display());

        let token = CancelToken::new();
        let monitor = ResourceMonitor::new(job.limits)
            .with_interval(self.poll_interval)
            .with_grace(self.kill_grace)
            .spawn(pid, token);

        let report = Arc::new(Mutex::new(EngineReport::new()));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
        let (done_tx, done_rx) = channel();
        let readers: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|out| spawn_reader(out, Stream::Stdout(report.clone()), done_tx.clone())),
            child
                .stderr
                .take()
                .map(|err| spawn_reader(err, Stream::Stderr(stderr_tail.clone()), done_tx.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();
        drop(done_tx);

        let status = child.wait();
        let stop = monitor.finish();
        self.drain_readers(pid, readers, &done_rx);

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        let report = report.lock();
        let tail: Vec<String> = stderr_tail.lock().iter().cloned().collect();
        let written = output_written(&job.output, output_before);
        Ok(interpret(job, status, stop, &report, &tail, written))
    }

    /// Wait for both pipes to close. Processes the engine left running keep
    /// them open; after the grace period the engine's process group is
    /// killed, and after another one the readers are abandoned.
    fn drain_readers(&self, pid: u32, readers: Vec<JoinHandle<()>>, done: &Receiver<()>) {
        let mut open = readers.len();
        let mut killed = false;
        while open > 0 {
            match done.recv_timeout(self.kill_grace) {
                Ok(()) => open -= 1,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) if !killed => {
                    tracing::warn!(pid, "engine exited but left processes holding its output, killing them");
                    SystemProbe::new().kill(pid);
                    killed = true;
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(pid, "engine output still open, not waiting for it");
                    return;
                }
            }
        }
        for reader in readers {
            let _ = reader.join();
        }
    }
}

fn write_script(script: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("blend-retarget-")
        .suffix(".py")
        .tempfile()?;
    file.write_all(script.as_bytes())?;
    file.flush()?;
    Ok(file)
}

enum Stream {
    Stdout(Arc<Mutex<EngineReport>>),
    Stderr(Arc<Mutex<VecDeque<String>>>),
}

fn spawn_reader<R: Read + Send + 'static>(pipe: R, stream: Stream, done: Sender<()>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end();
            match &stream {
                Stream::Stdout(report) => log_stdout(report.lock().feed(line), line),
                Stream::Stderr(tail) => {
                    tracing::debug!(target: "engine", "stderr: {line}");
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
        }
        let _ = done.send(());
    })
}

fn log_stdout(parsed: EngineLine, line: &str) {
    match parsed {
        EngineLine::Progress { frame, total } => tracing::info!(target: "engine", "frame {frame}/{total}"),
        EngineLine::Warning(msg) => tracing::warn!(target: "engine", "{msg}"),
        EngineLine::Error { detail, .. } => tracing::error!(target: "engine", "{detail}"),
        // Bone lists can be long; the summary has the counts.
        EngineLine::SourceBones(names) => tracing::debug!(target: "engine", "source bones: {}", names.len()),
        EngineLine::TargetBones(names) => tracing::debug!(target: "engine", "target bones: {}", names.len()),
        _ => tracing::debug!(target: "engine", "{line}"),
    }
}

/// Turn what we observed about the engine run into a job result.
fn interpret(
    job: &TransferJob,
    status: ExitStatus,
    stop: Option<StopReason>,
    report: &EngineReport,
    stderr_tail: &[String],
    output_written: bool,
) -> TransferResult {
    let stats = report.stats(job.max_frames, job.max_bones);

    if let Some(reason) = stop {
        let kind = match reason {
            StopReason::Timeout { .. } => FailureKind::Timeout,
            StopReason::OutOfMemory { .. } => FailureKind::OutOfMemory,
        };
        let mut result = TransferResult::failed(job, kind, reason.to_string());
        result.stats = stats;
        result.exit_code = status.code();
        return result;
    }

    if status.success() {
        if !output_written {
            let mut result = TransferResult::failed(
                job,
                FailureKind::EngineInternalFailure,
                format!("engine exited cleanly but did not write {}", job.output.display()),
            );
            result.exit_code = Some(0);
            return result;
        }
        if report.result == Some(false) {
            tracing::warn!("engine reported failure but exited with status 0");
        }
        if stats.bones_unmapped > 0 {
            tracing::warn!("partial mapping: {} source bones have no target counterpart", stats.bones_unmapped);
        }
        if stats.truncated {
            tracing::warn!("frame range truncated to {} frames", stats.frames_processed);
        }
        return TransferResult::success(job, stats);
    }

    let kind = report
        .error
        .as_ref()
        .map(|(kind, _)| *kind)
        .or_else(|| kind_from_exit_code(status.code()))
        .unwrap_or(FailureKind::EngineInternalFailure);
    let detail = report
        .error
        .as_ref()
        .map(|(_, detail)| detail.clone())
        .or_else(|| stderr_tail.last().cloned())
        .unwrap_or_else(|| describe_status(status));

    let mut result = TransferResult::failed(job, kind, detail);
    result.stats = stats;
    result.exit_code = status.code();
    result
}

fn kind_from_exit_code(code: Option<i32>) -> Option<FailureKind> {
    match code {
        Some(EXIT_NO_ARMATURE) => Some(FailureKind::NoArmatureFound { role: None }),
        Some(EXIT_NO_ANIMATION) => Some(FailureKind::NoAnimationData),
        _ => None,
    }
}

fn describe_status(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("engine killed by signal {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("engine exited with status {code}"),
        None => "engine exited abnormally".to_string(),
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// `output` exists and was created or rewritten since `before` was taken.
fn output_written(output: &Path, before: Option<SystemTime>) -> bool {
    match (modified(output), before) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(now), Some(before)) => now != before,
    }
}

/// Remove `output` if this run created or touched it.
fn discard_output(output: &Path, before: Option<SystemTime>) {
    let now = modified(output);
    if now.is_none() || now == before {
        return;
    }
    match std::fs::remove_file(output) {
        Ok(()) => tracing::info!("removed incomplete output {}", output.display()),
        Err(e) => tracing::warn!("could not remove incomplete output {}: {e}", output.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;

    #[cfg(unix)]
    fn exit_status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    fn job() -> TransferJob {
        TransferJob::new(Path::new("/nonexistent/walk.blend"), Path::new("/nonexistent/rig.blend"), &TransferConfig::default())
    }

    #[test]
    fn test_kind_from_exit_code() {
        assert_eq!(kind_from_exit_code(Some(2)), Some(FailureKind::NoArmatureFound { role: None }));
        assert_eq!(kind_from_exit_code(Some(3)), Some(FailureKind::NoAnimationData));
        assert_eq!(kind_from_exit_code(Some(1)), None);
        assert_eq!(kind_from_exit_code(None), None);
    }

    #[test]
    fn test_resolve_missing_engine() {
        let err = EngineCommand::resolve(Some(Path::new("/nonexistent/blender"))).unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
    }

    #[test]
    fn test_launch_failure_result() {
        let orchestrator = Orchestrator::new(EngineCommand::new("/nonexistent/blender")).unwrap();
        let result = orchestrator.run(&job());
        assert!(result.is_failure());
        assert_eq!(result.failure, Some(FailureKind::ProcessLaunchFailure));
        assert!(result.detail.unwrap().contains("/nonexistent/blender"));
    }

    #[cfg(unix)]
    #[test]
    fn test_interpret_error_line_wins() {
        let mut report = EngineReport::new();
        report.feed("ERROR[NoArmatureFound:source] No armature in /a/walk.blend");
        let result = interpret(&job(), exit_status(2), None, &report, &[], false);
        assert_eq!(
            result.failure,
            Some(FailureKind::NoArmatureFound { role: Some(crate::job::ArmatureRole::Source) })
        );
        assert_eq!(result.exit_code, Some(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_interpret_exit_code_fallback() {
        let result = interpret(&job(), exit_status(3), None, &EngineReport::new(), &[], false);
        assert_eq!(result.failure, Some(FailureKind::NoAnimationData));

        let tail = vec!["Segmentation fault".to_string()];
        let result = interpret(&job(), exit_status(139), None, &EngineReport::new(), &tail, false);
        assert_eq!(result.failure, Some(FailureKind::EngineInternalFailure));
        assert_eq!(result.detail.as_deref(), Some("Segmentation fault"));
    }

    #[cfg(unix)]
    #[test]
    fn test_interpret_monitor_stop_wins() {
        let stop = StopReason::Timeout { elapsed: Duration::from_secs(601) };
        let result = interpret(&job(), exit_status(0), Some(stop), &EngineReport::new(), &[], false);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
    }

    #[cfg(unix)]
    #[test]
    fn test_interpret_success_requires_output() {
        let result = interpret(&job(), exit_status(0), None, &EngineReport::new(), &[], false);
        assert_eq!(result.failure, Some(FailureKind::EngineInternalFailure));
    }

    #[test]
    fn test_output_written_needs_a_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk_to_rig.blend");
        assert!(!output_written(&path, None));

        std::fs::write(&path, b"earlier run").unwrap();
        assert!(output_written(&path, None));
        assert!(!output_written(&path, modified(&path)));
    }

    #[cfg(unix)]
    #[test]
    fn test_interpret_stale_output_is_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let job = TransferJob::new(&dir.path().join("walk.blend"), &dir.path().join("rig.blend"), &TransferConfig::default());
        std::fs::write(&job.output, b"earlier run").unwrap();

        let result = interpret(&job, exit_status(0), None, &EngineReport::new(), &[], false);
        assert_eq!(result.failure, Some(FailureKind::EngineInternalFailure));

        let result = interpret(&job, exit_status(0), None, &EngineReport::new(), &[], true);
        assert!(result.is_success());
    }

    #[test]
    fn test_discard_output_keeps_untouched_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk_to_rig.blend");
        std::fs::write(&path, b"previous good result").unwrap();
        let before = modified(&path);

        discard_output(&path, before);
        assert!(path.exists());

        discard_output(&path, None);
        assert!(!path.exists());
    }
}
