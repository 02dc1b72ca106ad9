//! Transfer jobs and their results.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{Limits, TransferConfig};

/// Extension of the engine's native scene files.
pub const SCENE_EXTENSION: &str = "blend";

/// One (source, target) transfer. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferJob {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Where the retargeted scene is saved
    pub output: PathBuf,
    pub scale: f64,
    pub max_frames: u32,
    pub max_bones: u32,
    pub limits: Limits,
}

impl TransferJob {
    /// Build a job for `source` → `target` using run-wide settings.
    ///
    /// Paths are made absolute so the engine process, which has its own
    /// working directory, resolves them the same way.
    pub fn new(source: &Path, target: &Path, config: &TransferConfig) -> Self {
        let source = absolute(source);
        let target = absolute(target);
        let output = output_path_for(&source, &target);
        Self {
            source,
            target,
            output,
            scale: config.scale,
            max_frames: config.max_frames,
            max_bones: config.max_bones,
            limits: config.limits(),
        }
    }

    /// Short display name (source file name).
    pub fn name(&self) -> String {
        file_name(&self.source)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Output path for a transfer: `<source dir>/<source stem>_to_<target stem>.blend`.
pub fn output_path_for(source: &Path, target: &Path) -> PathBuf {
    let name = format!("{}_to_{}.{}", stem(source), stem(target), SCENE_EXTENSION);
    match source.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

/// True if `source` looks like an earlier output for `target`.
pub fn is_output_for(source: &Path, target: &Path) -> bool {
    stem(source).ends_with(&format!("_to_{}", stem(target)))
}

/// Which side of the transfer an armature was expected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmatureRole {
    Source,
    Target,
}

impl fmt::Display for ArmatureRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// No armature in the source or target scene
    NoArmatureFound { role: Option<ArmatureRole> },
    /// Source armature has no action with keyframes
    NoAnimationData,
    /// Wall-clock limit exceeded, engine terminated
    Timeout,
    /// Resident memory limit exceeded, engine terminated
    OutOfMemory,
    /// Engine executable missing or not runnable
    ProcessLaunchFailure,
    /// Non-zero exit without a recognized cause
    EngineInternalFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoArmatureFound { role: Some(role) } => write!(f, "no {role} armature found"),
            Self::NoArmatureFound { role: None } => f.write_str("no armature found"),
            Self::NoAnimationData => f.write_str("no animation data"),
            Self::Timeout => f.write_str("timeout"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::ProcessLaunchFailure => f.write_str("process launch failure"),
            Self::EngineInternalFailure => f.write_str("engine internal failure"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Success,
    Failed,
    Skipped,
}

/// Counters reported by the engine, parsed best-effort from its stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Source bones that exist in the target rig
    pub bones_mapped: u32,
    /// Source bones with no target counterpart
    pub bones_unmapped: u32,
    /// Mapped bones left out because of the bone cap
    pub bones_over_cap: u32,
    pub frames_processed: u32,
    pub keyframes_written: u64,
    /// Frame range was clamped to the frame cap
    pub truncated: bool,
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub source: PathBuf,
    pub output: PathBuf,
    pub status: TransferStatus,
    pub failure: Option<FailureKind>,
    /// Human-readable failure detail (engine error line, OS error, ...)
    pub detail: Option<String>,
    pub stats: TransferStats,
    pub exit_code: Option<i32>,
    pub elapsed_secs: f64,
}

impl TransferResult {
    pub fn success(job: &TransferJob, stats: TransferStats) -> Self {
        Self {
            source: job.source.clone(),
            output: job.output.clone(),
            status: TransferStatus::Success,
            failure: None,
            detail: None,
            stats,
            exit_code: Some(0),
            elapsed_secs: 0.0,
        }
    }

    pub fn failed(job: &TransferJob, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            source: job.source.clone(),
            output: job.output.clone(),
            status: TransferStatus::Failed,
            failure: Some(kind),
            detail: Some(detail.into()),
            stats: TransferStats::default(),
            exit_code: None,
            elapsed_secs: 0.0,
        }
    }

    pub fn skipped(job: &TransferJob, reason: impl Into<String>) -> Self {
        Self {
            source: job.source.clone(),
            output: job.output.clone(),
            status: TransferStatus::Skipped,
            failure: None,
            detail: Some(reason.into()),
            stats: TransferStats::default(),
            exit_code: None,
            elapsed_secs: 0.0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == TransferStatus::Failed
    }

    pub fn name(&self) -> String {
        file_name(&self.source)
    }
}
