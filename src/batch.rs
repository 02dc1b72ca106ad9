//! Batch driver: one or many sources against a single target.

use serde::Serialize;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::job::{is_output_for, TransferJob, TransferResult, TransferStatus, SCENE_EXTENSION};
use crate::orchestrator::Orchestrator;

/// Something that can execute a transfer job.
pub trait JobRunner {
    fn run(&mut self, job: &TransferJob) -> TransferResult;
}

impl JobRunner for Orchestrator {
    fn run(&mut self, job: &TransferJob) -> TransferResult {
        Orchestrator::run(self, job)
    }
}

impl<F> JobRunner for F
where
    F: FnMut(&TransferJob) -> TransferResult,
{
    fn run(&mut self, job: &TransferJob) -> TransferResult {
        self(job)
    }
}

fn is_scene_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(SCENE_EXTENSION))
}

/// Check the target is an existing scene file.
pub fn validate_target(target: &Path) -> Result<()> {
    if !target.is_file() {
        return Err(Error::FileNotFound(target.to_path_buf()));
    }
    if !is_scene_file(target) {
        return Err(Error::NotSceneFile(target.to_path_buf()));
    }
    Ok(())
}

/// Source scene files for `path`: the file itself, or every `.blend` file
/// directly inside the directory, sorted by name.
pub fn discover_sources(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        if !is_scene_file(path) {
            return Err(Error::NotSceneFile(path.to_path_buf()));
        }
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(Error::FileNotFound(path.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::other(format!("reading {}: {e}", path.display())))?;
        if entry.path().is_file() && is_scene_file(entry.path()) {
            files.push(entry.into_path());
        }
    }
    if files.is_empty() {
        return Err(Error::NoSources(path.to_path_buf()));
    }

    tracing::info!("found {} .blend files in {}", files.len(), path.display());
    for f in &files {
        tracing::info!("  - {}", f.file_name().unwrap_or_default().to_string_lossy());
    }
    Ok(files)
}

/// Jobs for every source against `target`, in order.
pub fn plan_jobs(sources: &[PathBuf], target: &Path, config: &TransferConfig) -> Vec<TransferJob> {
    sources
        .iter()
        .map(|source| TransferJob::new(source, target, config))
        .collect()
}

/// Why a job is not worth running, if it isn't.
fn skip_reason(job: &TransferJob) -> Option<&'static str> {
    if job.source == job.target {
        Some("source is the target file")
    } else if is_output_for(&job.source, &job.target) {
        Some("source is an earlier output for this target")
    } else {
        None
    }
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    /// Jobs planned, including ones never attempted
    pub planned: usize,
    /// Results in job order, attempted or skipped jobs only
    pub results: Vec<TransferResult>,
    /// Batch stopped early on a failure
    pub stopped_early: bool,
}

impl BatchSummary {
    fn count(&self, status: TransferStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(TransferStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(TransferStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(TransferStatus::Skipped)
    }

    /// No job failed.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn first_failure(&self) -> Option<&TransferResult> {
        self.results.iter().find(|r| r.is_failure())
    }

    /// Write the summary as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Runs jobs strictly one after another.
pub struct BatchDriver<R> {
    runner: R,
    continue_on_error: bool,
}

impl<R: JobRunner> BatchDriver<R> {
    pub fn new(runner: R, continue_on_error: bool) -> Self {
        Self { runner, continue_on_error }
    }

    pub fn run(&mut self, jobs: &[TransferJob]) -> BatchSummary {
        let mut summary = BatchSummary {
            planned: jobs.len(),
            ..Default::default()
        };

        for (i, job) in jobs.iter().enumerate() {
            tracing::info!("[{}/{}] processing {}", i + 1, jobs.len(), job.name());

            if let Some(reason) = skip_reason(job) {
                tracing::info!("skipping {}: {reason}", job.name());
                summary.results.push(TransferResult::skipped(job, reason));
                continue;
            }

            let result = self.runner.run(job);
            match result.status {
                TransferStatus::Success => {
                    tracing::info!("done in {:.1}s: {}", result.elapsed_secs, result.output.display());
                }
                TransferStatus::Failed => {
                    let kind = result.failure.map(|k| k.to_string()).unwrap_or_default();
                    let detail = result.detail.as_deref().unwrap_or_default();
                    tracing::error!("{} failed ({kind}): {detail}", job.name());
                }
                TransferStatus::Skipped => {}
            }

            let failed = result.is_failure();
            summary.results.push(result);
            if failed && !self.continue_on_error {
                if i + 1 < jobs.len() {
                    tracing::warn!("stopping due to failure; use --continue-on-error to process remaining files");
                    summary.stopped_early = true;
                }
                break;
            }
        }
        summary
    }
}
