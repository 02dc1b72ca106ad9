//! Best-effort parsing of the engine's standard output.
//!
//! The control script prints a handful of tagged lines between whatever the
//! engine itself logs:
//!
//! ```text
//! BONES source=["root","spine"]
//! BONES target=["root"]
//! RANGE first=1 last=240
//! PROGRESS frame=100/240
//! SUMMARY frames=240 bones=1 keyframes=720
//! WARNING unmapped bone skipped: tail.001
//! ERROR[NoArmatureFound:target] No target armature in scene
//! RESULT: SUCCESS
//! ```
//!
//! None of it is authoritative; the exit code decides success. These lines
//! only enrich the [`TransferResult`](crate::job::TransferResult).

use crate::job::{ArmatureRole, FailureKind, TransferStats};
use crate::retarget::{BoneMapping, FrameWindow};

pub const PROGRESS_TAG: &str = "PROGRESS";
pub const RANGE_TAG: &str = "RANGE";
pub const BONES_TAG: &str = "BONES";
pub const SUMMARY_TAG: &str = "SUMMARY";
pub const ERROR_TAG: &str = "ERROR[";
pub const RESULT_TAG: &str = "RESULT:";
pub const WARNING_TAG: &str = "WARNING ";

/// Classification of one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineLine {
    Progress { frame: u32, total: u32 },
    Range { first: i32, last: i32 },
    SourceBones(Vec<String>),
    TargetBones(Vec<String>),
    Summary { frames: u32, bones: u32, keyframes: u64 },
    Error { kind: FailureKind, detail: String },
    Result { success: bool },
    /// Recovered problem (unmapped bone, truncated range, ...)
    Warning(String),
    /// Anything else the engine printed
    Other,
}

impl EngineLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(ERROR_TAG) {
            return parse_error(rest).unwrap_or(Self::Other);
        }
        if let Some(rest) = line.strip_prefix(RESULT_TAG) {
            return Self::Result { success: rest.trim() == "SUCCESS" };
        }
        if let Some(rest) = line.strip_prefix(WARNING_TAG) {
            return Self::Warning(rest.trim().to_string());
        }
        let Some((tag, rest)) = line.split_once(' ') else {
            return Self::Other;
        };
        let parsed = match tag {
            PROGRESS_TAG => parse_progress(rest),
            RANGE_TAG => parse_range(rest),
            BONES_TAG => parse_bones(rest),
            SUMMARY_TAG => parse_summary(rest),
            _ => None,
        };
        parsed.unwrap_or(Self::Other)
    }
}

/// Value of `key=` among whitespace-separated `key=value` fields.
fn field<'a>(rest: &'a str, key: &str) -> Option<&'a str> {
    rest.split_whitespace()
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn parse_progress(rest: &str) -> Option<EngineLine> {
    let (frame, total) = field(rest, "frame")?.split_once('/')?;
    Some(EngineLine::Progress {
        frame: frame.parse().ok()?,
        total: total.parse().ok()?,
    })
}

fn parse_range(rest: &str) -> Option<EngineLine> {
    Some(EngineLine::Range {
        first: field(rest, "first")?.parse().ok()?,
        last: field(rest, "last")?.parse().ok()?,
    })
}

fn parse_bones(rest: &str) -> Option<EngineLine> {
    // Bone names may contain spaces, so the JSON list is everything after `=`.
    let (side, json) = rest.split_once('=')?;
    let names: Vec<String> = serde_json::from_str(json.trim()).ok()?;
    match side.trim() {
        "source" => Some(EngineLine::SourceBones(names)),
        "target" => Some(EngineLine::TargetBones(names)),
        _ => None,
    }
}

fn parse_summary(rest: &str) -> Option<EngineLine> {
    Some(EngineLine::Summary {
        frames: field(rest, "frames")?.parse().ok()?,
        bones: field(rest, "bones")?.parse().ok()?,
        keyframes: field(rest, "keyframes")?.parse().ok()?,
    })
}

fn parse_error(rest: &str) -> Option<EngineLine> {
    let (tag, detail) = rest.split_once(']')?;
    let (name, qualifier) = match tag.split_once(':') {
        Some((name, q)) => (name, Some(q)),
        None => (tag, None),
    };
    let kind = match name {
        "NoArmatureFound" => FailureKind::NoArmatureFound {
            role: match qualifier {
                Some("source") => Some(ArmatureRole::Source),
                Some("target") => Some(ArmatureRole::Target),
                _ => None,
            },
        },
        "NoAnimationData" => FailureKind::NoAnimationData,
        "OutOfMemory" => FailureKind::OutOfMemory,
        _ => FailureKind::EngineInternalFailure,
    };
    Some(EngineLine::Error {
        kind,
        detail: detail.trim().to_string(),
    })
}

/// Everything recognized in one engine run's stdout.
#[derive(Debug, Clone, Default)]
pub struct EngineReport {
    pub last_progress: Option<(u32, u32)>,
    pub range: Option<(i32, i32)>,
    pub source_bones: Option<Vec<String>>,
    pub target_bones: Option<Vec<String>>,
    pub summary: Option<(u32, u32, u64)>,
    pub error: Option<(FailureKind, String)>,
    pub result: Option<bool>,
}

impl EngineReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `line` and fold it into the report. Returns the classification.
    pub fn feed(&mut self, line: &str) -> EngineLine {
        let parsed = EngineLine::parse(line);
        match &parsed {
            EngineLine::Progress { frame, total } => self.last_progress = Some((*frame, *total)),
            EngineLine::Range { first, last } => self.range = Some((*first, *last)),
            EngineLine::SourceBones(names) => self.source_bones = Some(names.clone()),
            EngineLine::TargetBones(names) => self.target_bones = Some(names.clone()),
            EngineLine::Summary { frames, bones, keyframes } => {
                self.summary = Some((*frames, *bones, *keyframes));
            }
            // First error wins; later lines are usually fallout.
            EngineLine::Error { kind, detail } => {
                if self.error.is_none() {
                    self.error = Some((*kind, detail.clone()));
                }
            }
            EngineLine::Result { success } => self.result = Some(*success),
            EngineLine::Warning(_) | EngineLine::Other => {}
        }
        parsed
    }

    /// Bone mapping as reconstructed from the reported bone lists.
    pub fn mapping(&self) -> Option<BoneMapping> {
        match (&self.source_bones, &self.target_bones) {
            (Some(source), Some(target)) => Some(BoneMapping::intersect(source.as_slice(), target.as_slice())),
            _ => None,
        }
    }

    /// Counters for the job result, interpreted under the job's caps.
    pub fn stats(&self, max_frames: u32, max_bones: u32) -> TransferStats {
        let mut stats = TransferStats::default();

        if let Some(mapping) = self.mapping() {
            let (_, over) = mapping.split_at_cap(max_bones);
            stats.bones_mapped = count(mapping.len());
            stats.bones_unmapped = count(mapping.unmapped().len());
            stats.bones_over_cap = count(over);
        }
        if let Some((first, last)) = self.range {
            let window = FrameWindow::clamp(first, last, max_frames);
            stats.truncated = window.truncated();
        }
        // Without a summary the run ended early; progress is the last frame known done.
        match self.summary {
            Some((frames, _, keyframes)) => {
                stats.frames_processed = frames;
                stats.keyframes_written = keyframes;
            }
            None => stats.frames_processed = self.last_progress.map_or(0, |(frame, _)| frame),
        }
        stats
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_lines() {
        assert_eq!(
            EngineLine::parse("PROGRESS frame=100/240"),
            EngineLine::Progress { frame: 100, total: 240 }
        );
        assert_eq!(
            EngineLine::parse("RANGE first=-4 last=12"),
            EngineLine::Range { first: -4, last: 12 }
        );
        assert_eq!(
            EngineLine::parse("SUMMARY frames=240 bones=31 keyframes=22320"),
            EngineLine::Summary { frames: 240, bones: 31, keyframes: 22320 }
        );
        assert_eq!(EngineLine::parse("RESULT: SUCCESS"), EngineLine::Result { success: true });
        assert_eq!(EngineLine::parse("RESULT: FAILED"), EngineLine::Result { success: false });
        assert_eq!(
            EngineLine::parse("WARNING unmapped bone skipped: tail"),
            EngineLine::Warning("unmapped bone skipped: tail".into())
        );
    }

    #[test]
    fn test_parse_bones_with_spaces() {
        let line = r#"BONES source=["upper arm.L", "root"]"#;
        assert_eq!(
            EngineLine::parse(line),
            EngineLine::SourceBones(vec!["upper arm.L".into(), "root".into()])
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            EngineLine::parse("ERROR[NoArmatureFound:target] No target armature in scene"),
            EngineLine::Error {
                kind: FailureKind::NoArmatureFound { role: Some(ArmatureRole::Target) },
                detail: "No target armature in scene".into(),
            }
        );
        assert_eq!(
            EngineLine::parse("ERROR[NoAnimationData] nothing keyed"),
            EngineLine::Error { kind: FailureKind::NoAnimationData, detail: "nothing keyed".into() }
        );
        assert!(matches!(
            EngineLine::parse("ERROR[KeyError] 'pose'"),
            EngineLine::Error { kind: FailureKind::EngineInternalFailure, .. }
        ));
    }

    #[test]
    fn test_engine_noise_is_ignored() {
        assert_eq!(EngineLine::parse("Blender 4.2.1 LTS (hash 396f546c9d82 built 2024-08-19)"), EngineLine::Other);
        assert_eq!(EngineLine::parse("Read blend: \"/tmp/rig.blend\""), EngineLine::Other);
        assert_eq!(EngineLine::parse("PROGRESS garbage"), EngineLine::Other);
        assert_eq!(EngineLine::parse(""), EngineLine::Other);
    }

    #[test]
    fn test_stats_from_report() {
        let mut report = EngineReport::new();
        for line in [
            r#"BONES source=["root","spine","tail","head"]"#,
            r#"BONES target=["root","spine","head"]"#,
            "RANGE first=1 last=500",
            "PROGRESS frame=100/300",
            "SUMMARY frames=300 bones=2 keyframes=1800",
            "RESULT: SUCCESS",
        ] {
            report.feed(line);
        }

        let stats = report.stats(300, 2);
        assert_eq!(stats.bones_mapped, 3);
        assert_eq!(stats.bones_unmapped, 1);
        assert_eq!(stats.bones_over_cap, 1);
        assert!(stats.truncated);
        assert_eq!(stats.frames_processed, 300);
        assert_eq!(stats.keyframes_written, 1800);
        assert_eq!(report.last_progress, Some((100, 300)));
        assert_eq!(report.result, Some(true));
    }

    #[test]
    fn test_interrupted_run_counts_only_reported_frames() {
        let mut report = EngineReport::new();
        report.feed("RANGE first=1 last=5000");
        report.feed("PROGRESS frame=100/5000");
        report.feed("PROGRESS frame=200/5000");

        let stats = report.stats(10_000, 100);
        assert_eq!(stats.frames_processed, 200);
        assert_eq!(stats.keyframes_written, 0);
        assert!(!stats.truncated);

        let mut report = EngineReport::new();
        report.feed("RANGE first=1 last=5000");
        assert_eq!(report.stats(10_000, 100).frames_processed, 0);
    }

    #[test]
    fn test_first_error_wins() {
        let mut report = EngineReport::new();
        report.feed("ERROR[NoAnimationData] source armature has no keyed action");
        report.feed("ERROR[RuntimeError] context is incorrect");
        assert_eq!(report.error.map(|(k, _)| k), Some(FailureKind::NoAnimationData));
    }

    #[test]
    fn test_empty_report_stats() {
        let stats = EngineReport::new().stats(100, 100);
        assert_eq!(stats, TransferStats::default());
    }
}
