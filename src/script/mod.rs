//! Control-script generation.
//!
//! Renders the Python script Blender executes for one job. Every parameter
//! is baked in as a literal: the script runs in another process and must
//! not depend on our environment.

use std::path::Path;

use minijinja::{context, Environment, UndefinedBehavior};

use crate::error::{Error, Result};
use crate::job::TransferJob;

const TEMPLATE_NAME: &str = "retarget.py";
const TEMPLATE: &str = include_str!("retarget.py.j2");

/// Frames between `PROGRESS` lines.
pub const PROGRESS_INTERVAL: u32 = 100;

/// Exit code for an unclassified failure inside the engine.
pub const EXIT_INTERNAL: i32 = 1;
/// Exit code when the source or target scene has no armature.
pub const EXIT_NO_ARMATURE: i32 = 2;
/// Exit code when the source armature has no keyed action.
pub const EXIT_NO_ANIMATION: i32 = 3;

/// Renders control scripts from the embedded template.
pub struct ScriptGenerator {
    env: Environment<'static>,
}

impl ScriptGenerator {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        // A missing variable would leave a hole in the Python source.
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template(TEMPLATE_NAME, TEMPLATE)?;
        Ok(Self { env })
    }

    /// Script performing `job`.
    pub fn render(&self, job: &TransferJob) -> Result<String> {
        let template = self.env.get_template(TEMPLATE_NAME)?;
        let script = template.render(context! {
            version => env!("CARGO_PKG_VERSION"),
            build => build_stamp(),
            source_path => python_path_literal(&job.source)?,
            output_path => python_path_literal(&job.output)?,
            scale => python_float_literal(job.scale)?,
            max_frames => job.max_frames,
            max_bones => job.max_bones,
            progress_interval => PROGRESS_INTERVAL,
            exit_internal => EXIT_INTERNAL,
            exit_no_armature => EXIT_NO_ARMATURE,
            exit_no_animation => EXIT_NO_ANIMATION,
        })?;
        Ok(script)
    }
}

fn build_stamp() -> &'static str {
    option_env!("BLEND_RETARGET_BUILD_DATE").unwrap_or("unknown")
}

/// Python string literal for `s`.
///
/// A JSON string is also a valid Python string literal, escapes included.
pub fn python_string_literal(s: &str) -> Result<String> {
    Ok(serde_json::to_string(s)?)
}

fn python_path_literal(path: &Path) -> Result<String> {
    let s = path
        .to_str()
        .ok_or_else(|| Error::other(format!("path is not valid UTF-8: {}", path.display())))?;
    python_string_literal(s)
}

/// Python float literal for `v`. Always carries a `.` or exponent.
pub fn python_float_literal(v: f64) -> Result<String> {
    if !v.is_finite() {
        return Err(Error::config(format!("cannot embed non-finite number {v}")));
    }
    // Debug formatting keeps a trailing `.0` and round-trips exactly.
    Ok(format!("{v:?}"))
}
