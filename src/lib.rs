//! # blend-retarget
//!
//! Transfers keyframe animation between Blender rigs of different size.
//! Bone translations are multiplied by a uniform scale factor; rotation and
//! scale channels are copied unchanged.
//!
//! The animation work runs inside Blender itself. This crate generates the
//! control script, runs Blender headless under time and memory limits, and
//! turns what comes back (exit code, stdout) into structured results.
//!
//! ## Modules
//!
//! - [`config`] - Run settings and safety limits
//! - [`job`] - Transfer jobs, results, output naming
//! - [`script`] - Control-script generation
//! - [`monitor`] - Time/memory supervision of the engine process
//! - [`orchestrator`] - Engine process lifecycle
//! - [`report`] - Parsing of the engine's stdout
//! - [`retarget`] - Bone mapping and frame window rules
//! - [`batch`] - Source discovery and sequential job execution
//!
//! ## Example
//!
//! ```ignore
//! use blend_retarget::prelude::*;
//!
//! let config = TransferConfig { scale: 0.5, ..Default::default() };
//! let job = TransferJob::new("walk.blend".as_ref(), "small_rig.blend".as_ref(), &config);
//! let orchestrator = Orchestrator::new(EngineCommand::resolve(None)?)?;
//! let result = orchestrator.run(&job);
//! println!("{:?} -> {}", result.status, result.output.display());
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod job;
pub mod monitor;
pub mod orchestrator;
pub mod report;
pub mod retarget;
pub mod script;

pub use error::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{BatchDriver, BatchSummary, JobRunner};
    pub use crate::config::{Limits, TransferConfig};
    pub use crate::error::{Error, Result};
    pub use crate::job::{FailureKind, TransferJob, TransferResult, TransferStatus};
    pub use crate::orchestrator::{EngineCommand, Orchestrator};
}
