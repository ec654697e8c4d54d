//! Keel reconciliation engine.
//!
//! `Pipeline::run_capsule` loads what a capsule owns, runs every matching
//! step's mods against a fresh [`Request`], commits the difference and retries
//! the whole pass when the commit is aborted by a conflicting writer.

#![forbid(unsafe_code)]

pub mod compare;
pub mod config;
pub mod manager;
pub mod matcher;
pub mod pipeline;
pub mod request;
pub mod result;
pub mod status;
pub mod step;

pub use config::{ModRef, PipelineConfig, StepConfig};
pub use manager::{validate_mod_name, Manager, ModLauncher, ProcessLauncher, MANIFEST_FILE};
pub use matcher::{Matcher, PLATFORM_CAPSULE_NAME};
pub use pipeline::{Pipeline, PipelineOptions, RunOptions};
pub use request::Request;
pub use result::{InputObject, OutputObject, PipelineResult};
pub use step::Step;
