//! The mod contract.

use async_trait::async_trait;

use crate::capsule::Capsule;
use crate::error::Result;
use crate::request::CapsuleRequest;

/// A unit of transformation logic invoked by a pipeline step.
///
/// Implemented by in-process mods (built-ins, test fakes) and by the host-side
/// proxy that drives a mod subprocess, so a step never knows which it holds.
#[async_trait]
pub trait Mod: Send {
    /// Dotted `<group>.<name>` identifier.
    fn name(&self) -> &str;

    /// Called once before the first run with the step's config text and tag.
    async fn initialize(&mut self, config: &str, tag: &str) -> Result<()>;

    /// Contribute to one reconciliation pass.
    async fn run(&mut self, capsule: &Capsule, req: &mut dyn CapsuleRequest) -> Result<()>;

    /// Release resources. For subprocess mods this kills the process.
    async fn stop(&mut self) {}
}
