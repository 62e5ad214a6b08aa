//! DriverAdapter trait definition

use crate::core::types::{Report, Status};
use crate::error::Result;

/// Uniform capability surface every field-device driver exposes to the orchestrator
///
/// Lifecycle calls are made by the orchestrator in order: `init` once, then
/// any number of `start`/`stop` pairs. `query` may be called from the
/// interactive thread and from the polling scheduler; the orchestrator
/// serializes those calls.
pub trait DriverAdapter: Send {
    /// Registry key, e.g. `"battery"`
    fn name(&self) -> &str;

    /// Validate configuration and prepare the driver
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Begin any background activity the driver owns
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop background activity and join its workers
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Run one sub-command (`args[0]`), writing human readable output into `report`
    fn query(&mut self, args: &[String], report: &mut Report) -> Status;

    /// Sub-commands understood by `query`
    fn available_commands(&self) -> Vec<String>;
}
