//! Engine Traits
//!
//! The simulator engine is an opaque, pre-built unit. The driver only sees
//! the call-by-name surface defined here:
//! - one command entry point taking raw command text
//! - a bounded run entry point (halting goes through [`EngineControl`])
//! - a small virtual filesystem
//!
//! Implementations emit text through the [`OutputRouter`] they are handed at
//! load time, and publish their busy state through the shared control block.

use std::sync::Arc;

use thiserror::Error;

use super::host::EngineControl;
use super::output::OutputRouter;
use super::status::StatusCode;

/// Low-level engine failures that are not simulated-machine conditions
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineFault {
    /// The engine terminated abruptly with an exit code
    #[error("engine exited with status {0}")]
    Exit(i32),

    /// The engine broke its call contract
    #[error("engine fault: {0}")]
    Crashed(String),

    /// A virtual filesystem call failed
    #[error("filesystem error on {path}: {message}")]
    Filesystem {
        /// Path the call was addressed to
        path: String,
        /// Engine-provided reason
        message: String,
    },
}

/// Everything an engine receives when it is loaded
#[derive(Clone)]
pub struct EngineContext {
    /// Sink for the engine's normal and error output
    pub output: OutputRouter,
    /// Busy flag and halt request shared with the driver
    pub control: Arc<EngineControl>,
}

/// The simulator engine call interface
pub trait Engine: Send {
    /// Execute one raw command line and return its status
    ///
    /// # Errors
    ///
    /// [`EngineFault::Exit`] if the engine terminated while running the
    /// command; any other fault for contract violations.
    fn command(&mut self, command: &str) -> Result<StatusCode, EngineFault>;

    /// Execute up to `steps` instructions and return the resulting status
    ///
    /// # Errors
    ///
    /// Returns a fault if the engine could not advance at all.
    fn run(&mut self, steps: u32) -> Result<StatusCode, EngineFault>;

    /// Set how many instructions the engine executes between yields (0 = never yield)
    fn set_yield_steps(&mut self, steps: u32);

    /// Write a file into the engine's virtual filesystem
    ///
    /// # Errors
    ///
    /// Returns [`EngineFault::Filesystem`] if the write is rejected.
    fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<(), EngineFault>;

    /// Read a file from the engine's virtual filesystem
    ///
    /// # Errors
    ///
    /// Returns [`EngineFault::Filesystem`] if the file cannot be read.
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, EngineFault>;

    /// Create a directory (and its parents) in the virtual filesystem
    ///
    /// # Errors
    ///
    /// Returns [`EngineFault::Filesystem`] if the directory cannot be created.
    fn mkdir(&mut self, path: &str) -> Result<(), EngineFault>;

    /// Remove a file from the virtual filesystem
    ///
    /// # Errors
    ///
    /// Returns [`EngineFault::Filesystem`] if the file cannot be removed.
    fn unlink(&mut self, path: &str) -> Result<(), EngineFault>;
}

/// Factory that produces a fresh engine instance
///
/// Called once at startup and again on every restart.
pub trait EngineLoader: Send + Sync {
    /// Load a new engine wired to `ctx`
    ///
    /// # Errors
    ///
    /// Returns a fault if the engine cannot be instantiated.
    fn load(&self, ctx: EngineContext) -> Result<Box<dyn Engine>, EngineFault>;
}

impl<F> EngineLoader for F
where
    F: Fn(EngineContext) -> Result<Box<dyn Engine>, EngineFault> + Send + Sync,
{
    fn load(&self, ctx: EngineContext) -> Result<Box<dyn Engine>, EngineFault> {
        self(ctx)
    }
}
