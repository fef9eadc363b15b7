//! Emulator Backend Trait
//!
//! The capability surface the state service drives. Two implementations
//! exist:
//! - [`WorkerClient`](crate::transport::WorkerClient): the canonical one,
//!   talking to an engine that lives in an isolated worker context
//! - [`DirectDriver`](crate::driver::DirectDriver): a synchronous fixture
//!   calling the engine in-process, for tests and embedding
//!
//! # Design Philosophy
//!
//! Every operation is async from the caller's point of view and may suspend
//! indefinitely; there is no built-in timeout. Unsolicited notifications
//! (relayed output, run-state transitions, register samples) arrive on a
//! separate event channel that can be taken exactly once.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::engine::StatusCode;
use crate::error::DriverError;
use crate::executor::{CommandResult, ExecOptions};
use crate::registers::{Register, RegisterSnapshot};

/// Unsolicited notifications from the engine side
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverEvent {
    /// A line of engine output (only while output relay is enabled)
    Output(String),
    /// The engine's busy flag changed
    RunState(bool),
    /// A periodic register sample taken while the run loop is active
    Registers(RegisterSnapshot),
}

/// Emulator backend trait
///
/// Implement this trait to put the engine behind a different boundary.
#[async_trait]
pub trait EmulatorBackend: Send + Sync {
    /// Execute one command line
    async fn execute(&self, command: &str, opts: ExecOptions)
        -> Result<CommandResult, DriverError>;

    /// `EXAMINE <target>` parsed into key/value pairs
    async fn examine(&self, target: &str) -> Result<HashMap<String, String>, DriverError>;

    /// `DEPOSIT <target> <value>`
    async fn deposit(&self, target: &str, value: &str) -> Result<(), DriverError>;

    /// Execute exactly `steps` instructions
    async fn step(&self, steps: u32) -> Result<StatusCode, DriverError>;

    /// Request a halt at the next safe point (idempotent, best effort)
    async fn stop(&self) -> Result<(), DriverError>;

    /// Start the cooperative run loop; `false` if it was already active
    async fn start_running(&self) -> Result<bool, DriverError>;

    /// Disarm the run loop
    async fn stop_running(&self) -> Result<(), DriverError>;

    /// Discard the engine and load a fresh one
    async fn restart(&self) -> Result<(), DriverError>;

    /// Read every register in one round trip
    async fn read_registers(&self) -> Result<RegisterSnapshot, DriverError>;

    /// Validate and write one register
    async fn write_register(&self, register: Register, value: &str) -> Result<(), DriverError>;

    /// Read one drum word
    async fn read_memory(&self, address: &str) -> Result<String, DriverError>;

    /// Validate and write one drum word
    async fn write_memory(&self, address: &str, word: &str) -> Result<(), DriverError>;

    /// Set how many instructions the engine runs between yields
    async fn set_yield_steps(&self, steps: u32) -> Result<(), DriverError>;

    /// Enable or disable forwarding of engine output as events
    async fn set_output_relay(&self, enabled: bool) -> Result<(), DriverError>;

    /// Enable or disable periodic register samples
    ///
    /// Returns `false` if `token` is older than one already applied.
    async fn set_register_stream(&self, enabled: bool, token: u64) -> Result<bool, DriverError>;

    /// Write a file into the engine's virtual filesystem
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), DriverError>;

    /// Read a file from the engine's virtual filesystem
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, DriverError>;

    /// Create a directory in the engine's virtual filesystem
    async fn mkdir(&self, path: &str) -> Result<(), DriverError>;

    /// Remove a file from the engine's virtual filesystem
    async fn unlink(&self, path: &str) -> Result<(), DriverError>;

    /// Take the event receiver (only the first call gets it)
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DriverEvent>>;
}
