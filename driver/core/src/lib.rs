//! Drum Driver Core - Headless Driver for a Drum-Memory Computer Simulator
//!
//! This crate sits between a front panel (any presentation layer) and an
//! opaque simulator engine. It turns switch and button intents into engine
//! commands, keeps an authoritative snapshot of the machine, and runs the
//! engine in an isolated context so a long program never blocks the panel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Presentation layer                        │
//! │        switches, buttons, lamps, console, card decks          │
//! └──────────────┬───────────────────────────────▲───────────────┘
//!                │ intents                       │ watch snapshots
//!                ▼                               │ output lines
//! ┌──────────────────────────────────────────────┴───────────────┐
//! │                  EmulatorStateService                         │
//! │   snapshot + derive, optimistic writes, run guard, debug      │
//! │   line coalescing, preferences, register streaming            │
//! └──────────────┬───────────────────────────────▲───────────────┘
//!                │ EmulatorBackend               │ DriverEvent
//!        ┌───────┴────────┐              ┌───────┴────────┐
//!        │  WorkerClient  │ ◄── frames ─►│     worker     │
//!        │ (pending table)│              │ (engine loop,  │
//!        └────────────────┘              │  poller)       │
//!                                        └───────┬────────┘
//!                                                │
//!                          ┌─────────────────────┴──────────┐
//!                          │ DriverCore                      │
//!                          │  CommandExecutor                │
//!                          │  ExecutionController            │
//!                          │  EngineHost ── Engine           │
//!                          └─────────────────────────────────┘
//! ```
//!
//! [`DirectDriver`] implements the same [`EmulatorBackend`] trait in-process
//! and is meant for tests and embedding.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use drum_driver_core::{load_config, spawn_worker, EmulatorStateService};
//!
//! let config = load_config()?;
//! let client = spawn_worker(my_engine_loader(), &config).await?;
//! let service = EmulatorStateService::with_config(Arc::new(client), config);
//! service.initialize().await?;
//! service.execute_command("GO", Default::default()).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`word`]: machine word and address validation
//! - [`registers`]: register names and the consolidated register snapshot
//! - [`engine`]: the engine trait, status codes, handle ownership, output capture
//! - [`executor`]: command execution with captured output
//! - [`controller`]: stepping and the cooperative run loop
//! - [`driver`]: executor + controller over one handle, and the in-process backend
//! - [`backend`]: the capability trait the state service drives
//! - [`transport`]: frames, messages, pending table, worker and client
//! - [`state`]: the snapshot and the service that owns it
//! - [`config`]: defaults, TOML file and environment overrides
//! - [`testing`]: a scripted engine for tests

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod controller;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod registers;
pub mod state;
pub mod testing;
pub mod transport;
pub mod word;

// Re-exports for convenience
pub use backend::{DriverEvent, EmulatorBackend};
pub use config::{load_config, load_config_from_path, ConfigError, ConfigSource, DriverConfig};
pub use controller::ExecutionController;
pub use driver::{DirectDriver, DriverCore, Tick};
pub use engine::{Engine, EngineContext, EngineFault, EngineHost, EngineLoader, StatusCode};
pub use error::DriverError;
pub use executor::{CommandExecutor, CommandResult, ExecOptions};
pub use registers::{Register, RegisterSnapshot};
pub use state::{
    ControlSwitch, DisplaySwitch, EmulatorState, EmulatorStateService, ErrorSwitch,
    HalfCycleSwitch, OverflowSwitch, PreferenceStore, ProgrammedSwitch, StatePatch,
};
pub use transport::{spawn_worker, TransportError, WorkerClient};
pub use word::{normalize_address, normalize_word, ValidationError};
