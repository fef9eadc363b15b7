//! Simulator Engine Integration
//!
//! This module provides abstracted access to the opaque simulator engine
//! through a small call-by-name trait, plus the pieces the driver wraps
//! around it:
//!
//! - [`Engine`] / [`EngineLoader`]: the engine's call interface and factory
//! - [`EngineHost`]: sole owner of the live engine handle
//! - [`EngineControl`]: busy flag and halt request shared with the engine
//! - [`OutputRouter`]: multiplexes engine output into capture or live delivery
//! - [`status`]: numeric status codes and their classification

mod host;
mod output;
pub mod status;
mod traits;

pub use host::{EngineControl, EngineHost};
pub use output::{CaptureGuard, LiveSink, OutputRouter, OutputStream};
pub use status::StatusCode;
pub use traits::{Engine, EngineContext, EngineFault, EngineLoader};
