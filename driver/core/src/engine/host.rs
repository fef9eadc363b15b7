//! Engine Host
//!
//! Owns the one live engine handle. The host is created from an
//! [`EngineLoader`] and is never cloned; the only way to get a new engine is
//! [`EngineHost::reload`], which drops the old one first. Because the handle
//! lives inside the host rather than in a global, independent hosts (one per
//! worker, one per test) can coexist.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::output::OutputRouter;
use super::traits::{Engine, EngineContext, EngineLoader};
use crate::error::DriverError;

/// Flags shared between the engine and whoever needs to observe or
/// interrupt it without going through the command queue
#[derive(Debug, Default)]
pub struct EngineControl {
    busy: AtomicBool,
    halt: AtomicBool,
}

impl EngineControl {
    /// Create a control block in the idle state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the engine is currently executing instructions
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Publish the busy state
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Ask the engine to halt at its next safe point (idempotent)
    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    /// Whether a halt has been requested and not yet consumed
    #[must_use]
    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    /// Consume a pending halt request
    pub fn take_halt(&self) -> bool {
        self.halt.swap(false, Ordering::SeqCst)
    }

    /// Drop any stale halt request
    pub fn clear_halt(&self) {
        self.halt.store(false, Ordering::SeqCst);
    }
}

/// Owner of the single live engine handle
pub struct EngineHost {
    loader: Arc<dyn EngineLoader>,
    engine: Option<Box<dyn Engine>>,
    output: OutputRouter,
    control: Arc<EngineControl>,
    generation: u64,
}

impl fmt::Debug for EngineHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHost")
            .field("loaded", &self.engine.is_some())
            .field("generation", &self.generation)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

impl EngineHost {
    /// Load the first engine instance
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Engine`] if the loader fails.
    pub fn load(loader: Arc<dyn EngineLoader>, output: OutputRouter) -> Result<Self, DriverError> {
        let mut host = Self {
            loader,
            engine: None,
            output,
            control: Arc::new(EngineControl::new()),
            generation: 0,
        };
        host.reload()?;
        Ok(host)
    }

    /// Discard the current engine and load a fresh one
    ///
    /// The old handle is dropped before the loader runs, so two live
    /// handles never exist at once.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Engine`] if the loader fails; the host is then
    /// left without an engine until the next successful reload.
    pub fn reload(&mut self) -> Result<(), DriverError> {
        self.engine = None;
        self.control.set_busy(false);
        self.control.clear_halt();

        let ctx = EngineContext {
            output: self.output.clone(),
            control: Arc::clone(&self.control),
        };
        let engine = self
            .loader
            .load(ctx)
            .map_err(|fault| DriverError::Engine(fault.to_string()))?;

        self.engine = Some(engine);
        self.generation += 1;
        tracing::info!(generation = self.generation, "Engine loaded");
        Ok(())
    }

    /// Borrow the live engine
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::EngineUnavailable`] if no engine is loaded.
    pub fn engine_mut(&mut self) -> Result<&mut dyn Engine, DriverError> {
        match self.engine.as_mut() {
            Some(engine) => Ok(engine.as_mut()),
            None => Err(DriverError::EngineUnavailable),
        }
    }

    /// Whether an engine is currently loaded
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.engine.is_some()
    }

    /// The router the engine writes to
    #[must_use]
    pub fn output(&self) -> &OutputRouter {
        &self.output
    }

    /// The control block shared with the engine
    #[must_use]
    pub fn control(&self) -> &Arc<EngineControl> {
        &self.control
    }

    /// How many engines this host has loaded so far
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
