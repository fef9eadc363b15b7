//! Execution Controller
//!
//! Runs the engine in bounded quanta. The run loop is cooperative: the
//! controller never loops by itself. Whoever owns the host calls
//! [`ExecutionController::tick`] repeatedly and yields between calls, so other
//! requests (and the out-of-band halt flag) get a chance to run.

use crate::engine::{status, EngineHost, StatusCode};
use crate::error::DriverError;

/// Default number of steps per run-loop quantum
pub const DEFAULT_QUANTUM: u32 = 10_000;

/// Step and run-loop control for one engine host
#[derive(Debug)]
pub struct ExecutionController {
    quantum: u32,
    running: bool,
}

impl Default for ExecutionController {
    fn default() -> Self {
        Self::new(DEFAULT_QUANTUM)
    }
}

impl ExecutionController {
    /// Create a controller that runs `quantum` steps per tick (minimum 1)
    #[must_use]
    pub fn new(quantum: u32) -> Self {
        Self {
            quantum: quantum.max(1),
            running: false,
        }
    }

    /// Steps executed per tick
    #[must_use]
    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    /// Whether the run loop is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Execute exactly `steps` instructions and return the engine's status
    ///
    /// `steps == 0` returns [`status::OK`] without touching the engine.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Engine`] if the engine could not advance.
    pub fn step(&self, host: &mut EngineHost, steps: u32) -> Result<StatusCode, DriverError> {
        if steps == 0 {
            return Ok(status::OK);
        }
        let raw = host
            .engine_mut()?
            .run(steps)
            .map_err(|fault| DriverError::Engine(fault.to_string()))?;
        tracing::debug!(steps, status = raw, "Stepped engine");
        Ok(status::bare(raw))
    }

    /// Ask the engine to halt at its next safe point
    pub fn stop(&self, host: &EngineHost) {
        host.control().request_halt();
    }

    /// Arm the run loop
    ///
    /// Returns `false` (and changes nothing) if the loop is already active.
    pub fn start_running(&mut self, host: &EngineHost) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        host.control().clear_halt();
        host.control().set_busy(true);
        tracing::info!(quantum = self.quantum, "Run loop started");
        true
    }

    /// Disarm the run loop; the next tick is a no-op
    pub fn stop_running(&mut self, host: &EngineHost) {
        if self.running {
            tracing::info!("Run loop stopped");
        }
        self.running = false;
        host.control().set_busy(false);
    }

    /// Run one quantum if the loop is armed
    ///
    /// `on_tick` receives the quantum's status. Returns whether the loop
    /// wants another tick. A pending halt request ends the loop with
    /// [`status::STOP`] before the engine is called. Any status other than a
    /// continuation code disarms the loop before `on_tick` sees it.
    ///
    /// # Errors
    ///
    /// Engine failures disarm the loop and are returned.
    pub fn tick<F>(&mut self, host: &mut EngineHost, mut on_tick: F) -> Result<bool, DriverError>
    where
        F: FnMut(StatusCode),
    {
        if !self.running {
            return Ok(false);
        }

        if host.control().take_halt() {
            self.stop_running(host);
            on_tick(status::STOP);
            return Ok(false);
        }

        let code = match self.step(host, self.quantum) {
            Ok(code) => code,
            Err(e) => {
                self.stop_running(host);
                return Err(e);
            }
        };

        if self.running && status::is_continuation(code) {
            on_tick(code);
            return Ok(true);
        }

        self.stop_running(host);
        on_tick(code);
        Ok(false)
    }

    /// Disarm the loop and reload the engine from scratch
    ///
    /// # Errors
    ///
    /// Returns the loader failure; the host is then left without an engine.
    pub fn restart(&mut self, host: &mut EngineHost) -> Result<(), DriverError> {
        self.running = false;
        host.reload()?;
        tracing::info!(generation = host.generation(), "Engine restarted");
        Ok(())
    }

    /// Set how many instructions the engine runs between yields
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::EngineUnavailable`] if no engine is loaded.
    pub fn set_yield_steps(&self, host: &mut EngineHost, steps: u32) -> Result<(), DriverError> {
        host.engine_mut()?.set_yield_steps(steps);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OutputRouter;
    use crate::testing::ScriptedHandle;

    fn host(handle: &ScriptedHandle) -> EngineHost {
        EngineHost::load(handle.loader(), OutputRouter::new()).unwrap()
    }

    #[test]
    fn test_step_zero_skips_engine() {
        let handle = ScriptedHandle::new();
        let mut host = host(&handle);
        let controller = ExecutionController::default();
        assert_eq!(controller.step(&mut host, 0).unwrap(), status::OK);
        assert_eq!(handle.steps_run(), 0);
    }

    #[test]
    fn test_step_runs_exact_count() {
        let handle = ScriptedHandle::new().with_program_length(Some(1_000));
        let mut host = host(&handle);
        let controller = ExecutionController::default();
        assert_eq!(controller.step(&mut host, 7).unwrap(), status::STEP_EXPIRED);
        assert_eq!(handle.steps_run(), 7);
    }

    #[test]
    fn test_second_start_is_noop() {
        let handle = ScriptedHandle::new();
        let host = host(&handle);
        let mut controller = ExecutionController::new(10);
        assert!(controller.start_running(&host));
        assert!(!controller.start_running(&host));
        assert!(host.control().is_busy());
    }

    #[test]
    fn test_tick_continues_until_program_stop() {
        let handle = ScriptedHandle::new().with_program_length(Some(25));
        let mut host = host(&handle);
        let mut controller = ExecutionController::new(10);
        controller.start_running(&host);

        let mut seen = Vec::new();
        while controller.tick(&mut host, |code| seen.push(code)).unwrap() {}

        assert_eq!(
            seen,
            vec![status::STEP_EXPIRED, status::STEP_EXPIRED, status::PROGRAM_STOP]
        );
        assert!(!controller.is_running());
        assert!(!host.control().is_busy());
    }

    #[test]
    fn test_halt_request_ends_loop_with_stop() {
        let handle = ScriptedHandle::new().with_program_length(None);
        let mut host = host(&handle);
        let mut controller = ExecutionController::new(10);
        controller.start_running(&host);
        assert!(controller.tick(&mut host, |_| {}).unwrap());

        controller.stop(&host);
        controller.stop(&host);

        let mut last = None;
        assert!(!controller.tick(&mut host, |code| last = Some(code)).unwrap());
        assert_eq!(last, Some(status::STOP));
        assert!(!host.control().halt_requested());
    }

    #[test]
    fn test_tick_when_idle_is_noop() {
        let handle = ScriptedHandle::new();
        let mut host = host(&handle);
        let mut controller = ExecutionController::default();
        let mut called = false;
        assert!(!controller.tick(&mut host, |_| called = true).unwrap());
        assert!(!called);
        assert_eq!(handle.steps_run(), 0);
    }

    #[test]
    fn test_restart_disarms_and_reloads() {
        let handle = ScriptedHandle::new();
        let mut host = host(&handle);
        let mut controller = ExecutionController::default();
        controller.start_running(&host);
        controller.restart(&mut host).unwrap();
        assert!(!controller.is_running());
        assert_eq!(host.generation(), 2);
    }
}
