//! Driver Core
//!
//! [`DriverCore`] bundles the engine host, the execution controller and the
//! register-stream state into the one object that answers every backend
//! operation synchronously. The worker context owns one; [`DirectDriver`]
//! wraps one behind a mutex for in-process use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backend::{DriverEvent, EmulatorBackend};
use crate::config::DriverConfig;
use crate::controller::ExecutionController;
use crate::engine::{EngineControl, EngineHost, EngineLoader, LiveSink, OutputRouter, StatusCode};
use crate::error::DriverError;
use crate::executor::{CommandExecutor, CommandResult, ExecOptions};
use crate::registers::{Register, RegisterSnapshot};
use crate::word;

/// Result of one run-loop quantum
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tick {
    /// Status the quantum ended with
    pub status: StatusCode,
    /// Whether the loop wants another quantum
    pub continuing: bool,
    /// Register sample, when streaming is on and one was due
    pub sample: Option<RegisterSnapshot>,
}

#[derive(Debug, Default)]
struct RegisterStream {
    enabled: bool,
    token: u64,
    since_sample: u64,
}

/// Synchronous driver over one engine host
#[derive(Debug)]
pub struct DriverCore {
    host: EngineHost,
    controller: ExecutionController,
    stream: RegisterStream,
    stride: u64,
}

impl DriverCore {
    /// Load the engine and set up the controller from `config`
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Engine`] if the engine cannot be loaded.
    pub fn new(
        loader: Arc<dyn EngineLoader>,
        output: OutputRouter,
        config: &DriverConfig,
    ) -> Result<Self, DriverError> {
        Ok(Self {
            host: EngineHost::load(loader, output)?,
            controller: ExecutionController::new(config.run_quantum),
            stream: RegisterStream::default(),
            stride: config.register_stream_stride.max(1),
        })
    }

    /// The control block shared with the engine
    #[must_use]
    pub fn control(&self) -> Arc<EngineControl> {
        Arc::clone(self.host.control())
    }

    /// Borrow a command executor
    pub fn executor(&mut self) -> CommandExecutor<'_> {
        CommandExecutor::new(&mut self.host)
    }

    /// See [`CommandExecutor::execute`]
    ///
    /// # Errors
    ///
    /// Propagates executor errors.
    pub fn execute(
        &mut self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandResult, DriverError> {
        self.executor().execute(command, opts)
    }

    /// See [`CommandExecutor::examine`]
    ///
    /// # Errors
    ///
    /// Propagates executor errors.
    pub fn examine(&mut self, target: &str) -> Result<HashMap<String, String>, DriverError> {
        self.executor().examine(target)
    }

    /// See [`CommandExecutor::deposit`]
    ///
    /// # Errors
    ///
    /// Propagates executor errors.
    pub fn deposit(&mut self, target: &str, value: &str) -> Result<(), DriverError> {
        self.executor().deposit(target, value)
    }

    /// Read every register with a single `EXAMINE`
    ///
    /// # Errors
    ///
    /// Executor errors, or [`DriverError::MissingValue`] if a register is
    /// absent from the output.
    pub fn read_registers(&mut self) -> Result<RegisterSnapshot, DriverError> {
        let values = self.examine(&RegisterSnapshot::examine_target())?;
        RegisterSnapshot::from_examine(&values)
    }

    /// Validate `value` for `register` and deposit it
    ///
    /// # Errors
    ///
    /// [`DriverError::Validation`] before any engine call, or executor errors.
    pub fn write_register(&mut self, register: Register, value: &str) -> Result<(), DriverError> {
        let value = register.normalize_value(value)?;
        self.deposit(register.mnemonic(), &value)
    }

    /// Read the drum word at `address`
    ///
    /// # Errors
    ///
    /// [`DriverError::Validation`] for a malformed address, or executor errors.
    pub fn read_memory(&mut self, address: &str) -> Result<String, DriverError> {
        let address = word::normalize_address(address)?;
        let value = self.executor().examine_value(&address)?;
        Ok(word::normalize_word(&value).unwrap_or(value))
    }

    /// Write `value` to the drum word at `address`
    ///
    /// # Errors
    ///
    /// [`DriverError::Validation`] for a malformed address or word, or
    /// executor errors.
    pub fn write_memory(&mut self, address: &str, value: &str) -> Result<(), DriverError> {
        let address = word::normalize_address(address)?;
        let value = word::normalize_word(value)?;
        self.deposit(&address, &value)
    }

    /// See [`ExecutionController::step`]
    ///
    /// # Errors
    ///
    /// Propagates controller errors.
    pub fn step(&mut self, steps: u32) -> Result<StatusCode, DriverError> {
        self.controller.step(&mut self.host, steps)
    }

    /// Request a halt at the next safe point
    pub fn stop(&self) {
        self.controller.stop(&self.host);
    }

    /// Arm the run loop; `false` if already armed
    pub fn start_running(&mut self) -> bool {
        self.stream.since_sample = 0;
        self.controller.start_running(&self.host)
    }

    /// Disarm the run loop
    pub fn stop_running(&mut self) {
        self.controller.stop_running(&self.host);
    }

    /// Whether the run loop is armed
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Run one quantum; `None` if the loop is not armed
    ///
    /// # Errors
    ///
    /// Engine failures end the loop and are returned.
    pub fn run_quantum(&mut self) -> Result<Option<Tick>, DriverError> {
        if !self.controller.is_running() {
            return Ok(None);
        }
        let mut status = crate::engine::status::OK;
        let continuing = self
            .controller
            .tick(&mut self.host, |code| status = code)?;
        let sample = self.sample_registers(continuing);
        Ok(Some(Tick {
            status,
            continuing,
            sample,
        }))
    }

    fn sample_registers(&mut self, continuing: bool) -> Option<RegisterSnapshot> {
        if !self.stream.enabled {
            return None;
        }
        self.stream.since_sample += u64::from(self.controller.quantum());
        if continuing && self.stream.since_sample < self.stride {
            return None;
        }
        self.stream.since_sample = 0;
        match self.read_registers() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(error = %e, "Register sample failed");
                None
            }
        }
    }

    /// Enable or disable register samples, ignoring stale tokens
    pub fn set_register_stream(&mut self, enabled: bool, token: u64) -> bool {
        if token < self.stream.token {
            tracing::debug!(
                token,
                current = self.stream.token,
                "Ignoring stale register stream toggle"
            );
            return false;
        }
        self.stream.token = token;
        self.stream.enabled = enabled;
        self.stream.since_sample = 0;
        true
    }

    /// Whether register samples are enabled
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.stream.enabled
    }

    /// Disarm the loop and reload the engine
    ///
    /// # Errors
    ///
    /// Returns the loader failure.
    pub fn restart(&mut self) -> Result<(), DriverError> {
        self.stream.since_sample = 0;
        self.controller.restart(&mut self.host)
    }

    /// See [`ExecutionController::set_yield_steps`]
    ///
    /// # Errors
    ///
    /// [`DriverError::EngineUnavailable`] if no engine is loaded.
    pub fn set_yield_steps(&mut self, steps: u32) -> Result<(), DriverError> {
        self.controller.set_yield_steps(&mut self.host, steps)
    }

    /// Write a file into the engine's virtual filesystem
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Engine`] if the engine rejects the write.
    pub fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<(), DriverError> {
        self.host
            .engine_mut()?
            .write_file(path, contents)
            .map_err(|fault| DriverError::Engine(fault.to_string()))
    }

    /// Read a file from the engine's virtual filesystem
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Engine`] if the file cannot be read.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, DriverError> {
        self.host
            .engine_mut()?
            .read_file(path)
            .map_err(|fault| DriverError::Engine(fault.to_string()))
    }

    /// Create a directory in the engine's virtual filesystem
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Engine`] if the directory cannot be created.
    pub fn mkdir(&mut self, path: &str) -> Result<(), DriverError> {
        self.host
            .engine_mut()?
            .mkdir(path)
            .map_err(|fault| DriverError::Engine(fault.to_string()))
    }

    /// Remove a file from the engine's virtual filesystem
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Engine`] if the file cannot be removed.
    pub fn unlink(&mut self, path: &str) -> Result<(), DriverError> {
        self.host
            .engine_mut()?
            .unlink(path)
            .map_err(|fault| DriverError::Engine(fault.to_string()))
    }
}

/// Live sink that forwards output while `relay` is set
pub(crate) fn relay_sink<F>(relay: Arc<AtomicBool>, forward: F) -> LiveSink
where
    F: Fn(String) + Send + Sync + 'static,
{
    Arc::new(move |line: &str| {
        if relay.load(Ordering::SeqCst) {
            forward(line.to_string());
        }
    })
}

// ============================================================================
// Direct Driver
// ============================================================================

/// In-process backend calling the engine on the caller's thread
///
/// Commands block the calling task for their full duration, including `GO`.
/// [`stop`](EmulatorBackend::stop) bypasses the core lock, so a halt can
/// still be requested from another thread while a command runs. The run loop
/// is a spawned task that yields to the runtime between quanta.
pub struct DirectDriver {
    core: Arc<Mutex<DriverCore>>,
    control: Arc<EngineControl>,
    relay: Arc<AtomicBool>,
    run_epoch: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
}

impl DirectDriver {
    /// Load the engine in-process
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Engine`] if the engine cannot be loaded.
    pub fn new(loader: Arc<dyn EngineLoader>, config: &DriverConfig) -> Result<Self, DriverError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let relay = Arc::new(AtomicBool::new(false));

        let output = OutputRouter::new();
        let tx = events_tx.clone();
        output.set_live_sink(Some(relay_sink(Arc::clone(&relay), move |line| {
            let _ = tx.send(DriverEvent::Output(line));
        })));

        let core = DriverCore::new(loader, output, config)?;
        let control = core.control();

        Ok(Self {
            core: Arc::new(Mutex::new(core)),
            control,
            relay,
            run_epoch: Arc::new(AtomicU64::new(0)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    fn spawn_run_loop(&self) {
        let epoch = self.run_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let run_epoch = Arc::clone(&self.run_epoch);
        let core = Arc::clone(&self.core);
        let events = self.events_tx.clone();

        let _ = events.send(DriverEvent::RunState(true));
        tokio::spawn(async move {
            while run_epoch.load(Ordering::SeqCst) == epoch {
                let tick = core.lock().run_quantum();
                match tick {
                    Ok(Some(tick)) => {
                        if let Some(sample) = tick.sample {
                            let _ = events.send(DriverEvent::Registers(sample));
                        }
                        if !tick.continuing {
                            tracing::debug!(status = tick.status, "Run loop finished");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Run loop failed");
                        break;
                    }
                }
                tokio::task::yield_now().await;
            }
            if run_epoch.load(Ordering::SeqCst) == epoch {
                let _ = events.send(DriverEvent::RunState(false));
            }
        });
    }
}

#[async_trait]
impl EmulatorBackend for DirectDriver {
    async fn execute(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandResult, DriverError> {
        self.core.lock().execute(command, opts)
    }

    async fn examine(&self, target: &str) -> Result<HashMap<String, String>, DriverError> {
        self.core.lock().examine(target)
    }

    async fn deposit(&self, target: &str, value: &str) -> Result<(), DriverError> {
        self.core.lock().deposit(target, value)
    }

    async fn step(&self, steps: u32) -> Result<StatusCode, DriverError> {
        self.core.lock().step(steps)
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.control.request_halt();
        Ok(())
    }

    async fn start_running(&self) -> Result<bool, DriverError> {
        let started = self.core.lock().start_running();
        if started {
            self.spawn_run_loop();
        }
        Ok(started)
    }

    async fn stop_running(&self) -> Result<(), DriverError> {
        let was_running = {
            let mut core = self.core.lock();
            let was_running = core.is_running();
            core.stop_running();
            was_running
        };
        if was_running {
            self.run_epoch.fetch_add(1, Ordering::SeqCst);
            let _ = self.events_tx.send(DriverEvent::RunState(false));
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), DriverError> {
        self.run_epoch.fetch_add(1, Ordering::SeqCst);
        self.core.lock().restart()
    }

    async fn read_registers(&self) -> Result<RegisterSnapshot, DriverError> {
        self.core.lock().read_registers()
    }

    async fn write_register(&self, register: Register, value: &str) -> Result<(), DriverError> {
        self.core.lock().write_register(register, value)
    }

    async fn read_memory(&self, address: &str) -> Result<String, DriverError> {
        self.core.lock().read_memory(address)
    }

    async fn write_memory(&self, address: &str, value: &str) -> Result<(), DriverError> {
        self.core.lock().write_memory(address, value)
    }

    async fn set_yield_steps(&self, steps: u32) -> Result<(), DriverError> {
        self.core.lock().set_yield_steps(steps)
    }

    async fn set_output_relay(&self, enabled: bool) -> Result<(), DriverError> {
        self.relay.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn set_register_stream(&self, enabled: bool, token: u64) -> Result<bool, DriverError> {
        Ok(self.core.lock().set_register_stream(enabled, token))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), DriverError> {
        self.core.lock().write_file(path, contents)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        self.core.lock().read_file(path)
    }

    async fn mkdir(&self, path: &str) -> Result<(), DriverError> {
        self.core.lock().mkdir(path)
    }

    async fn unlink(&self, path: &str) -> Result<(), DriverError> {
        self.core.lock().unlink(path)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DriverEvent>> {
        self.events_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::engine::status;
    use crate::testing::ScriptedHandle;
    use crate::word::ZERO_WORD;

    fn core(handle: &ScriptedHandle) -> DriverCore {
        let config = DriverConfig {
            run_quantum: 10,
            register_stream_stride: 20,
            ..DriverConfig::default()
        };
        DriverCore::new(handle.loader(), OutputRouter::new(), &config).unwrap()
    }

    #[test]
    fn test_read_registers_single_examine() {
        let handle = ScriptedHandle::new();
        let mut core = core(&handle);
        core.write_register(Register::Program, "-6510001005").unwrap();

        let snapshot = core.read_registers().unwrap();
        assert_eq!(snapshot.program_register, "6510001005-");
        assert_eq!(snapshot.distributor, ZERO_WORD);

        let examines = handle
            .commands()
            .iter()
            .filter(|c| c.starts_with("EXAMINE"))
            .count();
        assert_eq!(examines, 1);
    }

    #[test]
    fn test_validation_happens_before_engine_call() {
        let handle = ScriptedHandle::new();
        let mut core = core(&handle);
        let before = handle.commands().len();

        let err = core.write_register(Register::Distributor, "12345").unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
        let err = core.write_memory("12a", "0000000001+").unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));

        assert_eq!(handle.commands().len(), before);
    }

    #[test]
    fn test_memory_roundtrip_normalizes_address() {
        let handle = ScriptedHandle::new();
        let mut core = core(&handle);
        core.write_memory("7", "+0000000123").unwrap();
        assert_eq!(core.read_memory("0007").unwrap(), "0000000123+");
        assert!(handle.commands().contains(&"DEPOSIT 0007 0000000123+".to_string()));
    }

    #[test]
    fn test_run_quantum_samples_at_stride() {
        let handle = ScriptedHandle::new().with_program_length(Some(45));
        let mut core = core(&handle);
        assert!(core.set_register_stream(true, 1));
        assert!(core.start_running());

        let mut ticks = Vec::new();
        while let Some(tick) = core.run_quantum().unwrap() {
            let done = !tick.continuing;
            ticks.push(tick);
            if done {
                break;
            }
        }

        let sampled: Vec<bool> = ticks.iter().map(|t| t.sample.is_some()).collect();
        assert_eq!(sampled, vec![false, true, false, true, true]);
        assert_eq!(ticks.last().map(|t| t.status), Some(status::PROGRAM_STOP));
        assert!(core.run_quantum().unwrap().is_none());
    }

    #[test]
    fn test_stale_stream_token_ignored() {
        let handle = ScriptedHandle::new();
        let mut core = core(&handle);
        assert!(core.set_register_stream(true, 5));
        assert!(!core.set_register_stream(false, 4));
        assert!(core.is_streaming());
        assert!(core.set_register_stream(false, 5));
        assert!(!core.is_streaming());
    }

    #[test]
    fn test_filesystem_errors_map_to_engine() {
        let handle = ScriptedHandle::new();
        let mut core = core(&handle);
        assert!(matches!(
            core.read_file("/missing"),
            Err(DriverError::Engine(_))
        ));
    }

    #[tokio::test]
    async fn test_direct_driver_relays_output_only_when_enabled() {
        let handle = ScriptedHandle::new();
        let driver = DirectDriver::new(handle.loader(), &DriverConfig::default()).unwrap();
        let mut events = driver.take_events().unwrap();
        assert!(driver.take_events().is_none());

        driver
            .execute("ECHO hidden", ExecOptions { echo: false, stream_output: true })
            .await
            .unwrap();
        driver.set_output_relay(true).await.unwrap();
        driver
            .execute("ECHO shown", ExecOptions { echo: false, stream_output: true })
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(DriverEvent::Output("shown".to_string()))
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_direct_driver_run_loop_announces_transitions() {
        let handle = ScriptedHandle::new().with_program_length(Some(25));
        let config = DriverConfig {
            run_quantum: 10,
            ..DriverConfig::default()
        };
        let driver = DirectDriver::new(handle.loader(), &config).unwrap();
        let mut events = driver.take_events().unwrap();

        assert!(driver.start_running().await.unwrap());
        assert_eq!(events.recv().await, Some(DriverEvent::RunState(true)));
        assert_eq!(events.recv().await, Some(DriverEvent::RunState(false)));
        assert_eq!(handle.steps_run(), 25);
    }
}
