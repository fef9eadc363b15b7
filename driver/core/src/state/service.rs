//! Emulator State Service
//!
//! The state machine the presentation layer talks to. It owns the snapshot,
//! turns user intents into backend calls, and folds unsolicited backend
//! events back into the snapshot.
//!
//! # Design Philosophy
//!
//! - The snapshot lives in a `watch` channel and is only changed through
//!   [`merge`](EmulatorStateService::merge), which applies a patch and
//!   re-derives in one `send_modify`. Subscribers never see half a merge.
//! - Register and flag writes are optimistic: the snapshot changes first and
//!   is repaired if the engine refuses. The error still reaches the caller.
//! - Events are consumed by one pump task. Debug-line patches are coalesced
//!   and merged on a fixed tick rather than per line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    ControlSwitch, DebugLineCoalescer, DisplaySwitch, EmulatorState, ErrorSwitch,
    HalfCycleSwitch, MemoryPreferences, OverflowSwitch, PreferenceStore, Preferences,
    ProgrammedSwitch, RunStateGuard, StatePatch, TomlPreferences,
};
use crate::backend::{DriverEvent, EmulatorBackend};
use crate::config::DriverConfig;
use crate::engine::StatusCode;
use crate::error::DriverError;
use crate::executor::{CommandResult, ExecOptions};
use crate::registers::{flag_text, Register, RegisterKind, RegisterSnapshot};
use crate::word::{self, ZERO_ADDRESS, ZERO_WORD};

/// Largest accepted yield quantum
pub const MAX_YIELD_STEPS: u32 = 100_000;

const RUN_VERBS: [&str; 3] = ["GO", "CONT", "RUN"];
const OUTPUT_BUFFER: usize = 256;

/// Clamp a requested yield quantum to `0` or `1..=MAX_YIELD_STEPS`
///
/// Non-integers are rounded; non-finite input yields `default`.
#[must_use]
pub fn normalize_yield_steps(value: f64, default: u32) -> u32 {
    if !value.is_finite() {
        return default.min(MAX_YIELD_STEPS);
    }
    let rounded = value.round();
    if rounded <= 0.0 {
        0
    } else if rounded >= f64::from(MAX_YIELD_STEPS) {
        MAX_YIELD_STEPS
    } else {
        // In range (0, MAX_YIELD_STEPS) and integral
        rounded as u32
    }
}

/// Whether a command line starts the simulated CPU
#[must_use]
pub fn is_run_command(command: &str) -> bool {
    command
        .split_whitespace()
        .next()
        .is_some_and(|verb| RUN_VERBS.iter().any(|run| verb.eq_ignore_ascii_case(run)))
}

struct Inner<B> {
    backend: Arc<B>,
    config: DriverConfig,
    preferences: Arc<dyn PreferenceStore>,
    state: watch::Sender<EmulatorState>,
    output: broadcast::Sender<String>,
    guard: Mutex<RunStateGuard>,
    stream_token: AtomicU64,
    init_lock: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<B> Drop for Inner<B> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Owner of the emulator snapshot
pub struct EmulatorStateService<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for EmulatorStateService<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: EmulatorBackend + 'static> EmulatorStateService<B> {
    /// Create a service over `backend`
    ///
    /// Nothing is sent to the backend until [`initialize`](Self::initialize).
    pub fn new(
        backend: Arc<B>,
        config: DriverConfig,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Self {
        let (state, _) = watch::channel(EmulatorState::new(config.default_yield_steps));
        let (output, _) = broadcast::channel(OUTPUT_BUFFER);
        let guard = RunStateGuard::new(config.suppression_window());
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                preferences,
                state,
                output,
                guard: Mutex::new(guard),
                stream_token: AtomicU64::new(0),
                init_lock: tokio::sync::Mutex::new(()),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Create a service persisting preferences where `config` says
    pub fn with_config(backend: Arc<B>, config: DriverConfig) -> Self {
        let preferences: Arc<dyn PreferenceStore> = match config.preferences_path {
            Some(ref path) => Arc::new(TomlPreferences::new(path)),
            None => Arc::new(MemoryPreferences::default()),
        };
        Self::new(backend, config, preferences)
    }

    /// The backend this service drives
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    // ========================================================================
    // Snapshot access
    // ========================================================================

    /// Receive every future snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EmulatorState> {
        self.inner.state.subscribe()
    }

    /// Copy of the current snapshot
    #[must_use]
    pub fn snapshot(&self) -> EmulatorState {
        self.inner.state.borrow().clone()
    }

    /// Receive relayed engine output
    #[must_use]
    pub fn subscribe_output(&self) -> broadcast::Receiver<String> {
        self.inner.output.subscribe()
    }

    /// Apply `patch`, re-derive, and notify subscribers
    pub fn merge(&self, patch: StatePatch) {
        if patch.is_empty() {
            return;
        }
        self.inner.state.send_modify(|state| patch.apply(state));
    }

    fn set_running(&self, running: bool) {
        self.merge(StatePatch {
            running: Some(running),
            ..StatePatch::default()
        });
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring the engine and snapshot into a usable state
    ///
    /// Enables output relay, starts the event pump, sets the drum size,
    /// applies the saved yield quantum, reads every register and turns on
    /// register streaming. Calling it again after success does nothing.
    ///
    /// # Errors
    ///
    /// Returns the first backend failure; the snapshot stays uninitialized.
    pub async fn initialize(&self) -> Result<(), DriverError> {
        let _init = self.inner.init_lock.lock().await;
        if self.snapshot().initialized {
            return Ok(());
        }

        let backend = &self.inner.backend;
        backend.set_output_relay(true).await?;
        self.spawn_event_pump();

        let memory = format!("SET CPU {}", self.inner.config.memory_size);
        backend.execute(&memory, ExecOptions::default()).await?;

        let yield_steps = self.saved_yield_steps();
        backend.set_yield_steps(yield_steps).await?;
        self.merge(StatePatch {
            yield_steps: Some(yield_steps),
            ..StatePatch::default()
        });

        self.refresh_registers().await?;
        self.merge(StatePatch {
            initialized: Some(true),
            ..StatePatch::default()
        });
        self.set_register_streaming(true).await?;

        info!(memory = %self.inner.config.memory_size, yield_steps, "Emulator initialized");
        Ok(())
    }

    /// Replace the engine with a fresh one and initialize again
    ///
    /// Switch positions and the yield quantum are kept.
    ///
    /// # Errors
    ///
    /// Returns the restart or re-initialization failure.
    pub async fn restart(&self) -> Result<(), DriverError> {
        if let Err(e) = self.set_register_streaming(false).await {
            warn!(error = %e, "Could not disable register streaming before restart");
        }
        self.inner.backend.restart().await?;
        self.inner.guard.lock().clear();

        let mut reset = StatePatch::from(&RegisterSnapshot::default());
        reset.initialized = Some(false);
        reset.running = Some(false);
        self.merge(reset);

        info!("Engine restarted");
        self.initialize().await
    }

    fn saved_yield_steps(&self) -> u32 {
        let default = self.inner.config.default_yield_steps;
        match self.inner.preferences.load() {
            Ok(Preferences {
                yield_steps: Some(saved),
            }) => normalize_yield_steps(saved, default),
            Ok(_) => default,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable preferences");
                default
            }
        }
    }

    // ========================================================================
    // Event pump
    // ========================================================================

    fn spawn_event_pump(&self) {
        let Some(events) = self.inner.backend.take_events() else {
            debug!("Backend events already taken, no pump started");
            return;
        };
        let handle = tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            events,
            self.inner.config.debug_flush_interval(),
        ));
        if let Some(previous) = self.inner.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    fn handle_event(&self, event: DriverEvent, coalescer: &mut DebugLineCoalescer) {
        match event {
            DriverEvent::Output(text) => {
                coalescer.push(&text);
                // No subscribers is fine
                let _ = self.inner.output.send(text);
            }
            DriverEvent::RunState(running) => {
                if !self.inner.guard.lock().accepts(running, Instant::now()) {
                    debug!("Suppressed stale stopped event");
                    return;
                }
                self.set_running(running);
                if !running {
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.refresh_registers().await {
                            warn!(error = %e, "Register refresh after run failed");
                        }
                    });
                }
            }
            DriverEvent::Registers(snapshot) => self.merge(StatePatch::from(&snapshot)),
        }
    }

    // ========================================================================
    // Local switches
    // ========================================================================

    /// Move the display switch
    pub fn set_display_switch(&self, position: DisplaySwitch) {
        self.merge(StatePatch {
            display_switch: Some(position),
            ..StatePatch::default()
        });
    }

    /// Move the control switch
    pub fn set_control_switch(&self, position: ControlSwitch) {
        self.merge(StatePatch {
            control_switch: Some(position),
            ..StatePatch::default()
        });
    }

    /// Move the error switch
    pub fn set_error_switch(&self, position: ErrorSwitch) {
        self.merge(StatePatch {
            error_switch: Some(position),
            ..StatePatch::default()
        });
    }

    /// Set the address switches
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed address.
    pub fn set_address_switches(&self, address: &str) -> Result<(), DriverError> {
        let address = word::normalize_address(address)?;
        self.merge(StatePatch {
            address_switches: Some(address),
            ..StatePatch::default()
        });
        Ok(())
    }

    // ========================================================================
    // Optimistic register writes
    // ========================================================================

    async fn write_optimistic(
        &self,
        optimistic: StatePatch,
        register: Register,
        value: &str,
    ) -> Result<(), DriverError> {
        let revert = optimistic.reverted(&self.snapshot());
        self.merge(optimistic);

        let Err(err) = self.inner.backend.write_register(register, value).await else {
            return Ok(());
        };
        warn!(register = %register, error = %err, "Register write failed, reconciling");
        match self.inner.backend.read_registers().await {
            Ok(snapshot) => self.merge(revert.merge(StatePatch::from(&snapshot))),
            Err(refresh_err) => {
                warn!(error = %refresh_err, "Reconciliation read failed, restoring previous values");
                self.merge(revert);
            }
        }
        Err(err)
    }

    /// Write one register, showing the new value immediately
    ///
    /// # Errors
    ///
    /// Validation errors are returned before anything changes. Engine
    /// failures are returned after the snapshot has been repaired.
    pub async fn set_register(&self, register: Register, value: &str) -> Result<(), DriverError> {
        let normalized = register.normalize_value(value)?;
        let patch = StatePatch::for_register(register, &normalized);
        self.write_optimistic(patch, register, &normalized).await
    }

    /// See [`set_register`](Self::set_register)
    ///
    /// # Errors
    ///
    /// See [`set_register`](Self::set_register).
    pub async fn set_address_register(&self, value: &str) -> Result<(), DriverError> {
        self.set_register(Register::Address, value).await
    }

    /// See [`set_register`](Self::set_register)
    ///
    /// # Errors
    ///
    /// See [`set_register`](Self::set_register).
    pub async fn set_program_register(&self, value: &str) -> Result<(), DriverError> {
        self.set_register(Register::Program, value).await
    }

    /// See [`set_register`](Self::set_register)
    ///
    /// # Errors
    ///
    /// See [`set_register`](Self::set_register).
    pub async fn set_distributor(&self, value: &str) -> Result<(), DriverError> {
        self.set_register(Register::Distributor, value).await
    }

    /// See [`set_register`](Self::set_register)
    ///
    /// # Errors
    ///
    /// See [`set_register`](Self::set_register).
    pub async fn set_lower_accumulator(&self, value: &str) -> Result<(), DriverError> {
        self.set_register(Register::LowerAccumulator, value).await
    }

    /// See [`set_register`](Self::set_register)
    ///
    /// # Errors
    ///
    /// See [`set_register`](Self::set_register).
    pub async fn set_upper_accumulator(&self, value: &str) -> Result<(), DriverError> {
        self.set_register(Register::UpperAccumulator, value).await
    }

    /// See [`set_register`](Self::set_register)
    ///
    /// # Errors
    ///
    /// See [`set_register`](Self::set_register).
    pub async fn set_console_switches(&self, value: &str) -> Result<(), DriverError> {
        self.set_register(Register::ConsoleSwitches, value).await
    }

    /// Set the programmed-stop flag
    ///
    /// # Errors
    ///
    /// See [`set_register`](Self::set_register).
    pub async fn set_programmed_stop(&self, enabled: bool) -> Result<(), DriverError> {
        self.set_register(Register::ProgrammedStop, flag_text(enabled)).await
    }

    /// Set the overflow-stop flag
    ///
    /// # Errors
    ///
    /// See [`set_register`](Self::set_register).
    pub async fn set_overflow_stop(&self, enabled: bool) -> Result<(), DriverError> {
        self.set_register(Register::OverflowStop, flag_text(enabled)).await
    }

    /// Set the half-cycle flag
    ///
    /// # Errors
    ///
    /// See [`set_register`](Self::set_register).
    pub async fn set_half_cycle(&self, enabled: bool) -> Result<(), DriverError> {
        self.set_register(Register::HalfCycle, flag_text(enabled)).await
    }

    async fn set_switch_flag(
        &self,
        register: Register,
        flag: bool,
        switch: StatePatch,
    ) -> Result<(), DriverError> {
        let value = flag_text(flag);
        let patch = switch.merge(StatePatch::for_register(register, value));
        self.write_optimistic(patch, register, value).await
    }

    /// Move the programmed-stop switch and mirror it to the engine
    ///
    /// # Errors
    ///
    /// Returns the engine write failure after reconciliation.
    pub async fn set_programmed_switch(
        &self,
        position: ProgrammedSwitch,
    ) -> Result<(), DriverError> {
        let switch = StatePatch {
            programmed_switch: Some(position),
            ..StatePatch::default()
        };
        self.set_switch_flag(Register::ProgrammedStop, position.flag(), switch)
            .await
    }

    /// Move the half-cycle switch and mirror it to the engine
    ///
    /// # Errors
    ///
    /// Returns the engine write failure after reconciliation.
    pub async fn set_half_cycle_switch(&self, position: HalfCycleSwitch) -> Result<(), DriverError> {
        let switch = StatePatch {
            half_cycle_switch: Some(position),
            ..StatePatch::default()
        };
        self.set_switch_flag(Register::HalfCycle, position.flag(), switch)
            .await
    }

    /// Move the overflow switch and mirror it to the engine
    ///
    /// # Errors
    ///
    /// Returns the engine write failure after reconciliation.
    pub async fn set_overflow_switch(&self, position: OverflowSwitch) -> Result<(), DriverError> {
        let switch = StatePatch {
            overflow_switch: Some(position),
            ..StatePatch::default()
        };
        self.set_switch_flag(Register::OverflowStop, position.flag(), switch)
            .await
    }

    /// Read every register and merge them in one step
    ///
    /// # Errors
    ///
    /// Returns the backend failure; the snapshot is left unchanged.
    pub async fn refresh_registers(&self) -> Result<RegisterSnapshot, DriverError> {
        let snapshot = self.inner.backend.read_registers().await?;
        self.merge(StatePatch::from(&snapshot));
        Ok(snapshot)
    }

    // ========================================================================
    // Commands and execution
    // ========================================================================

    /// Run one command line
    ///
    /// GO, CONT and RUN mark the machine running up front and mask stale
    /// "stopped" events until the engine confirms or the command returns.
    ///
    /// # Errors
    ///
    /// Returns the command's failure after the run flag has been cleared.
    pub async fn execute_command(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandResult, DriverError> {
        let run = is_run_command(command);
        if run && !self.snapshot().running {
            self.inner.guard.lock().open(Instant::now());
            self.set_running(true);
        }

        let result = self.inner.backend.execute(command, opts).await;

        if run {
            self.inner.guard.lock().clear();
            self.set_running(false);
            if let Err(e) = self.refresh_registers().await {
                warn!(error = %e, "Register refresh after run command failed");
            }
        }
        result
    }

    /// Execute `steps` instructions, then refresh registers
    ///
    /// # Errors
    ///
    /// Returns the step or refresh failure.
    pub async fn step(&self, steps: u32) -> Result<StatusCode, DriverError> {
        let status = self.inner.backend.step(steps).await?;
        self.refresh_registers().await?;
        Ok(status)
    }

    /// Set the yield quantum, persist it and return the applied value
    ///
    /// # Errors
    ///
    /// Returns the engine failure; nothing is merged or saved in that case.
    pub async fn set_yield_steps(&self, requested: f64) -> Result<u32, DriverError> {
        let steps = normalize_yield_steps(requested, self.inner.config.default_yield_steps);
        self.inner.backend.set_yield_steps(steps).await?;
        self.merge(StatePatch {
            yield_steps: Some(steps),
            ..StatePatch::default()
        });

        let preferences = Preferences {
            yield_steps: Some(f64::from(steps)),
        };
        if let Err(e) = self.inner.preferences.save(&preferences) {
            warn!(error = %e, "Could not save yield steps");
        }
        debug!(requested, steps, "Yield steps applied");
        Ok(steps)
    }

    /// Start button: drum transfer in manual mode, otherwise start the program
    ///
    /// # Errors
    ///
    /// Returns the transfer or start failure.
    pub async fn start_program_or_transfer(&self) -> Result<(), DriverError> {
        let state = self.snapshot();
        if state.control_switch == ControlSwitch::ManualOperation {
            return self.handle_drum_transfer().await;
        }
        if state.running {
            debug!("Already running, start ignored");
            return Ok(());
        }
        self.start_program().await
    }

    async fn start_program(&self) -> Result<(), DriverError> {
        self.inner.guard.lock().open(Instant::now());
        self.set_running(true);
        match self.inner.backend.start_running().await {
            Ok(started) => {
                debug!(started, "Run loop start requested");
                Ok(())
            }
            Err(e) => {
                self.inner.guard.lock().clear();
                self.set_running(false);
                Err(e)
            }
        }
    }

    /// Halt the machine and disarm the run loop
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    pub async fn stop_program(&self) -> Result<(), DriverError> {
        self.inner.backend.stop().await?;
        self.inner.backend.stop_running().await?;
        self.inner.guard.lock().clear();
        self.set_running(false);
        Ok(())
    }

    /// Manual-mode drum transfer driven by the display switch
    ///
    /// Read-out copies the drum word at the address register into the
    /// distributor. Read-in writes the console switches to that drum word
    /// and to the distributor. Use [`transfer_address`](Self::transfer_address)
    /// to load the address register from the address switches first. Other positions, or a control switch not in
    /// manual operation, do nothing.
    ///
    /// # Errors
    ///
    /// Returns the drum or register failure.
    pub async fn handle_drum_transfer(&self) -> Result<(), DriverError> {
        let state = self.snapshot();
        if state.control_switch != ControlSwitch::ManualOperation {
            return Ok(());
        }
        let address = &state.address_register;
        match state.display_switch {
            DisplaySwitch::ReadOut => {
                let value = self.inner.backend.read_memory(address).await?;
                debug!(address = %address, value = %value, "Drum read-out");
                self.set_distributor(&value).await
            }
            DisplaySwitch::ReadIn => {
                let value = state.console_switches.clone();
                self.inner.backend.write_memory(address, &value).await?;
                debug!(address = %address, value = %value, "Drum read-in");
                self.set_distributor(&value).await
            }
            other => {
                debug!(display = ?other, "No drum transfer for display position");
                Ok(())
            }
        }
    }

    /// Copy the address switches into the address register (manual mode only)
    ///
    /// # Errors
    ///
    /// See [`set_register`](Self::set_register).
    pub async fn transfer_address(&self) -> Result<(), DriverError> {
        let state = self.snapshot();
        if state.control_switch != ControlSwitch::ManualOperation {
            return Ok(());
        }
        self.set_address_register(&state.address_switches).await
    }

    // ========================================================================
    // Resets
    // ========================================================================

    async fn stop_if_running(&self) -> Result<(), DriverError> {
        if self.snapshot().running {
            self.stop_program().await?;
        }
        Ok(())
    }

    async fn zero(&self, registers: &[Register]) -> Result<(), DriverError> {
        for &register in registers {
            let value = match register.kind() {
                RegisterKind::Address => ZERO_ADDRESS,
                RegisterKind::Word => ZERO_WORD,
                RegisterKind::Flag => flag_text(false),
            };
            self.inner.backend.write_register(register, value).await?;
        }
        Ok(())
    }

    /// Zero the program and address registers
    ///
    /// # Errors
    ///
    /// Returns the first backend failure.
    pub async fn reset_program(&self) -> Result<(), DriverError> {
        self.stop_if_running().await?;
        self.zero(&[Register::Program, Register::Address]).await?;
        self.refresh_registers().await?;
        Ok(())
    }

    /// Zero every machine register and clear the overflow indicator
    ///
    /// # Errors
    ///
    /// Returns the first backend failure.
    pub async fn reset_computer(&self) -> Result<(), DriverError> {
        self.stop_if_running().await?;
        self.zero(&[
            Register::Program,
            Register::Address,
            Register::Distributor,
            Register::LowerAccumulator,
            Register::UpperAccumulator,
            Register::Overflow,
        ])
        .await?;
        self.refresh_registers().await?;
        Ok(())
    }

    /// Zero the accumulator and distributor and clear the overflow indicator
    ///
    /// # Errors
    ///
    /// Returns the first backend failure.
    pub async fn reset_accumulator(&self) -> Result<(), DriverError> {
        self.stop_if_running().await?;
        self.zero(&[
            Register::LowerAccumulator,
            Register::UpperAccumulator,
            Register::Distributor,
            Register::Overflow,
        ])
        .await?;
        self.refresh_registers().await?;
        Ok(())
    }

    // ========================================================================
    // Register streaming
    // ========================================================================

    /// Turn periodic register samples on or off
    ///
    /// Each call takes a fresh token, so a slow older call cannot undo a
    /// newer one. Returns whether the backend applied this call.
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    pub async fn set_register_streaming(&self, enabled: bool) -> Result<bool, DriverError> {
        let token = self.inner.stream_token.fetch_add(1, Ordering::SeqCst) + 1;
        let applied = self
            .inner
            .backend
            .set_register_stream(enabled, token)
            .await?;
        if !applied {
            debug!(enabled, token, "Stale register stream toggle ignored");
        }
        Ok(applied)
    }

    // ========================================================================
    // Drum and filesystem
    // ========================================================================

    /// Read one drum word
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed address, or the backend failure.
    pub async fn read_drum(&self, address: &str) -> Result<String, DriverError> {
        let address = word::normalize_address(address)?;
        self.inner.backend.read_memory(&address).await
    }

    /// Write one drum word
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed address or word, or the
    /// backend failure.
    pub async fn write_drum(&self, address: &str, value: &str) -> Result<(), DriverError> {
        let address = word::normalize_address(address)?;
        let value = word::normalize_word(value)?;
        self.inner.backend.write_memory(&address, &value).await
    }

    /// Put a card deck into the engine filesystem and attach it to `device`
    ///
    /// # Errors
    ///
    /// Returns the filesystem or ATTACH failure.
    pub async fn attach_deck(
        &self,
        device: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<CommandResult, DriverError> {
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !parent.is_empty() {
                self.inner.backend.mkdir(parent).await?;
            }
        }
        self.inner.backend.write_file(path, contents).await?;
        info!(device, path, bytes = contents.len(), "Attaching deck");
        self.execute_command(&format!("ATTACH {device} {path}"), ExecOptions::default())
            .await
    }

    /// Detach whatever is attached to `device`
    ///
    /// # Errors
    ///
    /// Returns the DETACH failure.
    pub async fn detach(&self, device: &str) -> Result<CommandResult, DriverError> {
        self.execute_command(&format!("DETACH {device}"), ExecOptions::default())
            .await
    }

    /// Write a file into the engine filesystem
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), DriverError> {
        self.inner.backend.write_file(path, contents).await
    }

    /// Read a file from the engine filesystem
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        self.inner.backend.read_file(path).await
    }

    /// Create a directory in the engine filesystem
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    pub async fn mkdir(&self, path: &str) -> Result<(), DriverError> {
        self.inner.backend.mkdir(path).await
    }

    /// Remove a file from the engine filesystem
    ///
    /// # Errors
    ///
    /// Returns the backend failure.
    pub async fn unlink(&self, path: &str) -> Result<(), DriverError> {
        self.inner.backend.unlink(path).await
    }
}

async fn pump_events<B: EmulatorBackend + 'static>(
    inner: Weak<Inner<B>>,
    mut events: mpsc::UnboundedReceiver<DriverEvent>,
    flush_every: std::time::Duration,
) {
    let service = |inner: &Weak<Inner<B>>| {
        inner
            .upgrade()
            .map(|inner| EmulatorStateService { inner })
    };
    let mut coalescer = DebugLineCoalescer::new();
    let mut flush = tokio::time::interval(flush_every);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(service) = service(&inner) else { break };
                service.handle_event(event, &mut coalescer);
            }
            _ = flush.tick() => {
                if let Some(patch) = coalescer.take() {
                    let Some(service) = service(&inner) else { break };
                    service.merge(patch);
                }
            }
        }
    }
    debug!("Event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_yield_steps() {
        assert_eq!(normalize_yield_steps(0.4, 1000), 0);
        assert_eq!(normalize_yield_steps(0.6, 1000), 1);
        assert_eq!(normalize_yield_steps(-5.0, 1000), 0);
        assert_eq!(normalize_yield_steps(2500.0, 1000), 2500);
        assert_eq!(normalize_yield_steps(200_000.0, 1000), MAX_YIELD_STEPS);
        assert_eq!(normalize_yield_steps(f64::NAN, 1000), 1000);
        assert_eq!(normalize_yield_steps(f64::INFINITY, 1000), 1000);
    }

    #[test]
    fn test_is_run_command() {
        assert!(is_run_command("GO"));
        assert!(is_run_command("  cont "));
        assert!(is_run_command("RUN 1000"));
        assert!(!is_run_command("GOTO"));
        assert!(!is_run_command("EXAMINE AR"));
        assert!(!is_run_command(""));
    }
}
