//! Scripted Engine Test Double
//!
//! A small in-memory stand-in for the real simulator engine, used by the unit
//! and integration tests. It understands the handful of commands the driver
//! issues (`EXAMINE`, `DEPOSIT`, `SET CPU`, `RESET`, `GO`, `ATTACH`, ...),
//! keeps registers, drum words and a virtual filesystem, and lets tests
//! inject failures at runtime.
//!
//! # Usage
//!
//! ```ignore
//! use drum_driver_core::testing::ScriptedHandle;
//!
//! let handle = ScriptedHandle::new().with_program_length(Some(25));
//! let loader = handle.loader();
//!
//! // Make the next console-switch write fail at the engine
//! handle.fail_deposit("CSW");
//!
//! // After the test, check what the driver sent
//! assert!(!handle.issued("GO"));
//! ```
//!
//! Extra test-only commands: `ECHO <text>`, `SLEEP <ms>`, `QUIT <code>`,
//! `CRASH`, `PANIC [<ms>]` and `SILENTFAIL <code>`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::engine::{
    status, Engine, EngineContext, EngineFault, EngineLoader, OutputStream, StatusCode,
};
use crate::registers::Register;
use crate::word::{self, ZERO_ADDRESS, ZERO_WORD};

/// Status for an unrecognized command verb
pub const UNKNOWN_COMMAND: StatusCode = status::ERROR_BASE + 1;

/// Status for a missing file on `ATTACH`
pub const FILE_OPEN_ERROR: StatusCode = status::ERROR_BASE + 2;

/// Status for a bad command argument
pub const INVALID_ARGUMENT: StatusCode = status::ERROR_BASE + 8;

/// Steps the default scripted program runs before its programmed stop
pub const DEFAULT_PROGRAM_LENGTH: u64 = 100;

const GO_BATCH: u32 = 1_000;

// ============================================================================
// Shared Script
// ============================================================================

#[derive(Debug)]
struct Script {
    program_length: Option<u64>,
    trace: bool,
    failing_deposits: HashSet<String>,
    fail_examine: bool,
    commands: Vec<String>,
    steps_run: u64,
    yield_steps: Option<u32>,
    loads: u32,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            program_length: Some(DEFAULT_PROGRAM_LENGTH),
            trace: false,
            failing_deposits: HashSet::new(),
            fail_examine: false,
            commands: Vec::new(),
            steps_run: 0,
            yield_steps: None,
            loads: 0,
        }
    }
}

/// Shared configuration and observation point for scripted engines
///
/// Every engine produced by [`ScriptedHandle::loader`] reads its failure
/// injection from, and records its activity into, the same handle. Machine
/// state (registers, drum, files) is per engine and does not survive a
/// reload.
#[derive(Clone, Debug, Default)]
pub struct ScriptedHandle {
    inner: Arc<Mutex<Script>>,
}

impl ScriptedHandle {
    /// Create a handle with the default program
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps the program runs before a programmed stop (`None` runs until halted)
    #[must_use]
    pub fn with_program_length(self, length: Option<u64>) -> Self {
        self.inner.lock().program_length = length;
        self
    }

    /// Emit instruction and accumulator trace lines while running
    #[must_use]
    pub fn with_trace(self, trace: bool) -> Self {
        self.inner.lock().trace = trace;
        self
    }

    /// Loader producing engines bound to this handle
    #[must_use]
    pub fn loader(&self) -> Arc<dyn EngineLoader> {
        let handle = self.clone();
        Arc::new(
            move |ctx: EngineContext| -> Result<Box<dyn Engine>, EngineFault> {
                handle.inner.lock().loads += 1;
                Ok(Box::new(ScriptedEngine::with_handle(ctx, handle.clone())))
            },
        )
    }

    /// Reject `DEPOSIT` to `target` (register mnemonic or address)
    pub fn fail_deposit(&self, target: &str) {
        self.inner
            .lock()
            .failing_deposits
            .insert(target.trim().to_uppercase());
    }

    /// Reject every `EXAMINE`
    pub fn fail_examine(&self, fail: bool) {
        self.inner.lock().fail_examine = fail;
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        let mut script = self.inner.lock();
        script.failing_deposits.clear();
        script.fail_examine = false;
    }

    /// Every command received so far, across reloads
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().commands.clone()
    }

    /// Whether any received command starts with the verb `verb`
    #[must_use]
    pub fn issued(&self, verb: &str) -> bool {
        self.inner.lock().commands.iter().any(|c| {
            c.split_whitespace()
                .next()
                .is_some_and(|v| v.eq_ignore_ascii_case(verb))
        })
    }

    /// Instructions executed so far, across reloads
    #[must_use]
    pub fn steps_run(&self) -> u64 {
        self.inner.lock().steps_run
    }

    /// Last yield-step value pushed to any engine
    #[must_use]
    pub fn yield_steps(&self) -> Option<u32> {
        self.inner.lock().yield_steps
    }

    /// How many engines the loader has produced
    #[must_use]
    pub fn loads(&self) -> u32 {
        self.inner.lock().loads
    }
}

// ============================================================================
// Scripted Engine
// ============================================================================

/// In-memory engine double
pub struct ScriptedEngine {
    ctx: EngineContext,
    script: ScriptedHandle,
    registers: HashMap<Register, String>,
    drum: HashMap<String, String>,
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
    attached: HashMap<String, String>,
    memory_size: String,
    remaining: Option<u64>,
}

impl ScriptedEngine {
    /// Engine with its own default handle
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self::with_handle(ctx, ScriptedHandle::new())
    }

    /// Engine reporting to `script`
    #[must_use]
    pub fn with_handle(ctx: EngineContext, script: ScriptedHandle) -> Self {
        let remaining = script.inner.lock().program_length;
        let registers = Register::ALL
            .into_iter()
            .map(|r| (r, zero_value(r).to_string()))
            .collect();
        Self {
            ctx,
            script,
            registers,
            drum: HashMap::new(),
            files: HashMap::new(),
            dirs: HashSet::new(),
            attached: HashMap::new(),
            memory_size: "1K".to_string(),
            remaining,
        }
    }

    /// Loader for engines with fresh default handles
    #[must_use]
    pub fn loader() -> Arc<dyn EngineLoader> {
        ScriptedHandle::new().loader()
    }

    fn say(&self, text: &str) {
        self.ctx.output.emit(OutputStream::Stdout, text);
    }

    fn complain(&self, text: &str, code: StatusCode) -> StatusCode {
        self.ctx.output.emit(OutputStream::Stderr, text);
        code
    }

    fn register(&self, register: Register) -> &str {
        self.registers
            .get(&register)
            .map_or(zero_value(register), String::as_str)
    }

    fn examine(&self, targets: &str) -> StatusCode {
        if self.script.inner.lock().fail_examine {
            return self.complain("Examine failed", INVALID_ARGUMENT);
        }
        let mut lines = Vec::new();
        for target in targets.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(register) = Register::from_mnemonic(target) {
                lines.push(format!("{}:\t{}", register, self.register(register)));
            } else if let Ok(address) = word::normalize_address(target) {
                let value = self.drum.get(&address).map_or(ZERO_WORD, String::as_str);
                lines.push(format!("{address}:\t{value}"));
            } else {
                return self.complain(&format!("Invalid argument: {target}"), INVALID_ARGUMENT);
            }
        }
        if lines.is_empty() {
            return self.complain("Missing argument", INVALID_ARGUMENT);
        }
        for line in lines {
            self.say(&line);
        }
        status::OK
    }

    fn deposit(&mut self, target: &str, value: &str) -> StatusCode {
        let key = target.trim().to_uppercase();
        if self.script.inner.lock().failing_deposits.contains(&key) {
            return self.complain("Deposit rejected", INVALID_ARGUMENT);
        }
        if let Some(register) = Register::from_mnemonic(&key) {
            match register.normalize_value(value) {
                Ok(value) => {
                    self.registers.insert(register, value);
                    status::OK
                }
                Err(e) => self.complain(&format!("Invalid value: {e}"), INVALID_ARGUMENT),
            }
        } else if let Ok(address) = word::normalize_address(&key) {
            match word::normalize_word(value) {
                Ok(value) => {
                    self.drum.insert(address, value);
                    status::OK
                }
                Err(e) => self.complain(&format!("Invalid value: {e}"), INVALID_ARGUMENT),
            }
        } else {
            self.complain(&format!("Invalid argument: {target}"), INVALID_ARGUMENT)
        }
    }

    fn reset(&mut self) {
        for register in [
            Register::Address,
            Register::Program,
            Register::Distributor,
            Register::LowerAccumulator,
            Register::UpperAccumulator,
            Register::Overflow,
        ] {
            self.registers
                .insert(register, zero_value(register).to_string());
        }
        self.remaining = self.script.inner.lock().program_length;
    }

    /// Execute up to `steps` instructions of the scripted program
    fn advance(&mut self, steps: u32) -> StatusCode {
        let steps = u64::from(steps);
        let (executed, code) = match self.remaining {
            Some(left) if left <= steps => {
                self.remaining = self.script.inner.lock().program_length;
                (left, status::PROGRAM_STOP)
            }
            Some(left) => {
                self.remaining = Some(left - steps);
                (steps, status::STEP_EXPIRED)
            }
            None => (steps, status::STEP_EXPIRED),
        };

        let trace = {
            let mut script = self.script.inner.lock();
            script.steps_run += executed;
            script.trace
        };

        let ar: u64 = self.register(Register::Address).parse().unwrap_or(0);
        let ar = format!("{:04}", (ar + executed) % 10_000);
        self.registers.insert(Register::Address, ar.clone());

        if trace {
            let pr = self.register(Register::Program).to_string();
            if pr.len() >= 10 && pr.is_ascii() {
                self.say(&format!("Exec {ar}: {} {} {}", &pr[..2], &pr[2..6], &pr[6..10]));
            }
            let upper = self.register(Register::UpperAccumulator).to_string();
            let lower = self.register(Register::LowerAccumulator).to_string();
            let ov = self.register(Register::Overflow).to_string();
            if let (Some((up, _)), Some((lo, sign))) =
                (word::split_word(&upper), word::split_word(&lower))
            {
                self.say(&format!("ACC: {up} {lo}{sign} OV: {ov}"));
            }
        }
        code
    }

    fn go(&mut self) -> StatusCode {
        let control = Arc::clone(&self.ctx.control);
        control.set_busy(true);
        let unbounded = self.remaining.is_none();
        let code = loop {
            if control.take_halt() {
                let ar = self.register(Register::Address).to_string();
                self.say(&format!("Simulation stopped, AR: {ar}"));
                break status::STOP;
            }
            if self.advance(GO_BATCH) == status::PROGRAM_STOP {
                let ar = self.register(Register::Address).to_string();
                self.say(&format!("Programmed stop, AR: {ar}"));
                break status::PROGRAM_STOP;
            }
            if unbounded {
                std::thread::sleep(Duration::from_millis(1));
            }
        };
        control.set_busy(false);
        code
    }
}

fn zero_value(register: Register) -> &'static str {
    match register {
        Register::Address => ZERO_ADDRESS,
        r if r.kind() == crate::registers::RegisterKind::Flag => "0",
        _ => ZERO_WORD,
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

impl Engine for ScriptedEngine {
    fn command(&mut self, command: &str) -> Result<StatusCode, EngineFault> {
        self.script.inner.lock().commands.push(command.to_string());

        let mut parts = command.split_whitespace();
        let verb = parts.next().unwrap_or_default().to_uppercase();
        let args: Vec<&str> = parts.collect();

        let code = match verb.as_str() {
            "SHOW" => match args.first().map(|a| a.to_uppercase()).as_deref() {
                Some("VERSION") => {
                    self.say("drum simulator V4.0 (scripted)");
                    status::OK
                }
                Some("CPU") => {
                    self.say(&format!("CPU, {}", self.memory_size));
                    status::OK
                }
                Some("DEVICES") => {
                    let mut devices: Vec<_> = self.attached.iter().collect();
                    devices.sort();
                    for (device, path) in devices {
                        self.say(&format!("{device}: attached to {path}"));
                    }
                    status::OK
                }
                _ => self.complain("Invalid argument", INVALID_ARGUMENT),
            },
            "ECHO" => {
                self.say(&args.join(" "));
                status::OK
            }
            "EXAMINE" => self.examine(&args.join("")),
            "DEPOSIT" => match args.as_slice() {
                [target, value] => self.deposit(target, value),
                _ => self.complain("Invalid argument", INVALID_ARGUMENT),
            },
            "SET" => match args.as_slice() {
                [device, size]
                    if device.eq_ignore_ascii_case("CPU")
                        && ["1K", "2K", "4K"].contains(&size.to_uppercase().as_str()) =>
                {
                    self.memory_size = size.to_uppercase();
                    status::OK
                }
                _ => self.complain("Invalid argument", INVALID_ARGUMENT),
            },
            "RESET" => {
                self.reset();
                status::OK
            }
            "GO" | "CONT" | "RUN" => self.go(),
            "ATTACH" => match args.as_slice() {
                [device, path] if self.files.contains_key(*path) => {
                    self.attached
                        .insert(device.to_uppercase(), (*path).to_string());
                    status::OK
                }
                [_, _] => self.complain("File open error", FILE_OPEN_ERROR),
                _ => self.complain("Invalid argument", INVALID_ARGUMENT),
            },
            "DETACH" => match args.as_slice() {
                [device] => {
                    self.attached.remove(&device.to_uppercase());
                    status::OK
                }
                _ => self.complain("Invalid argument", INVALID_ARGUMENT),
            },
            "SLEEP" => {
                let ms = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                status::OK
            }
            "QUIT" => {
                let code = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
                self.say("Goodbye");
                return Err(EngineFault::Exit(code));
            }
            "CRASH" => return Err(EngineFault::Crashed("scripted crash".to_string())),
            "PANIC" => {
                let ms = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                panic!("scripted engine panic");
            }
            "SILENTFAIL" => args.first().and_then(|a| a.parse().ok()).unwrap_or(0),
            _ => self.complain("Unknown command", UNKNOWN_COMMAND),
        };
        Ok(code)
    }

    fn run(&mut self, steps: u32) -> Result<StatusCode, EngineFault> {
        if self.ctx.control.take_halt() {
            return Ok(status::STOP);
        }
        Ok(self.advance(steps))
    }

    fn set_yield_steps(&mut self, steps: u32) {
        self.script.inner.lock().yield_steps = Some(steps);
    }

    fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<(), EngineFault> {
        let parent = parent_dir(path);
        if !parent.is_empty() && !self.dirs.contains(parent) {
            return Err(EngineFault::Filesystem {
                path: path.to_string(),
                message: "no such directory".to_string(),
            });
        }
        self.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, EngineFault> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| EngineFault::Filesystem {
                path: path.to_string(),
                message: "no such file".to_string(),
            })
    }

    fn mkdir(&mut self, path: &str) -> Result<(), EngineFault> {
        if self.files.contains_key(path) {
            return Err(EngineFault::Filesystem {
                path: path.to_string(),
                message: "file exists".to_string(),
            });
        }
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            self.dirs.insert(current.clone());
        }
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> Result<(), EngineFault> {
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| EngineFault::Filesystem {
                path: path.to_string(),
                message: "no such file".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineControl, OutputRouter};

    fn engine() -> (ScriptedEngine, OutputRouter) {
        let output = OutputRouter::new();
        let ctx = EngineContext {
            output: output.clone(),
            control: Arc::new(EngineControl::new()),
        };
        (ScriptedEngine::new(ctx), output)
    }

    #[test]
    fn test_examine_prints_tab_separated_pairs() {
        let (mut engine, output) = engine();
        let capture = output.begin_capture(false);
        assert_eq!(engine.command("EXAMINE AR,1999").unwrap(), status::OK);
        assert_eq!(
            capture.finish(),
            vec!["AR:\t0000".to_string(), "1999:\t0000000000+".to_string()]
        );
    }

    #[test]
    fn test_go_runs_program_to_stop() {
        let (mut engine, _output) = engine();
        assert_eq!(engine.command("GO").unwrap(), status::PROGRAM_STOP);
        assert!(!engine.ctx.control.is_busy());
        assert_eq!(engine.register(Register::Address), "0100");
    }

    #[test]
    fn test_filesystem_requires_parent() {
        let (mut engine, _output) = engine();
        assert!(engine.write_file("/decks/a.dck", b"x").is_err());
        engine.mkdir("/decks").unwrap();
        engine.write_file("/decks/a.dck", b"x").unwrap();
        assert_eq!(engine.read_file("/decks/a.dck").unwrap(), b"x");
        engine.unlink("/decks/a.dck").unwrap();
        assert!(engine.read_file("/decks/a.dck").is_err());
    }
}
