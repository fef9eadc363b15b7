//! Command Executor
//!
//! Runs one textual command against the engine, captures what the engine
//! prints while it runs, and turns the numeric status into a result.
//!
//! # Echo and streaming
//!
//! | echo | stream | live subscriber sees |
//! |------|--------|----------------------|
//! | no   | no     | nothing              |
//! | no   | yes    | output lines as they arrive |
//! | yes  | yes    | `sim> CMD` first, then lines as they arrive |
//! | yes  | no     | `sim> CMD` and the full text, once the status is known |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::{status, EngineFault, EngineHost, StatusCode};
use crate::error::DriverError;

/// Per-command output options
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    /// Mirror the command text to the live subscriber
    pub echo: bool,
    /// Forward output lines live while the command runs
    pub stream_output: bool,
}

impl ExecOptions {
    /// Echo the prompt and stream output live
    #[must_use]
    pub fn interactive() -> Self {
        Self {
            echo: true,
            stream_output: true,
        }
    }
}

/// Outcome of a command that completed with an ok status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Everything the engine printed while the command ran
    pub text: String,
    /// Status with annotation bits masked off
    pub status: StatusCode,
}

/// Executes commands against the engine owned by an [`EngineHost`]
///
/// Holding the host mutably for the executor's lifetime is what keeps
/// commands single-flight.
pub struct CommandExecutor<'h> {
    host: &'h mut EngineHost,
}

impl<'h> CommandExecutor<'h> {
    /// Wrap the host for command execution
    pub fn new(host: &'h mut EngineHost) -> Self {
        Self { host }
    }

    /// Run `command` and classify its status
    ///
    /// An engine that terminates while running the command is a controlled
    /// outcome: the captured text comes back with an `[exited with status N]`
    /// marker appended instead of an error.
    ///
    /// # Errors
    ///
    /// - [`DriverError::Simulator`] for statuses outside the ok set
    /// - [`DriverError::Engine`] / [`DriverError::EngineUnavailable`] for
    ///   engine contract failures
    pub fn execute(
        &mut self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandResult, DriverError> {
        let router = self.host.output().clone();
        let prompt = format!("sim> {command}");

        if opts.echo && opts.stream_output {
            router.emit_live(&prompt);
        }

        let capture = router.begin_capture(opts.stream_output);
        tracing::debug!(command, "Executing command");
        let outcome = self.host.engine_mut()?.command(command);
        let text = capture.finish().join("\n");

        let echo_after = |text: &str| {
            if opts.echo && !opts.stream_output {
                router.emit_live(&prompt);
                if !text.is_empty() {
                    router.emit_live(text);
                }
            }
        };

        let status = match outcome {
            Ok(raw) => status::bare(raw),
            Err(EngineFault::Exit(code)) => {
                let marker = format!("[exited with status {code}]");
                let text = if text.is_empty() {
                    marker
                } else {
                    format!("{text}\n{marker}")
                };
                tracing::info!(command, code, "Engine exited");
                echo_after(&text);
                return Ok(CommandResult { text, status: code });
            }
            Err(fault) => return Err(DriverError::Engine(fault.to_string())),
        };

        echo_after(&text);

        if status::is_ok(status) {
            Ok(CommandResult { text, status })
        } else {
            tracing::debug!(command, status, "Command failed");
            Err(DriverError::simulator(status, &text))
        }
    }

    /// `EXAMINE <target>` parsed into key/value pairs
    ///
    /// # Errors
    ///
    /// Propagates [`execute`](Self::execute) errors.
    pub fn examine(&mut self, target: &str) -> Result<HashMap<String, String>, DriverError> {
        let target = normalize_target(target);
        let result = self.execute(&format!("EXAMINE {target}"), ExecOptions::default())?;
        Ok(parse_examine(&result.text))
    }

    /// `EXAMINE <target>` reduced to the value of that one target
    ///
    /// # Errors
    ///
    /// [`DriverError::MissingValue`] if the output has no usable pair.
    pub fn examine_value(&mut self, target: &str) -> Result<String, DriverError> {
        let key = normalize_target(target);
        let mut values = self.examine(&key)?;
        if let Some(value) = values.remove(&key) {
            return Ok(value);
        }
        if values.len() == 1 {
            if let Some((_, value)) = values.into_iter().next() {
                return Ok(value);
            }
        }
        Err(DriverError::MissingValue { target: key })
    }

    /// `DEPOSIT <target> <value>`
    ///
    /// # Errors
    ///
    /// Propagates [`execute`](Self::execute) errors.
    pub fn deposit(&mut self, target: &str, value: &str) -> Result<(), DriverError> {
        let target = normalize_target(target);
        self.execute(
            &format!("DEPOSIT {target} {}", value.trim()),
            ExecOptions::default(),
        )?;
        Ok(())
    }
}

fn normalize_target(target: &str) -> String {
    target.trim().to_uppercase()
}

/// Parse EXAMINE output lines of the form `KEY<:|/><whitespace>VALUE`
///
/// Keys are uppercased. Blank lines and lines that do not match are
/// skipped; when a key repeats, the first occurrence is kept.
#[must_use]
pub fn parse_examine(text: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(sep) = line.find([':', '/']) else {
            continue;
        };
        let key = line[..sep].trim();
        let rest = &line[sep + 1..];
        if key.is_empty() || key.contains(char::is_whitespace) {
            continue;
        }
        if !rest.starts_with(char::is_whitespace) {
            continue;
        }
        let value = rest.trim();
        if value.is_empty() {
            continue;
        }
        values
            .entry(key.to_uppercase())
            .or_insert_with(|| value.to_string());
    }
    values
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::engine::{LiveSink, OutputRouter};
    use crate::testing::ScriptedEngine;

    fn host_with_live() -> (EngineHost, Arc<Mutex<Vec<String>>>) {
        let router = OutputRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sink: LiveSink = Arc::new(move |line: &str| seen_clone.lock().push(line.to_string()));
        router.set_live_sink(Some(sink));
        let host = EngineHost::load(ScriptedEngine::loader(), router).unwrap();
        (host, seen)
    }

    #[test]
    fn test_parse_examine_grammar() {
        let text = "AR:\t1000\n\npr:  6510001005+\n1999/ 0000000001-\nGARBAGE\nNOSPACE:1\n";
        let values = parse_examine(text);
        assert_eq!(values.get("AR").map(String::as_str), Some("1000"));
        assert_eq!(values.get("PR").map(String::as_str), Some("6510001005+"));
        assert_eq!(values.get("1999").map(String::as_str), Some("0000000001-"));
        assert!(!values.contains_key("NOSPACE"));
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_parse_examine_first_occurrence_wins() {
        let values = parse_examine("AR: 0001\nAR: 0002");
        assert_eq!(values.get("AR").map(String::as_str), Some("0001"));
    }

    #[test]
    fn test_execute_ok_returns_text() {
        let (mut host, seen) = host_with_live();
        let result = CommandExecutor::new(&mut host)
            .execute("SHOW VERSION", ExecOptions::default())
            .unwrap();
        assert_eq!(result.status, status::OK);
        assert!(result.text.contains("drum simulator"));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_execute_error_uses_engine_text() {
        let (mut host, _) = host_with_live();
        let err = CommandExecutor::new(&mut host)
            .execute("BOGUS", ExecOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Simulator { ref message, .. } if message == "Unknown command"
        ));
    }

    #[test]
    fn test_execute_error_without_text_uses_fallback() {
        let (mut host, _) = host_with_live();
        let err = CommandExecutor::new(&mut host)
            .execute("SILENTFAIL 99", ExecOptions::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "error (99)");
    }

    #[test]
    fn test_execute_masks_annotation_bits() {
        let (mut host, _) = host_with_live();
        let result = CommandExecutor::new(&mut host)
            .execute(
                &format!("SILENTFAIL {}", status::EXIT | status::FLAG_NO_MESSAGE),
                ExecOptions::default(),
            )
            .unwrap();
        assert_eq!(result.status, status::EXIT);
    }

    #[test]
    fn test_execute_exit_appends_marker() {
        let (mut host, _) = host_with_live();
        let result = CommandExecutor::new(&mut host)
            .execute("QUIT 3", ExecOptions::default())
            .unwrap();
        assert_eq!(result.text, "Goodbye\n[exited with status 3]");
        assert_eq!(result.status, 3);
    }

    #[test]
    fn test_echo_streaming_prompt_first() {
        let (mut host, seen) = host_with_live();
        CommandExecutor::new(&mut host)
            .execute("SHOW VERSION", ExecOptions::interactive())
            .unwrap();
        let seen = seen.lock();
        assert_eq!(seen[0], "sim> SHOW VERSION");
        assert!(seen[1].contains("drum simulator"));
    }

    #[test]
    fn test_echo_buffered_after_completion() {
        let (mut host, seen) = host_with_live();
        let opts = ExecOptions {
            echo: true,
            stream_output: false,
        };
        let result = CommandExecutor::new(&mut host)
            .execute("SHOW VERSION", opts)
            .unwrap();
        assert_eq!(
            *seen.lock(),
            vec!["sim> SHOW VERSION".to_string(), result.text.clone()]
        );
    }

    #[test]
    fn test_examine_and_deposit() {
        let (mut host, _) = host_with_live();
        let mut exec = CommandExecutor::new(&mut host);
        exec.deposit(" dist ", "0000000042+").unwrap();
        assert_eq!(exec.examine_value("dist").unwrap(), "0000000042+");

        exec.deposit("1000", "0000000007-").unwrap();
        assert_eq!(exec.examine_value("1000").unwrap(), "0000000007-");
    }

    #[test]
    fn test_capture_released_after_engine_error() {
        let (mut host, _) = host_with_live();
        let _ = CommandExecutor::new(&mut host).execute("CRASH", ExecOptions::default());
        assert!(!host.output().is_capturing());
        CommandExecutor::new(&mut host)
            .execute("SHOW VERSION", ExecOptions::default())
            .unwrap();
    }
}
