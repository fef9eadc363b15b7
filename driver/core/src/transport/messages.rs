//! Wire Messages
//!
//! JSON shapes exchanged with the worker:
//!
//! ```text
//! request   {"id": 3, "method": "examine", "args": {"target": "AR"}}
//! response  {"id": 3, "ok": true, "result": {"AR": "1000"}}
//! response  {"id": 4, "ok": false, "error": {"kind": "simulator", "message": "...", "status": 72}}
//! event     {"type": "output", "text": "..."}
//! event     {"type": "runstate", "running": true}
//! event     {"type": "registers", "registers": {...}}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TransportError;
use crate::backend::DriverEvent;
use crate::engine::{status, StatusCode};
use crate::error::DriverError;
use crate::executor::ExecOptions;
use crate::registers::{Register, RegisterSnapshot};

/// Unique, monotonically increasing request identifier
pub type RequestId = u64;

/// Method names understood by the worker
pub mod method {
    /// Run one command line
    pub const EXECUTE: &str = "execute";
    /// `EXAMINE` parsed into pairs
    pub const EXAMINE: &str = "examine";
    /// `DEPOSIT`
    pub const DEPOSIT: &str = "deposit";
    /// Bounded step
    pub const STEP: &str = "step";
    /// Halt request (handled out-of-band)
    pub const STOP: &str = "stop";
    /// Arm the run loop
    pub const START_RUNNING: &str = "start_running";
    /// Disarm the run loop
    pub const STOP_RUNNING: &str = "stop_running";
    /// Reload the engine
    pub const RESTART: &str = "restart";
    /// Consolidated register read
    pub const READ_REGISTERS: &str = "read_registers";
    /// Single register write
    pub const WRITE_REGISTER: &str = "write_register";
    /// Drum read
    pub const READ_MEMORY: &str = "read_memory";
    /// Drum write
    pub const WRITE_MEMORY: &str = "write_memory";
    /// Engine yield steps
    pub const SET_YIELD_STEPS: &str = "set_yield_steps";
    /// Output relay toggle
    pub const SET_OUTPUT_RELAY: &str = "set_output_relay";
    /// Register stream toggle
    pub const SET_REGISTER_STREAM: &str = "set_register_stream";
    /// Virtual filesystem write
    pub const WRITE_FILE: &str = "write_file";
    /// Virtual filesystem read
    pub const READ_FILE: &str = "read_file";
    /// Virtual filesystem mkdir
    pub const MKDIR: &str = "mkdir";
    /// Virtual filesystem unlink
    pub const UNLINK: &str = "unlink";
}

// ============================================================================
// Envelopes
// ============================================================================

/// Caller → worker request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Method arguments
    #[serde(default)]
    pub args: Value,
}

impl Request {
    /// Build a request
    pub fn new(id: RequestId, method: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            method: method.into(),
            args,
        }
    }
}

/// Worker → caller response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers
    pub id: RequestId,
    /// Whether the call succeeded
    pub ok: bool,
    /// Return value on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Response {
    /// Successful response
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response
    #[must_use]
    pub fn failure(id: RequestId, error: RemoteError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    /// Response for the outcome of a dispatched call
    #[must_use]
    pub fn from_result(id: RequestId, result: Result<Value, DriverError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(e) => Self::failure(id, RemoteError::from(&e)),
        }
    }

    /// Turn the response back into a caller-side result
    ///
    /// # Errors
    ///
    /// Returns the reconstructed error for `ok: false`.
    pub fn into_result(self) -> Result<Value, DriverError> {
        if self.ok {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        match self.error {
            Some(error) => Err(error.into_driver_error()),
            None => Err(DriverError::Remote {
                kind: ErrorKind::Transport,
                message: "failure response without error".to_string(),
            }),
        }
    }
}

/// Unsolicited worker → caller notification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// Relayed engine output
    Output {
        /// One line of text
        text: String,
    },
    /// Busy-flag transition
    Runstate {
        /// New busy state
        running: bool,
    },
    /// Streamed register sample
    Registers {
        /// The sample
        registers: RegisterSnapshot,
    },
}

impl From<Event> for DriverEvent {
    fn from(event: Event) -> Self {
        match event {
            Event::Output { text } => DriverEvent::Output(text),
            Event::Runstate { running } => DriverEvent::RunState(running),
            Event::Registers { registers } => DriverEvent::Registers(registers),
        }
    }
}

/// Anything the worker sends
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    /// Answer to a request
    Response(Response),
    /// Unsolicited notification
    Event(Event),
}

// ============================================================================
// Errors on the wire
// ============================================================================

/// Error category carried across the boundary
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed word or address
    Validation,
    /// Non-ok engine status
    Simulator,
    /// Engine contract failure
    Engine,
    /// No engine loaded
    EngineUnavailable,
    /// EXAMINE produced no value
    MissingValue,
    /// Method not implemented by the worker
    UnknownMethod,
    /// Arguments did not fit the method
    BadRequest,
    /// Any other transport failure
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Simulator => "simulator",
            Self::Engine => "engine",
            Self::EngineUnavailable => "engine unavailable",
            Self::MissingValue => "missing value",
            Self::UnknownMethod => "unknown method",
            Self::BadRequest => "bad request",
            Self::Transport => "transport",
        };
        f.write_str(name)
    }
}

/// Structured error inside a failed response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Category
    pub kind: ErrorKind,
    /// Human-readable message (for simulator errors, the engine's text)
    pub message: String,
    /// Engine status for simulator errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusCode>,
}

impl From<&DriverError> for RemoteError {
    fn from(err: &DriverError) -> Self {
        let (kind, message, status) = match err {
            DriverError::Validation(e) => (ErrorKind::Validation, e.to_string(), None),
            DriverError::Simulator { status, message } => {
                (ErrorKind::Simulator, message.clone(), Some(*status))
            }
            DriverError::Engine(message) => (ErrorKind::Engine, message.clone(), None),
            DriverError::EngineUnavailable => (ErrorKind::EngineUnavailable, err.to_string(), None),
            DriverError::MissingValue { target } => (ErrorKind::MissingValue, target.clone(), None),
            DriverError::Transport(TransportError::UnknownMethod(name)) => {
                (ErrorKind::UnknownMethod, name.clone(), None)
            }
            DriverError::Transport(TransportError::BadRequest(message)) => {
                (ErrorKind::BadRequest, message.clone(), None)
            }
            DriverError::Transport(e) => (ErrorKind::Transport, e.to_string(), None),
            DriverError::Remote { kind, message } => (*kind, message.clone(), None),
        };
        Self {
            kind,
            message,
            status,
        }
    }
}

impl RemoteError {
    /// Rebuild the caller-side error
    #[must_use]
    pub fn into_driver_error(self) -> DriverError {
        match self.kind {
            ErrorKind::Simulator => DriverError::Simulator {
                status: self.status.unwrap_or(status::ERROR_BASE),
                message: self.message,
            },
            ErrorKind::Engine => DriverError::Engine(self.message),
            ErrorKind::EngineUnavailable => DriverError::EngineUnavailable,
            ErrorKind::MissingValue => DriverError::MissingValue {
                target: self.message,
            },
            ErrorKind::UnknownMethod => TransportError::UnknownMethod(self.message).into(),
            ErrorKind::BadRequest => TransportError::BadRequest(self.message).into(),
            kind @ (ErrorKind::Validation | ErrorKind::Transport) => DriverError::Remote {
                kind,
                message: self.message,
            },
        }
    }
}

// ============================================================================
// Method arguments
// ============================================================================

/// Arguments for `execute`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteArgs {
    /// Command line
    pub command: String,
    /// Echo/stream options
    #[serde(default)]
    pub opts: ExecOptions,
}

/// Arguments for `examine`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetArgs {
    /// Register name or address
    pub target: String,
}

/// Arguments for `deposit`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositArgs {
    /// Register name or address
    pub target: String,
    /// Value text
    pub value: String,
}

/// Arguments for `step` and `set_yield_steps`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepsArgs {
    /// Step count
    pub steps: u32,
}

/// Arguments for `write_register`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRegisterArgs {
    /// Register to write
    pub register: Register,
    /// Value text
    pub value: String,
}

/// Arguments for `read_memory`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressArgs {
    /// Drum address
    pub address: String,
}

/// Arguments for `write_memory`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMemoryArgs {
    /// Drum address
    pub address: String,
    /// Word text
    pub value: String,
}

/// Arguments for `set_output_relay`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledArgs {
    /// New state
    pub enabled: bool,
}

/// Arguments for `set_register_stream`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamArgs {
    /// New state
    pub enabled: bool,
    /// Activation token; stale tokens are ignored
    pub token: u64,
}

/// Arguments for `read_file`, `mkdir` and `unlink`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathArgs {
    /// Virtual filesystem path
    pub path: String,
}

/// Arguments for `write_file`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFileArgs {
    /// Virtual filesystem path
    pub path: String,
    /// File contents
    pub contents: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_event_wire_shapes() {
        assert_eq!(
            serde_json::to_value(Event::Output {
                text: "hi".to_string()
            })
            .unwrap(),
            json!({ "type": "output", "text": "hi" })
        );
        assert_eq!(
            serde_json::to_value(Event::Runstate { running: false }).unwrap(),
            json!({ "type": "runstate", "running": false })
        );
    }

    #[test]
    fn test_untagged_message_discriminates() {
        let response: WorkerMessage =
            serde_json::from_value(json!({ "id": 4, "ok": true, "result": 1 })).unwrap();
        assert!(matches!(response, WorkerMessage::Response(Response { id: 4, .. })));

        let event: WorkerMessage =
            serde_json::from_value(json!({ "type": "runstate", "running": true })).unwrap();
        assert_eq!(event, WorkerMessage::Event(Event::Runstate { running: true }));
    }

    #[test]
    fn test_success_omits_error_field() {
        let value = serde_json::to_value(Response::success(1, json!(null))).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["ok"], json!(true));
    }

    #[test]
    fn test_simulator_error_survives_boundary() {
        let original = DriverError::simulator(72, "Invalid argument\n");
        let response = Response::from_result(9, Err(original));
        let wire = serde_json::to_string(&response).unwrap();
        let back: Response = serde_json::from_str(&wire).unwrap();

        match back.into_result() {
            Err(DriverError::Simulator { status, message }) => {
                assert_eq!(status, 72);
                assert_eq!(message, "Invalid argument");
            }
            other => panic!("expected simulator error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_method_becomes_transport_error() {
        let err: DriverError = TransportError::UnknownMethod("frobnicate".to_string()).into();
        let remote = RemoteError::from(&err);
        assert_eq!(remote.kind, ErrorKind::UnknownMethod);
        let back = remote.into_driver_error();
        assert!(matches!(
            back,
            DriverError::Transport(TransportError::UnknownMethod(ref name)) if name == "frobnicate"
        ));
    }

    #[test]
    fn test_execute_args_default_opts() {
        let args: ExecuteArgs = serde_json::from_value(json!({ "command": "GO" })).unwrap();
        assert_eq!(args.opts, ExecOptions::default());
    }
}
