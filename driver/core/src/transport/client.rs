//! Worker Client
//!
//! The caller side of the boundary. Each call registers in the pending table,
//! sends one request frame and awaits the matching response. A single reader
//! task decodes everything the worker sends: responses resolve pending
//! entries by id (in whatever order they arrive), events go to the event
//! channel. When the worker's channel closes or a frame fails to decode,
//! every outstanding request is rejected and the client is closed for good.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::frame;
use super::messages::{
    method, AddressArgs, DepositArgs, EnabledArgs, ExecuteArgs, PathArgs, Request, Response,
    StepsArgs, StreamArgs, TargetArgs, WorkerMessage, WriteFileArgs, WriteMemoryArgs,
    WriteRegisterArgs,
};
use super::pending::PendingRequests;
use super::worker::{WorkerHandle, WorkerLink};
use super::TransportError;
use crate::backend::{DriverEvent, EmulatorBackend};
use crate::engine::StatusCode;
use crate::error::DriverError;
use crate::executor::{CommandResult, ExecOptions};
use crate::registers::{Register, RegisterSnapshot};
use crate::word;

/// Async backend that forwards every call to a worker context
pub struct WorkerClient {
    requests: mpsc::Sender<Vec<u8>>,
    pending: Arc<PendingRequests<Response>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
    reader: JoinHandle<()>,
    worker: Option<WorkerHandle>,
}

impl WorkerClient {
    /// Attach to a worker's byte link and start the reader task
    ///
    /// `worker` is kept alive alongside the client when the worker was
    /// spawned in-process.
    #[must_use]
    pub fn connect(link: WorkerLink, worker: Option<WorkerHandle>) -> Self {
        let pending = Arc::new(PendingRequests::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(link.messages, Arc::clone(&pending), events_tx));

        Self {
            requests: link.requests,
            pending,
            events_rx: Mutex::new(Some(events_rx)),
            reader,
            worker,
        }
    }

    /// Number of requests still waiting for a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the worker link has failed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Whether the worker context has shut down
    #[must_use]
    pub fn worker_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, WorkerHandle::is_finished)
    }

    /// Send a request by method name and await its raw result
    ///
    /// # Errors
    ///
    /// Transport errors if the worker is gone, or the reconstructed worker
    /// error for a failed call.
    pub async fn call_raw(&self, method: &str, args: Value) -> Result<Value, DriverError> {
        let (id, reply) = self.pending.register()?;
        let bytes = frame::encode(&Request::new(id, method, args)).inspect_err(|e| {
            self.pending.reject(id, e.clone());
        })?;

        tracing::debug!(id, method, "Sending request");
        if self.requests.send(bytes).await.is_err() {
            self.pending.reject_all(TransportError::ContextTerminated(
                "worker request channel closed".to_string(),
            ));
        }

        match reply.await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::ConnectionClosed.into()),
        }
    }

    async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, DriverError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        let value = self.call_raw(method, args).await?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::SerializationError(e.to_string()).into())
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Arc<PendingRequests<Response>>,
    events: mpsc::UnboundedSender<DriverEvent>,
) {
    let reason = loop {
        let Some(bytes) = frames.recv().await else {
            break TransportError::ContextTerminated("worker context closed".to_string());
        };
        match frame::decode::<WorkerMessage>(&bytes) {
            Ok(WorkerMessage::Response(response)) => {
                let id = response.id;
                if !pending.resolve(id, response) {
                    tracing::warn!(id, "Response for unknown request id");
                }
            }
            Ok(WorkerMessage::Event(event)) => {
                let _ = events.send(event.into());
            }
            Err(e) => break e,
        }
    };

    let rejected = pending.reject_all(reason.clone());
    tracing::error!(error = %reason, rejected, "Worker link failed");
}

#[async_trait]
impl EmulatorBackend for WorkerClient {
    async fn execute(
        &self,
        command: &str,
        opts: ExecOptions,
    ) -> Result<CommandResult, DriverError> {
        let args = ExecuteArgs {
            command: command.to_string(),
            opts,
        };
        self.call(method::EXECUTE, &args).await
    }

    async fn examine(&self, target: &str) -> Result<HashMap<String, String>, DriverError> {
        let args = TargetArgs {
            target: target.to_string(),
        };
        self.call(method::EXAMINE, &args).await
    }

    async fn deposit(&self, target: &str, value: &str) -> Result<(), DriverError> {
        let args = DepositArgs {
            target: target.to_string(),
            value: value.to_string(),
        };
        self.call(method::DEPOSIT, &args).await
    }

    async fn step(&self, steps: u32) -> Result<StatusCode, DriverError> {
        self.call(method::STEP, &StepsArgs { steps }).await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.call(method::STOP, &Value::Null).await
    }

    async fn start_running(&self) -> Result<bool, DriverError> {
        self.call(method::START_RUNNING, &Value::Null).await
    }

    async fn stop_running(&self) -> Result<(), DriverError> {
        self.call(method::STOP_RUNNING, &Value::Null).await
    }

    async fn restart(&self) -> Result<(), DriverError> {
        self.call(method::RESTART, &Value::Null).await
    }

    async fn read_registers(&self) -> Result<RegisterSnapshot, DriverError> {
        self.call(method::READ_REGISTERS, &Value::Null).await
    }

    async fn write_register(&self, register: Register, value: &str) -> Result<(), DriverError> {
        let args = WriteRegisterArgs {
            register,
            value: register.normalize_value(value)?,
        };
        self.call(method::WRITE_REGISTER, &args).await
    }

    async fn read_memory(&self, address: &str) -> Result<String, DriverError> {
        let args = AddressArgs {
            address: word::normalize_address(address)?,
        };
        self.call(method::READ_MEMORY, &args).await
    }

    async fn write_memory(&self, address: &str, value: &str) -> Result<(), DriverError> {
        let args = WriteMemoryArgs {
            address: word::normalize_address(address)?,
            value: word::normalize_word(value)?,
        };
        self.call(method::WRITE_MEMORY, &args).await
    }

    async fn set_yield_steps(&self, steps: u32) -> Result<(), DriverError> {
        self.call(method::SET_YIELD_STEPS, &StepsArgs { steps }).await
    }

    async fn set_output_relay(&self, enabled: bool) -> Result<(), DriverError> {
        self.call(method::SET_OUTPUT_RELAY, &EnabledArgs { enabled })
            .await
    }

    async fn set_register_stream(&self, enabled: bool, token: u64) -> Result<bool, DriverError> {
        self.call(method::SET_REGISTER_STREAM, &StreamArgs { enabled, token })
            .await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), DriverError> {
        let args = WriteFileArgs {
            path: path.to_string(),
            contents: contents.to_vec(),
        };
        self.call(method::WRITE_FILE, &args).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        let args = PathArgs {
            path: path.to_string(),
        };
        self.call(method::READ_FILE, &args).await
    }

    async fn mkdir(&self, path: &str) -> Result<(), DriverError> {
        let args = PathArgs {
            path: path.to_string(),
        };
        self.call(method::MKDIR, &args).await
    }

    async fn unlink(&self, path: &str) -> Result<(), DriverError> {
        let args = PathArgs {
            path: path.to_string(),
        };
        self.call(method::UNLINK, &args).await
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DriverEvent>> {
        self.events_rx.lock().take()
    }
}
