//! Worker Context
//!
//! The callee side of the boundary. The worker owns the only live engine
//! handle and is made of four tasks:
//!
//! - **engine loop** (blocking thread): loads the engine, then processes
//!   requests strictly in arrival order. While the run loop is armed it polls
//!   for requests between quanta instead of blocking, which is the
//!   cooperative yield.
//! - **dispatcher**: decodes request frames and forwards them to the engine
//!   loop. `stop` is answered here directly by raising the shared halt flag,
//!   so it reaches an engine that is still busy with a long command.
//! - **runstate poller**: samples the busy flag on a fixed interval and
//!   announces only transitions. The engine loop shares the same announcer,
//!   so a run that starts and ends between two polls is still reported.
//! - **supervisor**: waits for the engine loop to end (normally or by panic)
//!   and tears the other tasks down, which closes the outbound channel and
//!   makes the caller reject everything still pending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::client::WorkerClient;
use super::frame;
use super::messages::{
    method, AddressArgs, DepositArgs, EnabledArgs, Event, ExecuteArgs, PathArgs, Request,
    Response, StepsArgs, StreamArgs, TargetArgs, WriteFileArgs, WriteMemoryArgs,
    WriteRegisterArgs,
};
use super::TransportError;
use crate::config::DriverConfig;
use crate::driver::{relay_sink, DriverCore};
use crate::engine::{EngineControl, EngineLoader, OutputRouter};
use crate::error::DriverError;

/// Byte channels connecting a caller to a worker
#[derive(Debug)]
pub struct WorkerLink {
    /// Request frames into the worker
    pub requests: mpsc::Sender<Vec<u8>>,
    /// Response and event frames out of the worker
    pub messages: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Handle on a running worker's supervisor task
#[derive(Debug)]
pub struct WorkerHandle {
    supervisor: JoinHandle<()>,
}

impl WorkerHandle {
    /// Whether the worker has shut down
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Wait for the worker to shut down
    pub async fn join(self) {
        let _ = self.supervisor.await;
    }
}

/// Outbound frame sender usable from both async tasks and the engine thread
#[derive(Clone, Debug)]
struct Outbound(mpsc::UnboundedSender<Vec<u8>>);

impl Outbound {
    fn send<T: Serialize>(&self, msg: &T) -> bool {
        match frame::encode(msg) {
            Ok(bytes) => self.0.send(bytes).is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping unencodable worker message");
                true
            }
        }
    }

    fn event(&self, event: Event) -> bool {
        self.send(&event)
    }
}

/// Last announced run state, shared by the poller and the engine loop
#[derive(Clone, Debug)]
struct RunStateAnnouncer {
    announced: Arc<AtomicBool>,
    outbound: Outbound,
}

impl RunStateAnnouncer {
    fn new(outbound: Outbound) -> Self {
        Self {
            announced: Arc::new(AtomicBool::new(false)),
            outbound,
        }
    }

    /// Emit a runstate event if `running` differs from the last one sent
    fn announce(&self, running: bool) -> bool {
        if self.announced.swap(running, Ordering::SeqCst) == running {
            return true;
        }
        tracing::debug!(running, "Run state changed");
        self.outbound.event(Event::Runstate { running })
    }
}

/// Spawn a worker and connect a client to it
///
/// # Errors
///
/// Returns the engine load failure, or a transport error if the worker died
/// before reporting in.
pub async fn spawn_worker(
    loader: Arc<dyn EngineLoader>,
    config: &DriverConfig,
) -> Result<WorkerClient, DriverError> {
    let (link, handle) = spawn(loader, config).await?;
    Ok(WorkerClient::connect(link, Some(handle)))
}

/// Spawn a worker and return the raw byte link
///
/// # Errors
///
/// See [`spawn_worker`].
pub async fn spawn(
    loader: Arc<dyn EngineLoader>,
    config: &DriverConfig,
) -> Result<(WorkerLink, WorkerHandle), DriverError> {
    let (request_tx, request_rx) = mpsc::channel::<Vec<u8>>(config.channel_capacity.max(1));
    let (message_tx, message_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (engine_tx, engine_rx) = mpsc::unbounded_channel::<Request>();
    let (ready_tx, ready_rx) = oneshot::channel();

    let outbound = Outbound(message_tx);
    let relay = Arc::new(AtomicBool::new(false));
    let announcer = RunStateAnnouncer::new(outbound.clone());

    let engine_task = {
        let outbound = outbound.clone();
        let announcer = announcer.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            engine_loop(
                loader,
                &config,
                EngineLoopIo {
                    outbound,
                    announcer,
                    relay,
                    requests: engine_rx,
                    ready: ready_tx,
                },
            );
        })
    };

    let control = match ready_rx.await {
        Ok(Ok(control)) => control,
        Ok(Err(e)) => {
            let _ = engine_task.await;
            return Err(e);
        }
        Err(_) => {
            let reason = match engine_task.await {
                Err(e) if e.is_panic() => "engine panicked while loading".to_string(),
                _ => "worker ended before reporting in".to_string(),
            };
            return Err(TransportError::ContextTerminated(reason).into());
        }
    };

    let dispatcher = tokio::spawn(dispatch_loop(
        request_rx,
        engine_tx,
        Arc::clone(&control),
        outbound.clone(),
    ));
    let poller = tokio::spawn(runstate_loop(
        control,
        announcer,
        config.runstate_poll_interval(),
    ));
    let supervisor = tokio::spawn(supervise(engine_task, dispatcher, poller));

    tracing::info!("Worker context spawned");
    Ok((
        WorkerLink {
            requests: request_tx,
            messages: message_rx,
        },
        WorkerHandle { supervisor },
    ))
}

async fn supervise(engine: JoinHandle<()>, dispatcher: JoinHandle<()>, poller: JoinHandle<()>) {
    match engine.await {
        Ok(()) => tracing::info!("Worker engine loop finished"),
        Err(e) if e.is_panic() => tracing::error!("Worker engine loop panicked"),
        Err(e) => tracing::error!(error = %e, "Worker engine loop aborted"),
    }
    dispatcher.abort();
    poller.abort();
}

async fn dispatch_loop(
    mut frames: mpsc::Receiver<Vec<u8>>,
    engine: mpsc::UnboundedSender<Request>,
    control: Arc<EngineControl>,
    outbound: Outbound,
) {
    while let Some(bytes) = frames.recv().await {
        let request = match frame::decode::<Request>(&bytes) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable request frame");
                continue;
            }
        };

        if request.method == method::STOP {
            tracing::debug!(id = request.id, "Halt requested");
            control.request_halt();
            outbound.send(&Response::success(request.id, Value::Null));
            continue;
        }

        if engine.send(request).is_err() {
            return;
        }
    }
    tracing::debug!("Request channel closed");
}

async fn runstate_loop(
    control: Arc<EngineControl>,
    announcer: RunStateAnnouncer,
    period: std::time::Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !announcer.announce(control.is_busy()) {
            break;
        }
    }
}

struct EngineLoopIo {
    outbound: Outbound,
    announcer: RunStateAnnouncer,
    relay: Arc<AtomicBool>,
    requests: mpsc::UnboundedReceiver<Request>,
    ready: oneshot::Sender<Result<Arc<EngineControl>, DriverError>>,
}

fn engine_loop(loader: Arc<dyn EngineLoader>, config: &DriverConfig, io: EngineLoopIo) {
    let EngineLoopIo {
        outbound,
        announcer,
        relay,
        mut requests,
        ready,
    } = io;
    let output = OutputRouter::new();
    let relay_out = outbound.clone();
    output.set_live_sink(Some(relay_sink(Arc::clone(&relay), move |text| {
        relay_out.event(Event::Output { text });
    })));

    let mut core = match DriverCore::new(loader, output, config) {
        Ok(core) => core,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed to load engine");
            let _ = ready.send(Err(e));
            return;
        }
    };
    let control = core.control();
    if ready.send(Ok(Arc::clone(&control))).is_err() {
        return;
    }

    loop {
        let request = if core.is_running() {
            match requests.try_recv() {
                Ok(request) => Some(request),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match requests.blocking_recv() {
                Some(request) => Some(request),
                None => break,
            }
        };

        if let Some(request) = request {
            let id = request.id;
            tracing::debug!(id, method = %request.method, "Handling request");
            let result = handle_request(&mut core, &relay, &request);
            if let Err(ref e) = result {
                tracing::debug!(id, method = %request.method, error = %e, "Request failed");
            }
            if !outbound.send(&Response::from_result(id, result)) {
                break;
            }
            announcer.announce(control.is_busy());
        }

        match core.run_quantum() {
            Ok(Some(tick)) => {
                if let Some(registers) = tick.sample {
                    outbound.event(Event::Registers { registers });
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Run loop quantum failed"),
        }
        announcer.announce(control.is_busy());
    }
    tracing::debug!("Engine loop exiting");
}

fn args<T: DeserializeOwned>(request: &Request) -> Result<T, DriverError> {
    serde_json::from_value(request.args.clone())
        .map_err(|e| TransportError::BadRequest(format!("{}: {e}", request.method)).into())
}

fn reply<T: Serialize>(value: T) -> Result<Value, DriverError> {
    serde_json::to_value(value)
        .map_err(|e| TransportError::SerializationError(e.to_string()).into())
}

fn handle_request(
    core: &mut DriverCore,
    relay: &AtomicBool,
    request: &Request,
) -> Result<Value, DriverError> {
    match request.method.as_str() {
        method::EXECUTE => {
            let a: ExecuteArgs = args(request)?;
            reply(core.execute(&a.command, a.opts)?)
        }
        method::EXAMINE => {
            let a: TargetArgs = args(request)?;
            reply(core.examine(&a.target)?)
        }
        method::DEPOSIT => {
            let a: DepositArgs = args(request)?;
            reply(core.deposit(&a.target, &a.value)?)
        }
        method::STEP => {
            let a: StepsArgs = args(request)?;
            reply(core.step(a.steps)?)
        }
        method::STOP => {
            core.stop();
            reply(())
        }
        method::START_RUNNING => reply(core.start_running()),
        method::STOP_RUNNING => {
            core.stop_running();
            reply(())
        }
        method::RESTART => reply(core.restart()?),
        method::READ_REGISTERS => reply(core.read_registers()?),
        method::WRITE_REGISTER => {
            let a: WriteRegisterArgs = args(request)?;
            reply(core.write_register(a.register, &a.value)?)
        }
        method::READ_MEMORY => {
            let a: AddressArgs = args(request)?;
            reply(core.read_memory(&a.address)?)
        }
        method::WRITE_MEMORY => {
            let a: WriteMemoryArgs = args(request)?;
            reply(core.write_memory(&a.address, &a.value)?)
        }
        method::SET_YIELD_STEPS => {
            let a: StepsArgs = args(request)?;
            reply(core.set_yield_steps(a.steps)?)
        }
        method::SET_OUTPUT_RELAY => {
            let a: EnabledArgs = args(request)?;
            relay.store(a.enabled, Ordering::SeqCst);
            reply(())
        }
        method::SET_REGISTER_STREAM => {
            let a: StreamArgs = args(request)?;
            reply(core.set_register_stream(a.enabled, a.token))
        }
        method::WRITE_FILE => {
            let a: WriteFileArgs = args(request)?;
            reply(core.write_file(&a.path, &a.contents)?)
        }
        method::READ_FILE => {
            let a: PathArgs = args(request)?;
            reply(core.read_file(&a.path)?)
        }
        method::MKDIR => {
            let a: PathArgs = args(request)?;
            reply(core.mkdir(&a.path)?)
        }
        method::UNLINK => {
            let a: PathArgs = args(request)?;
            reply(core.unlink(&a.path)?)
        }
        other => Err(TransportError::UnknownMethod(other.to_string()).into()),
    }
}
