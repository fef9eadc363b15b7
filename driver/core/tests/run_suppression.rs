//! Run-Command Suppression Tests
//!
//! A gated backend holds `GO` open until the test releases it, so run-state
//! events can be injected while the command is still in flight. The clock is
//! paused; sleeps only let the event pump catch up or step past the window.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use drum_driver_core::engine::status;
use drum_driver_core::state::MemoryPreferences;
use drum_driver_core::{
    CommandResult, DriverConfig, DriverError, DriverEvent, EmulatorBackend, EmulatorStateService,
    ExecOptions, Register, RegisterSnapshot, StatusCode,
};

/// Backend whose `GO` blocks until released
struct GatedBackend {
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
    go_entered: Notify,
    go_release: Notify,
}

impl GatedBackend {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            go_entered: Notify::new(),
            go_release: Notify::new(),
        }
    }

    fn emit(&self, event: DriverEvent) {
        self.events_tx.send(event).unwrap();
    }
}

#[async_trait]
impl EmulatorBackend for GatedBackend {
    async fn execute(
        &self,
        command: &str,
        _opts: ExecOptions,
    ) -> Result<CommandResult, DriverError> {
        if command == "GO" {
            self.go_entered.notify_one();
            self.go_release.notified().await;
        }
        Ok(CommandResult {
            text: String::new(),
            status: status::OK,
        })
    }

    async fn examine(&self, _target: &str) -> Result<HashMap<String, String>, DriverError> {
        Ok(HashMap::new())
    }

    async fn deposit(&self, _target: &str, _value: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn step(&self, _steps: u32) -> Result<StatusCode, DriverError> {
        Ok(status::STEP_EXPIRED)
    }

    async fn stop(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn start_running(&self) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn stop_running(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn restart(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn read_registers(&self) -> Result<RegisterSnapshot, DriverError> {
        Ok(RegisterSnapshot::default())
    }

    async fn write_register(&self, _register: Register, _value: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn read_memory(&self, _address: &str) -> Result<String, DriverError> {
        Ok(drum_driver_core::word::ZERO_WORD.to_string())
    }

    async fn write_memory(&self, _address: &str, _word: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn set_yield_steps(&self, _steps: u32) -> Result<(), DriverError> {
        Ok(())
    }

    async fn set_output_relay(&self, _enabled: bool) -> Result<(), DriverError> {
        Ok(())
    }

    async fn set_register_stream(&self, _enabled: bool, _token: u64) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn write_file(&self, _path: &str, _contents: &[u8]) -> Result<(), DriverError> {
        Ok(())
    }

    async fn read_file(&self, _path: &str) -> Result<Vec<u8>, DriverError> {
        Ok(Vec::new())
    }

    async fn mkdir(&self, _path: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn unlink(&self, _path: &str) -> Result<(), DriverError> {
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DriverEvent>> {
        self.events_rx.lock().take()
    }
}

fn config() -> DriverConfig {
    let mut config = DriverConfig::default();
    config.preferences_path = None;
    config
}

async fn service() -> EmulatorStateService<GatedBackend> {
    common::init_tracing();
    let service = EmulatorStateService::new(
        Arc::new(GatedBackend::new()),
        config(),
        Arc::new(MemoryPreferences::default()),
    );
    service.initialize().await.unwrap();
    service
}

/// Start `GO` on a task and wait until the backend is holding it
async fn go_in_flight(
    service: &EmulatorStateService<GatedBackend>,
) -> tokio::task::JoinHandle<Result<CommandResult, DriverError>> {
    let task = {
        let service = service.clone();
        tokio::spawn(async move { service.execute_command("GO", ExecOptions::default()).await })
    };
    service.backend().go_entered.notified().await;
    task
}

/// Let the event pump drain without leaving the suppression window
async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_stopped_event_ignored_during_go() {
    let service = service().await;
    let go = go_in_flight(&service).await;
    assert!(service.snapshot().running);

    service.backend().emit(DriverEvent::RunState(false));
    settle().await;
    assert!(service.snapshot().running);

    service.backend().go_release.notify_one();
    go.await.unwrap().unwrap();
    assert!(!service.snapshot().running);
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_running_closes_window() {
    let service = service().await;
    let go = go_in_flight(&service).await;

    service.backend().emit(DriverEvent::RunState(true));
    settle().await;
    assert!(service.snapshot().running);

    // Still well inside the window, but the engine already confirmed
    service.backend().emit(DriverEvent::RunState(false));
    settle().await;
    assert!(!service.snapshot().running);

    service.backend().go_release.notify_one();
    go.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stopped_event_accepted_once_window_expires() {
    let service = service().await;
    let go = go_in_flight(&service).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    service.backend().emit(DriverEvent::RunState(false));
    settle().await;
    assert!(!service.snapshot().running);

    service.backend().go_release.notify_one();
    go.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_completion_closes_window() {
    let service = service().await;
    let go = go_in_flight(&service).await;

    service.backend().go_release.notify_one();
    go.await.unwrap().unwrap();
    assert!(!service.snapshot().running);

    // A late "running" then "stopped" pair is taken at face value
    service.backend().emit(DriverEvent::RunState(true));
    settle().await;
    assert!(service.snapshot().running);
    service.backend().emit(DriverEvent::RunState(false));
    settle().await;
    assert!(!service.snapshot().running);
}
