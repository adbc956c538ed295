//! Device initialization coordinator and teardown.
//!
//! # State Machine
//!
//! ```text
//! Idle --begin--> Starting --on_started--> Started --finish_start--> Activated
//!   ^               |  (stop deferred)        |                          |
//!   |               +-------------------------+---- stop_hardware -------+
//!   +------------------------- Stopping <-------------------------------+
//! ```
//!
//! Device construction always happens inline. With simulated devices the
//! whole start completes inline as well; with hardware, `start_channel` of
//! every device runs in a background task and the result is handed back to
//! the caller's completion callback, which is expected to forward it to the
//! primary context.
//!
//! A stop requested while `Starting` is recorded and replayed once the
//! background start reports back. In-flight hardware calls are never
//! cancelled.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{AppResult, CondError};
use crate::hardware::{Device, DeviceFactory, DeviceSet, FrameCallback};

/// Owner name the session registers on every device it activates.
pub const SESSION_OWNER: &str = "session";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    Idle,
    Starting,
    Started,
    Activated,
    Stopping,
}

#[derive(Debug)]
pub enum StartOutcome {
    /// Background start in flight; completion arrives through the callback.
    Starting,
    Activated,
    /// Started but not activated because the session is paused.
    Paused,
    /// A deferred stop must now run. Carries the start error, if any.
    StopRequested(Option<CondError>),
    Failed(CondError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopRequest {
    /// Recorded; will be replayed when the start completes.
    Deferred,
    /// Teardown already running.
    AlreadyStopping,
    Proceed,
}

fn device_error(device: &dyn Device, err: anyhow::Error) -> CondError {
    CondError::device(device.name(), format!("{:#}", err))
}

pub struct DeviceCoordinator {
    state: CoordinatorState,
    devices: Option<DeviceSet>,
    stop_deferred: bool,
}

impl Default for DeviceCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCoordinator {
    pub fn new() -> Self {
        Self {
            state: CoordinatorState::Idle,
            devices: None,
            stop_deferred: false,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn devices(&self) -> Option<&DeviceSet> {
        self.devices.as_ref()
    }

    pub fn is_activated(&self) -> bool {
        self.state == CoordinatorState::Activated
    }

    /// Pausing is refused while devices are starting.
    pub fn can_pause(&self) -> bool {
        self.state != CoordinatorState::Starting
    }

    /// Creates all devices and starts them.
    ///
    /// `on_started` is only called on the hardware path, from the background
    /// task, once every `start_channel` returned or the first one failed.
    pub fn begin<F>(
        &mut self,
        settings: &Settings,
        factory: &dyn DeviceFactory,
        frame_sink: &dyn Fn(usize) -> FrameCallback,
        simulate: bool,
        on_started: F,
    ) -> AppResult<StartOutcome>
    where
        F: FnOnce(AppResult<()>) + Send + 'static,
    {
        if self.state != CoordinatorState::Idle {
            return Err(CondError::InvalidState(format!(
                "devices cannot start while {:?}",
                self.state
            )));
        }
        let devices = factory.create_devices(settings, frame_sink)?;
        info!(
            "created {} devices ({} cameras)",
            devices.startup_order().len(),
            devices.cameras.len()
        );
        let order = devices.startup_order();
        self.devices = Some(devices);

        if simulate {
            self.state = CoordinatorState::Started;
            return Ok(match self.finish_start() {
                Ok(()) => StartOutcome::Activated,
                Err(e) => StartOutcome::Failed(e),
            });
        }

        self.state = CoordinatorState::Starting;
        tokio::spawn(async move {
            on_started(start_all(order).await);
        });
        Ok(StartOutcome::Starting)
    }

    /// Consumes the background start result on the primary context.
    pub fn on_started(&mut self, result: AppResult<()>, paused: bool) -> StartOutcome {
        if self.state != CoordinatorState::Starting {
            return StartOutcome::Failed(CondError::InvalidState(format!(
                "start completion received while {:?}",
                self.state
            )));
        }
        self.state = CoordinatorState::Started;
        if std::mem::take(&mut self.stop_deferred) {
            info!("replaying stop deferred during start");
            return StartOutcome::StopRequested(result.err());
        }
        if let Err(e) = result {
            return StartOutcome::Failed(e);
        }
        if paused {
            return StartOutcome::Paused;
        }
        match self.finish_start() {
            Ok(()) => StartOutcome::Activated,
            Err(e) => StartOutcome::Failed(e),
        }
    }

    /// Re-enters the finish-start path after a pause. Returns true if the
    /// devices were activated by this call.
    pub fn resume(&mut self) -> AppResult<bool> {
        if self.state == CoordinatorState::Started {
            self.finish_start()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn finish_start(&mut self) -> AppResult<()> {
        if self.state == CoordinatorState::Activated {
            return Ok(());
        }
        let devices = self
            .devices
            .as_ref()
            .ok_or_else(|| CondError::InvalidState("no devices to activate".to_string()))?;
        for device in devices.activatable() {
            device
                .activate(SESSION_OWNER)
                .map_err(|e| device_error(device.as_ref(), e))?;
        }
        self.state = CoordinatorState::Activated;
        info!("devices activated");
        Ok(())
    }

    pub fn request_stop(&mut self) -> StopRequest {
        match self.state {
            CoordinatorState::Starting => {
                if !self.stop_deferred {
                    info!("stop deferred until devices have started");
                }
                self.stop_deferred = true;
                StopRequest::Deferred
            }
            CoordinatorState::Stopping => StopRequest::AlreadyStopping,
            _ => StopRequest::Proceed,
        }
    }

    /// Stops callback delivery on every device. Channels stay open.
    pub fn deactivate_all(&mut self) {
        let Some(devices) = &self.devices else {
            return;
        };
        for device in devices.activatable() {
            if let Err(e) = device.deactivate(SESSION_OWNER) {
                warn!("{}: deactivate failed: {:#}", device.name(), e);
            }
        }
        if self.state == CoordinatorState::Activated {
            self.state = CoordinatorState::Started;
        }
    }

    /// Releases the devices. Returns true when done inline (simulated or
    /// nothing held); otherwise `on_stopped` is called from a background task.
    pub fn stop_hardware<F>(&mut self, simulate: bool, on_stopped: F) -> bool
    where
        F: FnOnce(AppResult<()>) + Send + 'static,
    {
        let devices = match self.devices.take() {
            Some(devices) if !simulate => devices,
            _ => {
                self.state = CoordinatorState::Idle;
                return true;
            }
        };
        self.state = CoordinatorState::Stopping;
        tokio::spawn(async move {
            on_stopped(stop_all(&devices).await);
        });
        false
    }

    /// Background teardown finished.
    pub fn on_stopped(&mut self) {
        self.state = CoordinatorState::Idle;
    }
}

/// Opens every channel in order, stopping at the first failure.
async fn start_all(devices: Vec<Arc<dyn Device>>) -> AppResult<()> {
    for device in devices {
        device
            .start_channel()
            .await
            .map_err(|e| device_error(device.as_ref(), e))?;
        info!("{}: channel started", device.name());
    }
    Ok(())
}

/// Calls `stop_device` then `stop_channel` on every device. Each call is
/// guarded on its own; all failures are collected.
pub async fn stop_all(devices: &DeviceSet) -> AppResult<()> {
    let order = devices.shutdown_order();
    let mut errors = Vec::new();
    for device in &order {
        if let Err(e) = device.stop_device().await {
            warn!("{}: stop_device failed: {:#}", device.name(), e);
            errors.push(device_error(device.as_ref(), e));
        }
    }
    for device in &order {
        if let Err(e) = device.stop_channel().await {
            warn!("{}: stop_channel failed: {:#}", device.name(), e);
            errors.push(device_error(device.as_ref(), e));
        }
    }
    if errors.is_empty() {
        info!("all devices stopped");
        Ok(())
    } else {
        Err(CondError::ShutdownFailed(errors))
    }
}
