//! Device abstraction layer.
//!
//! Every piece of rig hardware (odor valve bank, shock pin, camera channel,
//! the digital ports behind them) is driven through one capability trait,
//! [`Device`]. Simulated and hardware-backed variants are independent
//! implementations of that trait, picked once per session by the
//! [`DeviceFactory`] handed to the session.
//!
//! # Lifecycle
//!
//! ```text
//! create (inline) -> start_channel (background) -> activate(owner)
//!     -> set_state(high, low)* -> deactivate(owner) -> stop_device -> stop_channel
//! ```
//!
//! `start_channel`, `stop_device` and `stop_channel` may block on the
//! hardware and are only ever awaited from background tasks. `activate`,
//! `deactivate` and `set_state` are called from the session task and must
//! return quickly.

pub mod capture;
pub mod ftdi;
pub mod mock;
pub mod rig;
#[cfg(feature = "instrument_serial")]
pub mod serial;

use crate::config::Settings;
use crate::core::{Frame, PixelFormat, StreamFormat};
use crate::error::{AppResult, CondError};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Channel name of the shock output.
pub const SHOCKER_CHANNEL: &str = "shocker";

/// Name of odor line `idx` (`p0`, `p1`, ...).
pub fn odor_line(idx: usize) -> String {
    format!("p{}", idx)
}

/// Callback a camera invokes for every delivered frame with its capture
/// timestamp in seconds. Called on the camera's own delivery context.
pub type FrameCallback = Arc<dyn Fn(Frame, f64) + Send + Sync>;

/// Uniform lifecycle contract over heterogeneous rig devices.
#[async_trait]
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Acquires driver-side resources. Called inline while the device set is built.
    fn create(&self) -> Result<()> {
        Ok(())
    }

    /// Opens the hardware channel. May block; awaited from a background task.
    async fn start_channel(&self) -> Result<()>;

    /// Closes the hardware channel.
    async fn stop_channel(&self) -> Result<()>;

    /// Returns outputs to a safe idle state before the channel is closed.
    async fn stop_device(&self) -> Result<()>;

    /// Registers `owner` as a user; the first owner starts callback delivery.
    fn activate(&self, owner: &str) -> Result<()>;

    /// Removes `owner`; once no owner is left, callback delivery stops.
    fn deactivate(&self, owner: &str) -> Result<()>;

    fn is_activated(&self) -> bool;

    /// Drives the named channels high and low in one update.
    fn set_state(&self, high: &[&str], low: &[&str]) -> Result<()>;

    /// Snapshot of the named boolean channels.
    fn state(&self) -> ChannelStates;
}

/// Camera-specific view of a device.
pub trait VideoSource: Send + Sync {
    fn index(&self) -> usize;

    fn pixel_format(&self) -> PixelFormat;

    /// Known only after the first frame arrived.
    fn stream_format(&self) -> Option<StreamFormat>;
}

/// Polls `source` until its stream format is known. Yields with a short sleep
/// between polls; only used while a block is being set up.
pub async fn wait_for_format(source: &dyn VideoSource, timeout: Duration) -> AppResult<StreamFormat> {
    const POLL: Duration = Duration::from_millis(5);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(format) = source.stream_format() {
            return Ok(format);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CondError::Device(format!(
                "camera {} delivered no frame within {:?}",
                source.index(),
                timeout
            )));
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Named boolean channels of a device (e.g. `p3`, `shocker`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStates(BTreeMap<String, bool>);

impl ChannelStates {
    pub fn with_channels<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(|n| (n.into(), false)).collect())
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.0.get(name).copied()
    }

    pub fn is_high(&self, name: &str) -> bool {
        self.get(name).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn high_channels(&self) -> Vec<&str> {
        self.iter().filter(|(_, v)| *v).map(|(k, _)| k).collect()
    }

    /// Applies an update, rejecting unknown names and names listed as both
    /// high and low. Nothing changes when the update is rejected.
    pub fn apply(&mut self, high: &[&str], low: &[&str]) -> Result<()> {
        for name in high.iter().chain(low) {
            if !self.0.contains_key(*name) {
                bail!("unknown channel '{}'", name);
            }
        }
        if let Some(name) = high.iter().find(|n| low.contains(n)) {
            bail!("channel '{}' requested both high and low", name);
        }
        for name in high {
            self.0.insert((*name).to_string(), true);
        }
        for name in low {
            self.0.insert((*name).to_string(), false);
        }
        Ok(())
    }

    pub fn all_low(&mut self) {
        self.0.values_mut().for_each(|v| *v = false);
    }
}

/// Bookkeeping every device variant embeds: identity, owners, channel map.
pub struct DeviceCore {
    name: String,
    owners: Mutex<BTreeSet<String>>,
    channels: Mutex<ChannelStates>,
}

impl DeviceCore {
    pub fn new(name: impl Into<String>, channels: ChannelStates) -> Self {
        Self {
            name: name.into(),
            owners: Mutex::new(BTreeSet::new()),
            channels: Mutex::new(channels),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true when this call moved the device from inactive to active.
    pub fn add_owner(&self, owner: &str) -> bool {
        let mut owners = self.owners.lock();
        let was_empty = owners.is_empty();
        owners.insert(owner.to_string());
        was_empty
    }

    /// Returns true when the last owner was removed.
    pub fn remove_owner(&self, owner: &str) -> bool {
        let mut owners = self.owners.lock();
        owners.remove(owner) && owners.is_empty()
    }

    pub fn is_activated(&self) -> bool {
        !self.owners.lock().is_empty()
    }

    /// Applies an update and returns the resulting snapshot.
    pub fn apply(&self, high: &[&str], low: &[&str]) -> Result<ChannelStates> {
        let mut channels = self.channels.lock();
        channels.apply(high, low)?;
        Ok(channels.clone())
    }

    pub fn all_low(&self) -> ChannelStates {
        let mut channels = self.channels.lock();
        channels.all_low();
        channels.clone()
    }

    pub fn snapshot(&self) -> ChannelStates {
        self.channels.lock().clone()
    }
}

/// A camera seen both as a lifecycle device and as a frame source.
#[derive(Clone)]
pub struct CameraHandle {
    pub device: Arc<dyn Device>,
    pub source: Arc<dyn VideoSource>,
}

impl CameraHandle {
    pub fn new<T: Device + VideoSource + 'static>(camera: Arc<T>) -> Self {
        Self {
            device: camera.clone(),
            source: camera,
        }
    }
}

/// All devices owned by one session.
#[derive(Clone)]
pub struct DeviceSet {
    /// Infrastructure channels the other devices sit on (hardware only).
    pub ports: Vec<Arc<dyn Device>>,
    pub odors: Arc<dyn Device>,
    pub shocker: Arc<dyn Device>,
    pub cameras: Vec<CameraHandle>,
}

impl DeviceSet {
    /// Devices whose channel must be opened, infrastructure first.
    pub fn startup_order(&self) -> Vec<Arc<dyn Device>> {
        let mut devices = self.ports.clone();
        devices.push(self.odors.clone());
        devices.push(self.shocker.clone());
        devices.extend(self.cameras.iter().map(|c| c.device.clone()));
        devices
    }

    /// Outputs first, infrastructure last.
    pub fn shutdown_order(&self) -> Vec<Arc<dyn Device>> {
        let mut devices = vec![self.odors.clone(), self.shocker.clone()];
        devices.extend(self.cameras.iter().map(|c| c.device.clone()));
        devices.extend(self.ports.iter().cloned());
        devices
    }

    /// Devices that deliver callbacks and take owners.
    pub fn activatable(&self) -> Vec<Arc<dyn Device>> {
        let mut devices = vec![self.odors.clone(), self.shocker.clone()];
        devices.extend(self.cameras.iter().map(|c| c.device.clone()));
        devices
    }
}

/// Builds the session's devices. Implementations decide between simulated
/// and hardware-backed variants; the session never inspects which it got.
pub trait DeviceFactory: Send + Sync {
    /// Constructs and `create`s every device. `frame_sink(i)` yields the
    /// callback camera `i` must deliver frames to.
    fn create_devices(
        &self,
        settings: &Settings,
        frame_sink: &dyn Fn(usize) -> FrameCallback,
    ) -> AppResult<DeviceSet>;
}
