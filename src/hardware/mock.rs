//! Simulated Device Implementations
//!
//! Stand-ins for the rig hardware so a full session can run on a desk.
//! All timing uses the tokio clock, so tests can drive them with
//! `start_paused = true`.
//!
//! # Available Mocks
//!
//! - `SimOdorBank` - N odor lines `p0..pN-1`, state kept in memory
//! - `SimShocker` - the single `shocker` line
//! - `SimCamera` - synthetic frames at a fixed rate while activated
//! - `SimulatedDevices` - factory building the set above from settings

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, info};

use crate::config::Settings;
use crate::core::{Frame, PixelFormat, StreamFormat};
use crate::error::AppResult;
use crate::hardware::{
    odor_line, CameraHandle, ChannelStates, Device, DeviceCore, DeviceFactory, DeviceSet,
    FrameCallback, VideoSource, SHOCKER_CHANNEL,
};

// =============================================================================
// SimOdorBank - Simulated Odor Valves
// =============================================================================

/// Simulated odor valve bank with `num_lines` boolean lines.
pub struct SimOdorBank {
    core: DeviceCore,
}

impl SimOdorBank {
    pub fn new(name: &str, num_lines: usize) -> Self {
        Self {
            core: DeviceCore::new(name, ChannelStates::with_channels((0..num_lines).map(odor_line))),
        }
    }
}

#[async_trait]
impl Device for SimOdorBank {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start_channel(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_channel(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_device(&self) -> Result<()> {
        self.core.all_low();
        Ok(())
    }

    fn activate(&self, owner: &str) -> Result<()> {
        self.core.add_owner(owner);
        Ok(())
    }

    fn deactivate(&self, owner: &str) -> Result<()> {
        self.core.remove_owner(owner);
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.core.is_activated()
    }

    fn set_state(&self, high: &[&str], low: &[&str]) -> Result<()> {
        let states = self.core.apply(high, low)?;
        debug!("{}: high={:?}", self.core.name(), states.high_channels());
        Ok(())
    }

    fn state(&self) -> ChannelStates {
        self.core.snapshot()
    }
}

// =============================================================================
// SimShocker - Simulated Shock Output
// =============================================================================

/// Simulated shock output pin.
pub struct SimShocker {
    core: DeviceCore,
}

impl SimShocker {
    pub fn new(name: &str) -> Self {
        Self {
            core: DeviceCore::new(name, ChannelStates::with_channels([SHOCKER_CHANNEL])),
        }
    }
}

#[async_trait]
impl Device for SimShocker {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start_channel(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_channel(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_device(&self) -> Result<()> {
        self.core.all_low();
        Ok(())
    }

    fn activate(&self, owner: &str) -> Result<()> {
        self.core.add_owner(owner);
        Ok(())
    }

    fn deactivate(&self, owner: &str) -> Result<()> {
        self.core.remove_owner(owner);
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.core.is_activated()
    }

    fn set_state(&self, high: &[&str], low: &[&str]) -> Result<()> {
        let states = self.core.apply(high, low)?;
        debug!("{}: shocker={}", self.core.name(), states.is_high(SHOCKER_CHANNEL));
        Ok(())
    }

    fn state(&self) -> ChannelStates {
        self.core.snapshot()
    }
}

// =============================================================================
// SimCamera - Synthetic Frame Source
// =============================================================================

/// Simulated camera channel.
///
/// While at least one owner holds it activated, a tokio task produces a
/// frame every `1 / rate` seconds (a bright bar sweeping over a vertical
/// gradient) and hands it to the frame callback. The stream format becomes
/// known with the first frame, like a real capture card.
pub struct SimCamera {
    core: DeviceCore,
    index: usize,
    width: u32,
    height: u32,
    rate: f64,
    format: PixelFormat,
    sink: FrameCallback,
    stream: Arc<Mutex<Option<StreamFormat>>>,
    frames: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimCamera {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        index: usize,
        width: u32,
        height: u32,
        rate: f64,
        format: PixelFormat,
        sink: FrameCallback,
    ) -> Self {
        Self {
            core: DeviceCore::new(name, ChannelStates::default()),
            index,
            width,
            height,
            rate,
            format,
            sink,
            stream: Arc::new(Mutex::new(None)),
            frames: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Total number of frames delivered so far.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn synthesize(width: u32, height: u32, format: PixelFormat, n: u64) -> Frame {
        let bpp = format.bytes_per_pixel();
        let bar = (width / 8).max(1) as u64;
        let mut data = Vec::with_capacity(width as usize * height as usize * bpp);
        for y in 0..height {
            let shade = (y * 255 / height.max(1)) as u8;
            for x in 0..width {
                let value = if (x as u64 + n) % (width as u64) < bar { 255 } else { shade };
                data.extend(std::iter::repeat(value).take(bpp));
            }
        }
        Frame::new(width, height, format, Bytes::from(data))
    }

    fn spawn_stream(&self) -> Result<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow!("{} needs a tokio runtime to stream: {}", self.core.name(), e))?;
        if !(self.rate > 0.0) {
            return Err(anyhow!("{}: frame rate must be positive", self.core.name()));
        }
        let (width, height, format, rate) = (self.width, self.height, self.format, self.rate);
        let sink = self.sink.clone();
        let stream = self.stream.clone();
        let frames = self.frames.clone();

        Ok(runtime.spawn(async move {
            let start = Instant::now();
            let mut ticker = interval(Duration::from_secs_f64(1.0 / rate));
            let mut n: u64 = 0;
            loop {
                ticker.tick().await;
                let frame = Self::synthesize(width, height, format, n);
                let pts = start.elapsed().as_secs_f64();
                stream.lock().get_or_insert(StreamFormat { width, height, rate });
                sink(frame, pts);
                frames.fetch_add(1, Ordering::Relaxed);
                n += 1;
            }
        }))
    }
}

#[async_trait]
impl Device for SimCamera {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start_channel(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_channel(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_device(&self) -> Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }

    fn activate(&self, owner: &str) -> Result<()> {
        if self.core.add_owner(owner) {
            let task = self.spawn_stream()?;
            *self.task.lock() = Some(task);
            info!("{}: streaming {}x{} @ {} fps", self.core.name(), self.width, self.height, self.rate);
        }
        Ok(())
    }

    fn deactivate(&self, owner: &str) -> Result<()> {
        if self.core.remove_owner(owner) {
            if let Some(task) = self.task.lock().take() {
                task.abort();
            }
            info!("{}: stream stopped", self.core.name());
        }
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.core.is_activated()
    }

    fn set_state(&self, high: &[&str], low: &[&str]) -> Result<()> {
        self.core.apply(high, low).map(|_| ())
    }

    fn state(&self) -> ChannelStates {
        self.core.snapshot()
    }
}

impl VideoSource for SimCamera {
    fn index(&self) -> usize {
        self.index
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn stream_format(&self) -> Option<StreamFormat> {
        *self.stream.lock()
    }
}

// =============================================================================
// SimulatedDevices - Factory
// =============================================================================

/// Builds a fully simulated device set.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedDevices;

impl DeviceFactory for SimulatedDevices {
    fn create_devices(
        &self,
        settings: &Settings,
        frame_sink: &dyn Fn(usize) -> FrameCallback,
    ) -> AppResult<DeviceSet> {
        let video = &settings.video;
        let mut cameras = Vec::with_capacity(video.num_cameras());
        for (i, port) in video.ports.iter().enumerate() {
            let camera = SimCamera::new(
                &format!("player{}", port),
                i,
                video.sim_width,
                video.sim_height,
                video.sim_rate,
                video.pixel_format(i)?,
                frame_sink(i),
            );
            cameras.push(CameraHandle::new(Arc::new(camera)));
        }

        Ok(DeviceSet {
            ports: Vec::new(),
            odors: Arc::new(SimOdorBank::new("odors", settings.odor.num_lines())),
            shocker: Arc::new(SimShocker::new("pin_dev")),
            cameras,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
