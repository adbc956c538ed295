//! Shared fixtures for session tests: fast settings and a scripted rig.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use sock_cond::config::Settings;
use sock_cond::core::{Frame, PixelFormat, StreamFormat};
use sock_cond::error::{AppResult, CondError};
use sock_cond::experiment::ProtocolClass;
use sock_cond::hardware::{
    odor_line, ChannelStates, Device, DeviceCore, DeviceFactory, DeviceSet, FrameCallback, SHOCKER_CHANNEL,
};
use sock_cond::recording::{EncoderFactory, VideoEncoder};

/// Settings with millisecond-scale phases, no cameras and the trial log in `dir`.
/// Creates an empty odor list in `dir` unless one is already there.
pub fn fast_settings(dir: &Path) -> Settings {
    use ProtocolClass::*;
    let odor_list = dir.join("odor_list.txt");
    if !odor_list.exists() {
        std::fs::write(&odor_list, "").unwrap();
    }
    let mut settings = Settings::default();
    settings.application.simulate = true;
    settings.application.data_dir = dir.to_path_buf();

    let trial = &mut settings.trial;
    trial.num_trials = BTreeMap::from([(StdTrain, 1), (PsdTrain, 6), (OdorOnly, 2), (NoOdor, 2)]);
    trial.num_shock_trials = 2;
    trial.trial_duration = 0.1;
    trial.shock_duration = 0.04;
    trial.prehab = 0.05;
    trial.posthab = 0.02;
    trial.iti_min = ProtocolClass::ALL.into_iter().map(|c| (c, 0.02)).collect();
    trial.iti_max = ProtocolClass::ALL.into_iter().map(|c| (c, 0.03)).collect();

    settings.video.ports.clear();
    settings.video.pre_record = 0.03;
    settings.video.post_record = 0.03;
    settings.video.output_dir = PathBuf::from("videos");
    settings.video.video_filename = "R{animal}T{trial}C{cam}.raw".to_string();
    settings.video.frame_wait_timeout_ms = 2000;
    settings.video.sim_width = 8;
    settings.video.sim_height = 6;
    settings.video.sim_rate = 100.0;

    settings.experiment.log_filename = "rat{animal}.csv".to_string();
    settings.animal.animal_cls = BTreeMap::from([("7".to_string(), vec!["StdTrain".to_string()])]);
    settings.animal.days = vec!["train".to_string()];
    settings
}

/// Maps `animal` to a single protocol class.
pub fn with_class(mut settings: Settings, animal: &str, class: &str) -> Settings {
    settings
        .animal
        .animal_cls
        .insert(animal.to_string(), vec![class.to_string()]);
    settings
}

/// Reads a CSV file without headers.
pub fn read_rows(path: &Path) -> Vec<Vec<String>> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .unwrap()
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect()
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// =============================================================================
// Scripted rig
// =============================================================================

#[derive(Default)]
pub struct Counters {
    pub start_channel: AtomicUsize,
    pub stop_device: AtomicUsize,
    pub stop_channel: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// One output transition as seen by the rig: when, which channel, new level.
pub type Transition = (Instant, String, bool);

struct FakeDevice {
    core: DeviceCore,
    start_delay: Duration,
    fail_stop: bool,
    /// Remaining `set_state` calls to reject.
    fail_sets: Option<Arc<AtomicUsize>>,
    counters: Arc<Counters>,
    history: Arc<Mutex<Vec<Transition>>>,
}

#[async_trait]
impl Device for FakeDevice {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn start_channel(&self) -> Result<()> {
        tokio::time::sleep(self.start_delay).await;
        self.counters.start_channel.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_channel(&self) -> Result<()> {
        self.counters.stop_channel.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_device(&self) -> Result<()> {
        self.counters.stop_device.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            bail!("output stuck high");
        }
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
        if let Some(remaining) = &self.fail_sets {
            if remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("write to {} timed out", self.core.name());
            }
        }
        self.core.apply(high, low)?;
        let now = Instant::now();
        let mut history = self.history.lock();
        history.extend(high.iter().map(|n| (now, n.to_string(), true)));
        history.extend(low.iter().map(|n| (now, n.to_string(), false)));
        Ok(())
    }

    fn state(&self) -> ChannelStates {
        self.core.snapshot()
    }
}

/// Device factory with an odor bank and a shocker whose channel calls are
/// counted; no cameras. Meant for `simulate = false` sessions.
#[derive(Clone, Default)]
pub struct FakeRig {
    pub start_delay: Duration,
    pub fail_odor_stop: bool,
    pub odor_set_failures: Arc<AtomicUsize>,
    pub counters: Arc<Counters>,
    pub history: Arc<Mutex<Vec<Transition>>>,
}

impl FakeRig {
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    pub fn failing_odor_stop() -> Self {
        Self {
            fail_odor_stop: true,
            ..Self::default()
        }
    }

    /// Odor bank whose first `count` output writes fail.
    pub fn failing_odor_sets(count: usize) -> Self {
        Self {
            odor_set_failures: Arc::new(AtomicUsize::new(count)),
            ..Self::default()
        }
    }

    /// Transitions of `channel`, in order.
    pub fn transitions(&self, channel: &str) -> Vec<(Instant, bool)> {
        self.history
            .lock()
            .iter()
            .filter(|(_, name, _)| name == channel)
            .map(|(at, _, high)| (*at, *high))
            .collect()
    }

    fn device(
        &self,
        name: &str,
        channels: ChannelStates,
        fail_stop: bool,
        fail_sets: Option<Arc<AtomicUsize>>,
    ) -> Arc<dyn Device> {
        Arc::new(FakeDevice {
            core: DeviceCore::new(name, channels),
            start_delay: self.start_delay,
            fail_stop,
            fail_sets,
            counters: self.counters.clone(),
            history: self.history.clone(),
        })
    }
}

impl DeviceFactory for FakeRig {
    fn create_devices(&self, settings: &Settings, _frame_sink: &dyn Fn(usize) -> FrameCallback) -> AppResult<DeviceSet> {
        let lines = ChannelStates::with_channels((0..settings.odor.num_lines()).map(odor_line));
        Ok(DeviceSet {
            ports: Vec::new(),
            odors: self.device(
                "odors",
                lines,
                self.fail_odor_stop,
                Some(self.odor_set_failures.clone()),
            ),
            shocker: self.device("pin_dev", ChannelStates::with_channels([SHOCKER_CHANNEL]), false, None),
            cameras: Vec::new(),
        })
    }
}

// =============================================================================
// Encoders
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct Recording {
    pub frames: usize,
    pub first_pts: Option<f64>,
    pub finished: bool,
}

/// Encoder factory keeping every opened stream in memory, keyed by file name.
#[derive(Clone, Default)]
pub struct MemoryEncoders {
    pub streams: Arc<Mutex<BTreeMap<String, Recording>>>,
    pub fail_writes: bool,
    pub attempts: Arc<AtomicUsize>,
}

impl MemoryEncoders {
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.streams.lock().keys().cloned().collect()
    }

    pub fn all_finished(&self) -> bool {
        let streams = self.streams.lock();
        !streams.is_empty() && streams.values().all(|r| r.finished)
    }
}

struct MemoryEncoder {
    name: String,
    owner: MemoryEncoders,
}

impl VideoEncoder for MemoryEncoder {
    fn write_frame(&mut self, _frame: &Frame, pts: f64) -> AppResult<()> {
        self.owner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.owner.fail_writes {
            return Err(CondError::Encode("encoder rejected frame".to_string()));
        }
        let mut streams = self.owner.streams.lock();
        let recording = streams.entry(self.name.clone()).or_default();
        recording.frames += 1;
        recording.first_pts.get_or_insert(pts);
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        self.owner.streams.lock().entry(self.name.clone()).or_default().finished = true;
        Ok(())
    }
}

impl EncoderFactory for MemoryEncoders {
    fn open(&self, path: &Path, _stream: StreamFormat, _pixel: PixelFormat) -> AppResult<Box<dyn VideoEncoder>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.streams.lock().insert(name.clone(), Recording::default());
        Ok(Box::new(MemoryEncoder {
            name,
            owner: self.clone(),
        }))
    }
}
