//! Frame routing and recording.
//!
//! Cameras deliver frames on their own schedule into [`FrameRouter::on_frame`].
//! The router forwards each frame to the channel's live display and, while a
//! trial's writer set is bound, to that channel's [`FrameWriter`] with the
//! timestamp re-based to the first frame seen since the set was bound.
//!
//! Writers for every trial of a block are built ahead of time by
//! [`prepare_writers`] so that binding a set at trial start never waits on
//! file or encoder setup.

pub mod display;
pub mod raw;
pub mod writer;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::{AnimalBlock, Frame};
use crate::error::{AppResult, CondError};
use crate::hardware::{wait_for_format, FrameCallback, VideoSource};
pub use display::{FrameDisplay, LatestFrame};
pub use raw::{RawVideoEncoder, RawVideoFactory};
pub use writer::{EncoderFactory, FrameWriter, VideoEncoder, WriterMessage, WriterStats};

/// One writer slot per camera; `None` where the camera does not record.
pub type WriterSet = Vec<Option<FrameWriter>>;

#[derive(Default)]
struct RouterState {
    active: WriterSet,
    trials: Vec<Option<WriterSet>>,
    /// Capture timestamp of the first frame routed to the active set.
    base_pts: Option<f64>,
}

fn close_all(set: &mut WriterSet) {
    for writer in set.iter_mut().flatten() {
        writer.close();
    }
}

/// Camera frames to the current trial's writers and to the live displays.
/// Shared with the camera callbacks; the per-trial state sits behind a mutex.
pub struct FrameRouter {
    state: Mutex<RouterState>,
    displays: Vec<Arc<FrameDisplay>>,
}

impl FrameRouter {
    pub fn new(num_cameras: usize) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            displays: (0..num_cameras).map(|i| Arc::new(FrameDisplay::new(i))).collect(),
        }
    }

    /// Callback for camera `idx`.
    pub fn frame_sink(self: &Arc<Self>, idx: usize) -> FrameCallback {
        let router = Arc::clone(self);
        Arc::new(move |frame: Frame, pts: f64| router.on_frame(idx, frame, pts))
    }

    pub fn display(&self, idx: usize) -> Option<Arc<FrameDisplay>> {
        self.displays.get(idx).cloned()
    }

    pub fn num_cameras(&self) -> usize {
        self.displays.len()
    }

    /// Routes one frame. Safe to call from any thread.
    pub fn on_frame(&self, idx: usize, frame: Frame, pts: f64) {
        {
            let mut state = self.state.lock();
            let RouterState { active, base_pts, .. } = &mut *state;
            if let Some(Some(writer)) = active.get(idx) {
                let base = *base_pts.get_or_insert(pts);
                writer.add_frame(frame.clone(), pts - base);
            }
        }
        if let Some(display) = self.displays.get(idx) {
            display.show(frame, pts);
        }
    }

    /// Installs the pre-built writer sets for a block, one per trial.
    /// Any sets still held from an earlier block are closed.
    pub fn install_trial_writers(&self, sets: Vec<WriterSet>) {
        let mut state = self.state.lock();
        for set in state.trials.iter_mut().flatten() {
            close_all(set);
        }
        state.trials = sets.into_iter().map(Some).collect();
    }

    /// Binds trial `trial`'s writer set and clears the timestamp origin.
    pub fn set_trial_writers(&self, trial: usize) -> AppResult<()> {
        let mut state = self.state.lock();
        let set = state
            .trials
            .get_mut(trial)
            .and_then(Option::take)
            .ok_or_else(|| CondError::InvalidState(format!("no writers prepared for trial {}", trial)))?;
        close_all(&mut state.active);
        state.active = set;
        state.base_pts = None;
        debug!("bound writer set of trial {}", trial);
        Ok(())
    }

    /// Ends the active set's streams and unbinds it.
    pub fn reset_trial_writers(&self) {
        let mut state = self.state.lock();
        close_all(&mut state.active);
        state.active.clear();
        state.base_pts = None;
    }

    /// Ends every stream the router holds, bound or not.
    pub fn flush_all(&self) {
        let mut state = self.state.lock();
        close_all(&mut state.active);
        state.active.clear();
        for set in state.trials.iter_mut().flatten() {
            close_all(set);
        }
        state.trials.clear();
        state.base_pts = None;
    }

    /// True when camera `idx` currently has a writer bound.
    pub fn is_recording(&self, idx: usize) -> bool {
        matches!(self.state.lock().active.get(idx), Some(Some(_)))
    }
}

/// A camera as seen by writer preparation.
#[derive(Clone)]
pub struct PlannedCamera {
    pub source: Arc<dyn VideoSource>,
    /// Value of the `{cam}` placeholder.
    pub name: String,
    pub record: bool,
}

/// Everything needed to build a block's writers off the primary context.
#[derive(Clone)]
pub struct WriterPlan {
    pub template: String,
    pub output_dir: PathBuf,
    pub block: AnimalBlock,
    pub num_trials: usize,
    pub cameras: Vec<PlannedCamera>,
    pub frame_wait: Duration,
}

/// Expands the video filename template for one trial and camera.
pub fn video_filename(template: &str, block: &AnimalBlock, trial: usize, cam: &str) -> AppResult<String> {
    let vars: HashMap<String, String> = HashMap::from([
        ("day".to_string(), block.day.clone()),
        ("group".to_string(), block.group.clone()),
        ("animal".to_string(), block.animal_id.clone()),
        ("cycle".to_string(), block.cycle.to_string()),
        ("trial".to_string(), trial.to_string()),
        ("cam".to_string(), cam.to_string()),
    ]);
    strfmt::strfmt(template, &vars)
        .map_err(|e| CondError::Configuration(format!("video filename '{}': {}", template, e)))
}

/// Builds one writer set per trial. Waits, with a bounded poll, for every
/// recording camera to report its stream format first.
pub async fn prepare_writers(plan: WriterPlan, encoders: Arc<dyn EncoderFactory>) -> AppResult<Vec<WriterSet>> {
    let mut formats = Vec::with_capacity(plan.cameras.len());
    for camera in &plan.cameras {
        let format = if camera.record {
            Some(wait_for_format(camera.source.as_ref(), plan.frame_wait).await?)
        } else {
            None
        };
        formats.push(format);
    }

    let mut sets = Vec::with_capacity(plan.num_trials);
    for trial in 0..plan.num_trials {
        let mut set = WriterSet::with_capacity(plan.cameras.len());
        for (camera, format) in plan.cameras.iter().zip(&formats) {
            let writer = match format {
                Some(format) => {
                    let name = video_filename(&plan.template, &plan.block, trial, &camera.name)?;
                    let path = plan.output_dir.join(name);
                    let encoder = encoders.open(&path, *format, camera.source.pixel_format())?;
                    Some(FrameWriter::spawn(path, encoder)?)
                }
                None => None,
            };
            set.push(writer);
        }
        sets.push(set);
    }
    info!(
        "prepared writers for {} trials of animal {}",
        plan.num_trials, plan.block.animal_id
    );
    Ok(sets)
}
