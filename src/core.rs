//! Core data types shared across the conditioning controller.
//!
//! # Data Flow
//!
//! ```text
//! Camera --[Frame, pts]--> FrameRouter --> FrameWriter queue --> encoder thread
//!                                     \--> FrameDisplay
//! TrialMachine --set_state--> odor bank / shock pin
//! TrialMachine --TrialLog--> trial log CSV, SessionEvent broadcast
//! ```

use crate::error::{AppResult, CondError};
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixel layout of frames delivered by a camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit single channel
    Gray,
    /// 8-bit packed RGB
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray => 1,
            PixelFormat::Rgb24 => 3,
        }
    }
}

impl FromStr for PixelFormat {
    type Err = CondError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s {
            "gray" => Ok(PixelFormat::Gray),
            "rgb24" => Ok(PixelFormat::Rgb24),
            other => Err(CondError::Configuration(format!(
                "{} is not a valid output format",
                other
            ))),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Gray => write!(f, "gray"),
            PixelFormat::Rgb24 => write!(f, "rgb24"),
        }
    }
}

/// One captured image. Pixel data is reference counted so the router can
/// hand the same frame to a writer and a display without copying.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl Frame {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            format,
            data: data.into(),
        }
    }

    /// Byte length implied by the frame geometry.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Size and rate of a camera stream. Only known once the first frame arrived.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub rate: f64,
}

/// Phases of one experimental block, in timeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Ready,
    PreHab,
    PreRecord,
    Trial,
    PostRecord,
    Iti,
    PostHab,
    Done,
}

impl Phase {
    /// Label shown on the session timeline.
    pub fn label(self) -> &'static str {
        match self {
            Phase::Init => "Init",
            Phase::Ready => "Ready",
            Phase::PreHab => "Pre-hab",
            Phase::PreRecord => "Pre",
            Phase::Trial => "Trial",
            Phase::PostRecord => "Post",
            Phase::Iti => "ITI",
            Phase::PostHab => "Post-hab",
            Phase::Done => "Done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Application-level state reported to the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppState {
    /// No devices held; a new session may start.
    Clear,
    Running,
    Paused,
    /// An error was routed to the session handler; teardown is still available.
    Error,
    Stopping,
}

/// Identity of one block: an animal on a given day/group/cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimalBlock {
    pub animal_id: String,
    pub day: String,
    pub group: String,
    pub cycle: u32,
}

impl AnimalBlock {
    pub fn new(animal_id: impl Into<String>) -> Self {
        Self {
            animal_id: animal_id.into(),
            day: String::new(),
            group: String::new(),
            cycle: 0,
        }
    }

    pub fn with_day(mut self, day: impl Into<String>) -> Self {
        self.day = day.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_cycle(mut self, cycle: u32) -> Self {
        self.cycle = cycle;
        self
    }
}

/// Record of one completed trial. Written once, never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialLog {
    pub trial: usize,
    pub timestamp: DateTime<Local>,
    /// Seconds from block start to stimulus onset.
    pub event_time: f64,
    pub odor: bool,
    pub shock: bool,
}

impl TrialLog {
    pub fn new(trial: usize, event_time: f64) -> Self {
        Self {
            trial,
            timestamp: Local::now(),
            event_time,
            odor: false,
            shock: false,
        }
    }
}
