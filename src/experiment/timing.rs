//! Phase timeline of a block.

use serde::Serialize;

use crate::config::TrialSettings;
use crate::config::VideoSettings;
use crate::core::Phase;
use crate::error::{AppResult, CondError};

/// One phase and its nominal duration in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PhaseSpan {
    pub phase: Phase,
    pub duration: f64,
}

/// Ordered phase durations with cumulative boundaries.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimingProfile {
    spans: Vec<PhaseSpan>,
    /// End of each span, seconds from the start of the profile.
    boundaries: Vec<f64>,
}

impl TimingProfile {
    pub fn new(spans: Vec<PhaseSpan>) -> AppResult<Self> {
        let mut boundaries = Vec::with_capacity(spans.len());
        let mut total = 0.0;
        for span in &spans {
            if !span.duration.is_finite() || span.duration < 0.0 {
                return Err(CondError::Configuration(format!(
                    "duration of {} must be a non-negative number, got {}",
                    span.phase, span.duration
                )));
            }
            total += span.duration;
            boundaries.push(total);
        }
        Ok(Self { spans, boundaries })
    }

    /// Builds the standard profile from trial and video settings. The ITI
    /// slot uses the longest configured ITI.
    pub fn from_settings(trial: &TrialSettings, video: &VideoSettings) -> AppResult<Self> {
        let span = |phase, duration| PhaseSpan { phase, duration };
        Self::new(vec![
            span(Phase::Init, 0.0),
            span(Phase::Ready, 0.0),
            span(Phase::PreHab, trial.prehab),
            span(Phase::PreRecord, video.pre_record),
            span(Phase::Trial, trial.trial_duration),
            span(Phase::PostRecord, video.post_record),
            span(Phase::Iti, trial.longest_iti()),
            span(Phase::PostHab, trial.posthab),
            span(Phase::Done, 0.0),
        ])
    }

    pub fn spans(&self) -> &[PhaseSpan] {
        &self.spans
    }

    pub fn total(&self) -> f64 {
        self.boundaries.last().copied().unwrap_or(0.0)
    }

    /// Boundaries scaled to `[0, 1]`. All zero when the total is zero.
    pub fn normalized(&self) -> Vec<f64> {
        let total = self.total();
        if total <= 0.0 {
            return vec![0.0; self.boundaries.len()];
        }
        self.boundaries.iter().map(|b| b / total).collect()
    }

    /// Offset of the start of `phase` from the start of the profile.
    pub fn start_of(&self, phase: Phase) -> Option<f64> {
        let idx = self.spans.iter().position(|s| s.phase == phase)?;
        Some(if idx == 0 { 0.0 } else { self.boundaries[idx - 1] })
    }
}
