//! Message types for the session actor.
//!
//! Commands flow from a [`crate::session::SessionHandle`] into the session
//! task, each carrying a oneshot responder. Events flow the other way over a
//! broadcast channel so any number of observers (CLI printer, display, tests)
//! can follow the session without touching its state.

use serde::Serialize;
use tokio::sync::oneshot;

use crate::coordinator::CoordinatorState;
use crate::core::{AnimalBlock, AppState, Phase, TrialLog};
use crate::error::AppResult;
use crate::experiment::odors::ValveRoles;
use crate::experiment::protocol::ProtocolClass;
use crate::experiment::timing::TimingProfile;

/// Commands accepted by the session actor.
#[derive(Debug)]
pub enum SessionCommand {
    /// Create and start all devices; answers with `Starting` while a
    /// background start is in flight, `Activated` when done inline
    Start {
        response: oneshot::Sender<AppResult<CoordinatorState>>,
    },

    /// Run one block for an animal
    StartBlock {
        block: AnimalBlock,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Suspend the trial machine at the next phase boundary
    Pause {
        response: oneshot::Sender<AppResult<()>>,
    },

    Resume {
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Tear down all devices; answered once the session is clear
    Stop {
        response: oneshot::Sender<AppResult<()>>,
    },

    Status {
        response: oneshot::Sender<SessionStatus>,
    },

    /// Tear down and end the session task
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

impl SessionCommand {
    /// Helper to create a Start command
    pub fn start() -> (Self, oneshot::Receiver<AppResult<CoordinatorState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Start { response: tx }, rx)
    }

    /// Helper to create a StartBlock command
    pub fn start_block(block: AnimalBlock) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartBlock { block, response: tx }, rx)
    }

    /// Helper to create a Pause command
    pub fn pause() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    /// Helper to create a Resume command
    pub fn resume() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    /// Helper to create a Stop command
    pub fn stop() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { response: tx }, rx)
    }

    /// Helper to create a Status command
    pub fn status() -> (Self, oneshot::Receiver<SessionStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::Status { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Snapshot returned by [`SessionCommand::Status`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionStatus {
    pub app_state: AppState,
    pub devices: CoordinatorState,
    pub phase: Phase,
    pub paused: bool,
    pub animal_id: Option<String>,
    pub class: Option<ProtocolClass>,
    pub trial: Option<usize>,
}

/// Notifications pushed to observers after each state change.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    AppState(AppState),
    DevicesStarted,
    Phase(Phase),
    /// Phase spans and their normalized boundaries
    Timeline {
        profile: TimingProfile,
        normalized: Vec<f64>,
    },
    OdorNames(Vec<String>),
    /// Lines to highlight: odor valve, NO valve, background groups
    ValveRoles(ValveRoles),
    TrialLabel(String),
    TrialCompleted(TrialLog),
    BlockStarted {
        animal_id: String,
        class: ProtocolClass,
        num_trials: usize,
    },
    BlockFinished {
        animal_id: String,
    },
    Error(String),
}
