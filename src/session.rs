//! Session actor.
//!
//! The session owns every component of a running experiment (device
//! coordinator, trial machine, frame router, timers) and is the primary
//! execution context: a single tokio task that either handles a command from
//! a [`SessionHandle`] or runs a continuation posted by a timer or a
//! background task. Nothing else mutates session state, so no locks guard it.
//!
//! Every error raised while handling a command or a continuation ends in
//! [`Session::session_error`], which reports it, pauses the trial machine and
//! leaves the session in `AppState::Error`. Teardown stays available from
//! every state.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::coordinator::{CoordinatorState, DeviceCoordinator, StartOutcome, StopRequest};
use crate::core::{AnimalBlock, AppState, TrialLog};
use crate::error::{AppResult, CondError};
use crate::experiment::machine::{MachineEnv, Step, TrialMachine};
use crate::hardware::{DeviceFactory, FrameCallback};
use crate::messages::{SessionCommand, SessionEvent, SessionStatus};
use crate::recording::{EncoderFactory, FrameRouter, WriterSet};
use crate::scheduler::{primary_channel, ContinuationQueue, PrimaryHandle, TimerHost, Timers};

const EVENT_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 32;

/// State owned by the session task. Driven through [`SessionHandle`].
pub struct Session {
    settings: Arc<Settings>,
    simulate: bool,
    primary: PrimaryHandle<Session>,
    timers: Timers<Session>,
    events: broadcast::Sender<SessionEvent>,
    router: Arc<FrameRouter>,
    coordinator: DeviceCoordinator,
    machine: TrialMachine,
    factory: Arc<dyn DeviceFactory>,
    encoders: Arc<dyn EncoderFactory>,
    app_state: AppState,
    stop_waiters: Vec<oneshot::Sender<AppResult<()>>>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
}

impl TimerHost for Session {
    fn timers(&mut self) -> &mut Timers<Self> {
        &mut self.timers
    }
}

impl Session {
    /// Creates a session and the continuation queue its run loop drains.
    pub fn new(
        settings: Arc<Settings>,
        factory: Arc<dyn DeviceFactory>,
        encoders: Arc<dyn EncoderFactory>,
    ) -> (Self, ContinuationQueue<Session>) {
        let (primary, queue) = primary_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let router = Arc::new(FrameRouter::new(settings.video.num_cameras()));
        let session = Self {
            simulate: settings.application.simulate,
            settings,
            timers: Timers::new(primary.clone()),
            primary,
            events,
            router,
            coordinator: DeviceCoordinator::new(),
            machine: TrialMachine::new(),
            factory,
            encoders,
            app_state: AppState::Clear,
            stop_waiters: Vec::new(),
            shutdown_waiters: Vec::new(),
            shutting_down: false,
        };
        (session, queue)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn router(&self) -> &Arc<FrameRouter> {
        &self.router
    }

    /// Runs the session until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>, mut queue: ContinuationQueue<Session>) {
        info!("session started (simulate={})", self.simulate);
        let mut commands_open = true;

        loop {
            tokio::select! {
                Some(task) = queue.recv() => task(&mut self),
                command = command_rx.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("all session handles dropped");
                        commands_open = false;
                        self.begin_shutdown();
                    }
                },
                else => break,
            }

            if self.shutting_down
                && self.app_state == AppState::Clear
                && self.coordinator.state() == CoordinatorState::Idle
            {
                self.finish_shutdown();
                break;
            }
        }
        info!("session ended");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start { response } => {
                let result = self.start_devices();
                let _ = response.send(result);
            }

            SessionCommand::StartBlock { block, response } => {
                let result = self.start_block(block);
                let _ = response.send(result);
            }

            SessionCommand::Pause { response } => {
                let result = self.pause();
                let _ = response.send(result);
            }

            SessionCommand::Resume { response } => {
                let result = self.resume();
                let _ = response.send(result);
            }

            SessionCommand::Stop { response } => {
                self.stop_waiters.push(response);
                self.stop_devices();
            }

            SessionCommand::Status { response } => {
                let _ = response.send(self.status());
            }

            SessionCommand::Shutdown { response } => {
                self.shutdown_waiters.push(response);
                self.begin_shutdown();
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_app_state(&mut self, state: AppState) {
        if self.app_state != state {
            info!("app state {:?} -> {:?}", self.app_state, state);
            self.app_state = state;
            self.emit(SessionEvent::AppState(state));
        }
    }

    /// Single sink for errors raised on the primary context.
    fn session_error(&mut self, err: &CondError) {
        error!("session error: {}", err);
        self.emit(SessionEvent::Error(err.to_string()));
        self.machine.pause();
        if !matches!(self.app_state, AppState::Stopping) {
            self.set_app_state(AppState::Error);
        }
    }

    /// Lends the trial machine the components it works through.
    fn with_machine<R>(&mut self, f: impl FnOnce(&mut TrialMachine, &mut MachineEnv<'_>) -> R) -> R {
        let mut env = MachineEnv {
            settings: &self.settings,
            devices: self.coordinator.devices(),
            timers: &mut self.timers,
            router: &self.router,
            events: &self.events,
            primary: &self.primary,
            encoders: &self.encoders,
        };
        f(&mut self.machine, &mut env)
    }

    pub(crate) fn machine_step(&mut self, step: Step) {
        if let Err(e) = self.with_machine(|machine, env| machine.advance(env, step)) {
            self.session_error(&e);
        }
    }

    pub(crate) fn on_writers_ready(&mut self, id: u64, result: AppResult<Vec<WriterSet>>) {
        if let Err(e) = self.with_machine(|machine, env| machine.on_writers_ready(env, id, result)) {
            self.session_error(&e);
        }
    }

    // -------------------------------------------------------------------------
    // Device lifecycle
    // -------------------------------------------------------------------------

    fn start_devices(&mut self) -> AppResult<CoordinatorState> {
        if self.app_state != AppState::Clear {
            return Err(CondError::InvalidState(format!(
                "devices can only start from a clear session, session is {:?}",
                self.app_state
            )));
        }
        let router = self.router.clone();
        let sink = move |idx: usize| -> FrameCallback { router.frame_sink(idx) };
        let primary = self.primary.clone();
        let begun = self.coordinator.begin(
            &self.settings,
            self.factory.as_ref(),
            &sink,
            self.simulate,
            move |result| {
                primary.run_on_primary(move |session: &mut Session| session.on_devices_started(result));
            },
        );
        match begun {
            Ok(outcome) => {
                self.set_app_state(AppState::Running);
                self.handle_start_outcome(outcome);
                Ok(self.coordinator.state())
            }
            Err(e) => {
                self.session_error(&e);
                Err(e)
            }
        }
    }

    fn on_devices_started(&mut self, result: AppResult<()>) {
        let outcome = self.coordinator.on_started(result, self.machine.is_paused());
        self.handle_start_outcome(outcome);
    }

    fn handle_start_outcome(&mut self, outcome: StartOutcome) {
        match outcome {
            StartOutcome::Starting => info!("devices starting in the background"),
            StartOutcome::Activated => {
                self.emit(SessionEvent::DevicesStarted);
                self.with_machine(|machine, env| machine.on_devices_ready(env));
            }
            StartOutcome::Paused => info!("devices started; activation waits for resume"),
            StartOutcome::StopRequested(err) => {
                if let Some(e) = err {
                    self.session_error(&e);
                }
                self.stop_devices();
            }
            StartOutcome::Failed(e) => self.session_error(&e),
        }
    }

    /// Deactivates devices, ends all streams, cancels timers, then releases
    /// the hardware in the background (inline when simulating).
    fn stop_devices(&mut self) {
        match self.coordinator.request_stop() {
            StopRequest::Deferred | StopRequest::AlreadyStopping => return,
            StopRequest::Proceed => {}
        }
        self.set_app_state(AppState::Stopping);
        self.with_machine(|machine, env| machine.abort(env));
        self.coordinator.deactivate_all();
        self.router.flush_all();
        self.timers.clear();

        let primary = self.primary.clone();
        let inline = self.coordinator.stop_hardware(self.simulate, move |result| {
            primary.run_on_primary(move |session: &mut Session| session.on_devices_stopped(result));
        });
        if inline {
            self.on_devices_stopped(Ok(()));
        }
    }

    fn on_devices_stopped(&mut self, result: AppResult<()>) {
        self.coordinator.on_stopped();
        let mut error = result.err();
        let message = error.as_ref().map(ToString::to_string);
        if let Some(message) = &message {
            error!("teardown finished with errors: {}", message);
            self.emit(SessionEvent::Error(message.clone()));
        }
        self.set_app_state(AppState::Clear);
        for waiter in self.stop_waiters.drain(..) {
            let reply = match (error.take(), &message) {
                (Some(e), _) => Err(e),
                (None, Some(message)) => Err(CondError::Device(message.clone())),
                (None, None) => Ok(()),
            };
            let _ = waiter.send(reply);
        }
    }

    // -------------------------------------------------------------------------
    // Trial machine control
    // -------------------------------------------------------------------------

    fn start_block(&mut self, block: AnimalBlock) -> AppResult<()> {
        if !self.coordinator.is_activated() {
            return Err(CondError::InvalidState("devices are not active".to_string()));
        }
        if !matches!(self.app_state, AppState::Running | AppState::Error) {
            return Err(CondError::InvalidState(format!(
                "cannot start a block while {:?}",
                self.app_state
            )));
        }
        if let Some(animal_id) = self.machine.animal_id() {
            return Err(CondError::InvalidState(format!(
                "block for animal {} is still running",
                animal_id
            )));
        }
        let result = self.with_machine(|machine, env| {
            // a block start is also the operator's retry after an error
            machine.resume(env)?;
            machine.start_block(env, block)
        });
        match result {
            Ok(()) => {
                self.set_app_state(AppState::Running);
                Ok(())
            }
            Err(e) => {
                self.session_error(&e);
                Err(e)
            }
        }
    }

    fn pause(&mut self) -> AppResult<()> {
        if !self.coordinator.can_pause() {
            return Err(CondError::InvalidState(
                "cannot pause while devices are starting".to_string(),
            ));
        }
        if !matches!(self.app_state, AppState::Running | AppState::Paused | AppState::Error) {
            return Err(CondError::InvalidState(format!("nothing to pause while {:?}", self.app_state)));
        }
        self.machine.pause();
        if self.app_state == AppState::Running {
            self.set_app_state(AppState::Paused);
        }
        Ok(())
    }

    fn resume(&mut self) -> AppResult<()> {
        if !matches!(self.app_state, AppState::Paused | AppState::Error | AppState::Running) {
            return Err(CondError::InvalidState(format!("nothing to resume while {:?}", self.app_state)));
        }
        match self.coordinator.resume() {
            Ok(true) => {
                self.emit(SessionEvent::DevicesStarted);
                self.with_machine(|machine, env| machine.on_devices_ready(env));
            }
            Ok(false) => {}
            Err(e) => {
                self.session_error(&e);
                return Err(e);
            }
        }
        self.set_app_state(AppState::Running);
        if let Err(e) = self.with_machine(|machine, env| machine.resume(env)) {
            self.session_error(&e);
            return Err(e);
        }
        Ok(())
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            app_state: self.app_state,
            devices: self.coordinator.state(),
            phase: self.machine.phase(),
            paused: self.machine.is_paused(),
            animal_id: self.machine.animal_id().map(str::to_string),
            class: self.machine.class(),
            trial: self.machine.current_trial(),
        }
    }

    fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        if self.app_state != AppState::Clear || self.coordinator.state() != CoordinatorState::Idle {
            self.stop_devices();
        }
    }

    fn finish_shutdown(&mut self) {
        if let Err(e) = self.machine.close_log() {
            warn!("could not close trial log: {}", e);
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// Client side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Spawns the session task.
    pub fn spawn(
        settings: Settings,
        factory: Arc<dyn DeviceFactory>,
        encoders: Arc<dyn EncoderFactory>,
    ) -> (Self, JoinHandle<()>) {
        let (session, queue) = Session::new(Arc::new(settings), factory, encoders);
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = Self {
            tx,
            events: session.events.clone(),
        };
        let task = tokio::spawn(session.run(rx, queue));
        (handle, task)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, (command, rx): (SessionCommand, oneshot::Receiver<T>)) -> AppResult<T> {
        self.tx.send(command).await.map_err(|_| CondError::SessionClosed)?;
        rx.await.map_err(|_| CondError::SessionClosed)
    }

    /// Starts the devices; see [`SessionCommand::Start`].
    pub async fn start(&self) -> AppResult<CoordinatorState> {
        self.request(SessionCommand::start()).await?
    }

    /// Starts the devices and waits until they are activated.
    pub async fn start_and_wait(&self) -> AppResult<()> {
        let mut events = self.subscribe();
        if self.start().await? == CoordinatorState::Activated {
            return Ok(());
        }
        loop {
            match events.recv().await {
                Ok(SessionEvent::DevicesStarted) => return Ok(()),
                Ok(SessionEvent::Error(message)) => return Err(CondError::Device(message)),
                Ok(SessionEvent::AppState(AppState::Clear)) => {
                    return Err(CondError::InvalidState("session stopped before devices started".to_string()))
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("missed {} session events", n),
                Err(broadcast::error::RecvError::Closed) => return Err(CondError::SessionClosed),
            }
        }
    }

    pub async fn start_block(&self, block: AnimalBlock) -> AppResult<()> {
        self.request(SessionCommand::start_block(block)).await?
    }

    /// Runs a block to completion and returns its trial records.
    pub async fn run_block(&self, block: AnimalBlock) -> AppResult<Vec<TrialLog>> {
        let mut events = self.subscribe();
        self.start_block(block).await?;
        let mut trials = Vec::new();
        loop {
            match events.recv().await {
                Ok(SessionEvent::TrialCompleted(log)) => trials.push(log),
                Ok(SessionEvent::BlockFinished { .. }) => return Ok(trials),
                Ok(SessionEvent::Error(message)) => {
                    return Err(CondError::InvalidState(format!("block failed: {}", message)))
                }
                Ok(SessionEvent::AppState(AppState::Stopping)) => {
                    return Err(CondError::InvalidState("session stopped during the block".to_string()))
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("missed {} session events", n),
                Err(broadcast::error::RecvError::Closed) => return Err(CondError::SessionClosed),
            }
        }
    }

    pub async fn pause(&self) -> AppResult<()> {
        self.request(SessionCommand::pause()).await?
    }

    pub async fn resume(&self) -> AppResult<()> {
        self.request(SessionCommand::resume()).await?
    }

    /// Tears the devices down; resolves once the session is clear.
    pub async fn stop(&self) -> AppResult<()> {
        self.request(SessionCommand::stop()).await?
    }

    pub async fn status(&self) -> AppResult<SessionStatus> {
        self.request(SessionCommand::status()).await
    }

    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(SessionCommand::shutdown()).await
    }
}
