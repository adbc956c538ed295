//! Trial state machine.
//!
//! Drives one block through its phases:
//!
//! ```text
//! Ready -> Pre-hab -> [ Pre -> Trial -> Post -> ITI ]* -> Post-hab -> Done -> Ready
//! ```
//!
//! No ITI follows the last trial. Every transition is a [`Step`] delivered
//! by a timer on the primary context. While paused, arriving steps are held
//! and replayed in order on resume, so pausing takes effect at the next
//! phase boundary.
//!
//! Within a trial, odor (odor valve + NO valve) goes high at trial start and
//! low at trial end. The shock is switched on for the final
//! `shock_duration` seconds and co-terminates with the odor.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::core::{AnimalBlock, Phase, TrialLog};
use crate::error::{AppResult, CondError};
use crate::experiment::protocol::{ProtocolClass, Stimulus, StimulusSelector};
use crate::experiment::rand_valves::{next_delay, RandValves};
use crate::experiment::trial_log::{log_filename, TrialLogFile};
use crate::experiment::validate::{validate, ValidatedConfig};
use crate::hardware::{DeviceSet, SHOCKER_CHANNEL};
use crate::messages::SessionEvent;
use crate::recording::{prepare_writers, EncoderFactory, FrameRouter, PlannedCamera, WriterPlan, WriterSet};
use crate::scheduler::{PrimaryHandle, TimerId, Timers};
use crate::session::Session;

/// Transitions of the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Rotate writers and start recording ahead of the trial.
    PreRecord(usize),
    /// Draw the stimulus and open the odor valves.
    TrialStart(usize),
    /// Switch the shock on for the tail of the trial.
    ShockOn(usize),
    /// Close valves and shock together.
    TrialEnd(usize),
    /// Stop recording, log the trial, then ITI or post-hab.
    PostRecordEnd(usize),
    PostHab,
    Done,
    /// Background valve rotation.
    RandTick,
}

/// Session components the machine works through. Borrowed per step.
pub struct MachineEnv<'a> {
    pub settings: &'a Settings,
    pub devices: Option<&'a DeviceSet>,
    pub timers: &'a mut Timers<Session>,
    pub router: &'a Arc<FrameRouter>,
    pub events: &'a broadcast::Sender<SessionEvent>,
    pub primary: &'a PrimaryHandle<Session>,
    pub encoders: &'a Arc<dyn EncoderFactory>,
}

impl<'a> MachineEnv<'a> {
    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn schedule(&mut self, seconds: f64, step: Step) -> TimerId {
        let delay = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO);
        self.timers
            .schedule_once(delay, move |session: &mut Session| session.machine_step(step))
    }

    fn devices(&self) -> AppResult<&'a DeviceSet> {
        self.devices
            .ok_or_else(|| CondError::InvalidState("devices are not started".to_string()))
    }
}

/// State of the block being run.
struct BlockRun {
    id: u64,
    block: AnimalBlock,
    class: ProtocolClass,
    config: ValidatedConfig,
    selector: StimulusSelector,
    num_trials: usize,
    started: Instant,
    current: Option<usize>,
    stimulus: Stimulus,
    entry: Option<TrialLog>,
    writers_ready: bool,
    waiting_for_writers: Option<usize>,
    rand: RandValves,
    rand_timer: Option<TimerId>,
}

/// Phase sequencer for one block at a time, driven by [`Step`]s.
pub struct TrialMachine {
    phase: Phase,
    paused: bool,
    held: VecDeque<Step>,
    run: Option<BlockRun>,
    next_id: u64,
    trial_log: TrialLogFile,
    rng: StdRng,
}

impl Default for TrialMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TrialMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Init,
            paused: false,
            held: VecDeque::new(),
            run: None,
            next_id: 0,
            trial_log: TrialLogFile::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn animal_id(&self) -> Option<&str> {
        self.run.as_ref().map(|r| r.block.animal_id.as_str())
    }

    pub fn class(&self) -> Option<ProtocolClass> {
        self.run.as_ref().map(|r| r.class)
    }

    pub fn current_trial(&self) -> Option<usize> {
        self.run.as_ref().and_then(|r| r.current)
    }

    fn enter(&mut self, env: &MachineEnv<'_>, phase: Phase) {
        self.phase = phase;
        debug!("phase {}", phase);
        env.emit(SessionEvent::Phase(phase));
    }

    /// Devices are up: the machine can accept blocks.
    pub fn on_devices_ready(&mut self, env: &MachineEnv<'_>) {
        if self.phase == Phase::Init {
            self.enter(env, Phase::Ready);
        }
    }

    /// Validates the configuration and starts a block for `block`.
    pub fn start_block(&mut self, env: &mut MachineEnv<'_>, block: AnimalBlock) -> AppResult<()> {
        if self.phase != Phase::Ready || self.run.is_some() {
            return Err(CondError::InvalidState(format!(
                "a block can only start when ready, machine is in {}",
                self.phase
            )));
        }
        let settings = env.settings;
        let config = validate(settings)?;
        env.emit(SessionEvent::OdorNames(config.odor_names.clone()));
        env.emit(SessionEvent::ValveRoles(config.roles.clone()));
        env.emit(SessionEvent::Timeline {
            normalized: config.timing.normalized(),
            profile: config.timing.clone(),
        });

        let class = config.class_for(settings, &block)?;
        let num_trials = settings.trial.trials_for(class) as usize;
        let selector = StimulusSelector::new(class, num_trials as u32, settings.trial.num_shock_trials)?;

        let filename = log_filename(&settings.experiment.log_filename, &block.animal_id)?;
        let log_path = (!filename.is_empty()).then(|| settings.resolve_path(Path::new(&filename)));
        self.trial_log.rotate(log_path)?;

        let id = self.next_id;
        self.next_id += 1;
        let rand = RandValves::new(&config.roles.rand_valves);
        let mut run = BlockRun {
            id,
            block,
            class,
            config,
            selector,
            num_trials,
            started: Instant::now(),
            current: None,
            stimulus: Stimulus::default(),
            entry: None,
            writers_ready: true,
            waiting_for_writers: None,
            rand,
            rand_timer: None,
        };
        Self::prepare_block_writers(env, &mut run)?;
        info!(
            "block started: animal {} ({}), {} trials",
            run.block.animal_id, class, num_trials
        );
        env.emit(SessionEvent::BlockStarted {
            animal_id: run.block.animal_id.clone(),
            class,
            num_trials,
        });

        if !run.rand.is_empty() {
            let delay = next_delay(&mut self.rng, settings.odor.valve_rand_min, settings.odor.valve_rand_max);
            run.rand_timer = Some(env.schedule(delay.as_secs_f64(), Step::RandTick));
        }
        let first = if num_trials > 0 { Step::PreRecord(0) } else { Step::PostHab };
        self.run = Some(run);
        self.enter(env, Phase::PreHab);
        env.schedule(settings.trial.prehab, first);
        Ok(())
    }

    /// Installs empty writer sets when nothing records, otherwise builds the
    /// real ones in the background and gates the first pre-record on them.
    fn prepare_block_writers(env: &mut MachineEnv<'_>, run: &mut BlockRun) -> AppResult<()> {
        let devices = env.devices()?;
        let video = &env.settings.video;
        let cameras: Vec<PlannedCamera> = devices
            .cameras
            .iter()
            .enumerate()
            .map(|(i, cam)| PlannedCamera {
                source: cam.source.clone(),
                name: video.port_name(i),
                record: video.records(i),
            })
            .collect();

        if run.num_trials == 0 || !cameras.iter().any(|c| c.record) {
            let empty: Vec<WriterSet> = (0..run.num_trials)
                .map(|_| (0..cameras.len()).map(|_| None).collect())
                .collect();
            env.router.install_trial_writers(empty);
            return Ok(());
        }

        let plan = WriterPlan {
            template: video.video_filename.clone(),
            output_dir: env.settings.resolve_path(&video.output_dir),
            block: run.block.clone(),
            num_trials: run.num_trials,
            cameras,
            frame_wait: Duration::from_millis(video.frame_wait_timeout_ms),
        };
        run.writers_ready = false;
        let id = run.id;
        let encoders = env.encoders.clone();
        let primary = env.primary.clone();
        tokio::spawn(async move {
            let result = prepare_writers(plan, encoders).await;
            primary.run_on_primary(move |session: &mut Session| session.on_writers_ready(id, result));
        });
        Ok(())
    }

    /// Background writer preparation finished.
    pub fn on_writers_ready(
        &mut self,
        env: &mut MachineEnv<'_>,
        id: u64,
        result: AppResult<Vec<WriterSet>>,
    ) -> AppResult<()> {
        let Some(run) = self.run.as_mut().filter(|r| r.id == id) else {
            // block already over; dropping the sets closes their streams
            debug!("discarding writers of finished block {}", id);
            return Ok(());
        };
        let sets = result?;
        env.router.install_trial_writers(sets);
        run.writers_ready = true;
        if let Some(trial) = run.waiting_for_writers.take() {
            info!("writers ready, continuing with trial {}", trial);
            return self.advance(env, Step::PreRecord(trial));
        }
        Ok(())
    }

    /// Runs a step, or holds it while paused.
    ///
    /// A step that fails inside a block is held again at the front of the
    /// queue and the machine pauses, so the next resume retries that step.
    pub fn advance(&mut self, env: &mut MachineEnv<'_>, step: Step) -> AppResult<()> {
        if self.run.is_none() {
            debug!("ignoring {:?} outside a block", step);
            return Ok(());
        }
        if self.paused {
            debug!("holding {:?} while paused", step);
            self.held.push_back(step);
            return Ok(());
        }
        let result = self.run_step(env, step);
        if result.is_err() && self.run.is_some() {
            warn!("{:?} failed in {}, held for retry", step, self.phase);
            self.held.push_front(step);
            self.paused = true;
        }
        result
    }

    fn run_step(&mut self, env: &mut MachineEnv<'_>, step: Step) -> AppResult<()> {
        match step {
            Step::PreRecord(trial) => self.pre_record(env, trial),
            Step::TrialStart(trial) => self.trial_start(env, trial),
            Step::ShockOn(trial) => {
                if self.phase == Phase::Trial && self.current_trial() == Some(trial) {
                    self.set_shock(env, true)?;
                }
                Ok(())
            }
            Step::TrialEnd(trial) => self.trial_end(env, trial),
            Step::PostRecordEnd(trial) => self.post_record_end(env, trial),
            Step::PostHab => {
                self.enter(env, Phase::PostHab);
                env.schedule(env.settings.trial.posthab, Step::Done);
                Ok(())
            }
            Step::Done => self.finish_block(env),
            Step::RandTick => self.rand_tick(env),
        }
    }

    fn pre_record(&mut self, env: &mut MachineEnv<'_>, trial: usize) -> AppResult<()> {
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        if !run.writers_ready {
            info!("waiting for writers before trial {}", trial);
            run.waiting_for_writers = Some(trial);
            return Ok(());
        }
        env.router.set_trial_writers(trial)?;
        run.current = Some(trial);
        self.enter(env, Phase::PreRecord);
        env.schedule(env.settings.video.pre_record, Step::TrialStart(trial));
        Ok(())
    }

    /// Picks the trial's stimulus and starts a fresh log entry. A retried
    /// trial keeps the stimulus it already drew.
    fn pre_trial(&mut self, trial: usize) -> Option<Stimulus> {
        let run = self.run.as_mut()?;
        if run.entry.as_ref().is_some_and(|e| e.trial == trial) {
            return Some(run.stimulus);
        }
        let stimulus = run.selector.next(&mut self.rng);
        let mut entry = TrialLog::new(trial, run.started.elapsed().as_secs_f64());
        entry.odor = stimulus.odor;
        entry.shock = stimulus.shock;
        run.stimulus = stimulus;
        run.entry = Some(entry);
        Some(stimulus)
    }

    fn trial_start(&mut self, env: &mut MachineEnv<'_>, trial: usize) -> AppResult<()> {
        let Some(stimulus) = self.pre_trial(trial) else {
            return Ok(());
        };
        env.emit(SessionEvent::TrialLabel(format!("Trial ({})", trial + 1)));
        self.enter(env, Phase::Trial);
        info!("trial {}: odor={} shock={}", trial, stimulus.odor, stimulus.shock);
        self.set_odor(env, true)?;

        let trial_settings = &env.settings.trial;
        let (duration, shock_at) = (
            trial_settings.trial_duration,
            trial_settings.trial_duration - trial_settings.shock_duration,
        );
        if stimulus.shock {
            if shock_at <= 0.0 {
                self.set_shock(env, true)?;
            } else {
                env.schedule(shock_at, Step::ShockOn(trial));
            }
        }
        env.schedule(duration, Step::TrialEnd(trial));
        Ok(())
    }

    fn trial_end(&mut self, env: &mut MachineEnv<'_>, trial: usize) -> AppResult<()> {
        self.set_shock(env, false)?;
        self.set_odor(env, false)?;
        self.enter(env, Phase::PostRecord);
        env.schedule(env.settings.video.post_record, Step::PostRecordEnd(trial));
        Ok(())
    }

    fn post_record_end(&mut self, env: &mut MachineEnv<'_>, trial: usize) -> AppResult<()> {
        env.router.reset_trial_writers();
        self.post_trial(env)?;

        let Some(run) = self.run.as_ref() else {
            return Ok(());
        };
        if trial + 1 < run.num_trials {
            let (min, max) = env.settings.trial.iti_bounds(run.class)?;
            let iti = if max > min { self.rng.gen_range(min..=max) } else { min };
            debug!("ITI of {:.2}s before trial {}", iti, trial + 1);
            self.enter(env, Phase::Iti);
            env.schedule(iti, Step::PreRecord(trial + 1));
            Ok(())
        } else {
            self.advance(env, Step::PostHab)
        }
    }

    /// Appends the finished trial to the log and announces it.
    fn post_trial(&mut self, env: &MachineEnv<'_>) -> AppResult<()> {
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        let Some(entry) = run.entry.as_ref() else {
            return Ok(());
        };
        self.trial_log.append(&run.block.animal_id, entry)?;
        if let Some(entry) = run.entry.take() {
            env.emit(SessionEvent::TrialCompleted(entry));
        }
        Ok(())
    }

    fn finish_block(&mut self, env: &mut MachineEnv<'_>) -> AppResult<()> {
        self.enter(env, Phase::Done);
        let result = self.stop_rand_valves(env);
        if let Some(run) = self.run.take() {
            let (odor, shock) = run.selector.counts();
            info!(
                "block finished: animal {}, {} odor and {} shock trials",
                run.block.animal_id, odor, shock
            );
            env.emit(SessionEvent::BlockFinished {
                animal_id: run.block.animal_id,
            });
        }
        self.enter(env, Phase::Ready);
        result
    }

    /// Drives the odor valve pair. No-op when the trial has no odor.
    pub fn set_odor(&self, env: &MachineEnv<'_>, on: bool) -> AppResult<()> {
        let Some(run) = self.run.as_ref().filter(|r| r.stimulus.odor) else {
            return Ok(());
        };
        let lines = run.config.roles.odor_lines();
        let names: Vec<&str> = lines.iter().map(String::as_str).collect();
        let odors = &env.devices()?.odors;
        let result = if on {
            odors.set_state(&names, &[])
        } else {
            odors.set_state(&[], &names)
        };
        result.map_err(|e| CondError::device(odors.name(), format!("{:#}", e)))
    }

    /// Drives the shock line. No-op when the trial has no shock.
    pub fn set_shock(&self, env: &MachineEnv<'_>, on: bool) -> AppResult<()> {
        if !self.run.as_ref().is_some_and(|r| r.stimulus.shock) {
            return Ok(());
        }
        let shocker = &env.devices()?.shocker;
        let result = if on {
            shocker.set_state(&[SHOCKER_CHANNEL], &[])
        } else {
            shocker.set_state(&[], &[SHOCKER_CHANNEL])
        };
        result.map_err(|e| CondError::device(shocker.name(), format!("{:#}", e)))
    }

    fn apply_rand_valves(env: &MachineEnv<'_>, valves: &RandValves) -> AppResult<()> {
        let (high, low) = valves.line_states();
        let high: Vec<&str> = high.iter().map(String::as_str).collect();
        let low: Vec<&str> = low.iter().map(String::as_str).collect();
        let odors = &env.devices()?.odors;
        odors
            .set_state(&high, &low)
            .map_err(|e| CondError::device(odors.name(), format!("{:#}", e)))
    }

    fn rand_tick(&mut self, env: &mut MachineEnv<'_>) -> AppResult<()> {
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        run.rand.rotate(&mut self.rng);
        Self::apply_rand_valves(env, &run.rand)?;
        let odor = &env.settings.odor;
        let delay = next_delay(&mut self.rng, odor.valve_rand_min, odor.valve_rand_max);
        run.rand_timer = Some(env.schedule(delay.as_secs_f64(), Step::RandTick));
        Ok(())
    }

    fn stop_rand_valves(&mut self, env: &mut MachineEnv<'_>) -> AppResult<()> {
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        if let Some(timer) = run.rand_timer.take() {
            env.timers.cancel(timer);
        }
        if run.rand.is_empty() {
            return Ok(());
        }
        run.rand.reset();
        Self::apply_rand_valves(env, &run.rand)
    }

    pub fn pause(&mut self) {
        if !self.paused {
            info!("trial machine paused in {}", self.phase);
        }
        self.paused = true;
    }

    /// Clears the pause and replays held steps in arrival order.
    pub fn resume(&mut self, env: &mut MachineEnv<'_>) -> AppResult<()> {
        if !self.paused {
            return Ok(());
        }
        self.paused = false;
        info!("trial machine resumed, {} held steps", self.held.len());
        while let Some(step) = self.held.pop_front() {
            self.advance(env, step)?;
            if self.paused {
                break;
            }
        }
        Ok(())
    }

    /// Abandons the running block: outputs low, writers dropped, state reset.
    /// Output failures are logged, not returned, so teardown always proceeds.
    pub fn abort(&mut self, env: &mut MachineEnv<'_>) {
        if self.run.is_some() {
            for result in [self.set_shock(env, false), self.set_odor(env, false), self.stop_rand_valves(env)] {
                if let Err(e) = result {
                    warn!("while aborting block: {}", e);
                }
            }
            if let Some(run) = self.run.take() {
                info!("block for animal {} aborted", run.block.animal_id);
            }
        }
        self.held.clear();
        self.paused = false;
        self.phase = Phase::Init;
        env.emit(SessionEvent::Phase(Phase::Init));
    }

    /// Closes the trial log, e.g. when the session ends.
    pub fn close_log(&mut self) -> AppResult<()> {
        self.trial_log.close()
    }
}
