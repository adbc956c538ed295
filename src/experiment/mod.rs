//! Experiment protocol: configuration checks, stimulus selection, timing and
//! the trial state machine that ties them to the devices.

pub mod machine;
pub mod odors;
pub mod protocol;
pub mod rand_valves;
pub mod timing;
pub mod trial_log;
pub mod validate;

pub use machine::{Step, TrialMachine};
pub use protocol::{ProtocolClass, Stimulus, StimulusSelector};
pub use timing::TimingProfile;
pub use trial_log::TrialLogFile;
pub use validate::{validate, ValidatedConfig};
