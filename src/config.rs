//! Configuration system using Figment
//!
//! Settings are resolved from, in increasing priority:
//! 1. built-in defaults (the values the rig has always shipped with)
//! 2. an optional TOML file
//! 3. environment variables prefixed with `SOCK_COND_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! SOCK_COND_APPLICATION__SIMULATE=false
//! SOCK_COND_TRIAL__PREHAB=30
//! SOCK_COND_EXPERIMENT__LOG_FILENAME="rat{animal}_%Y%m%d.csv"
//! ```
//!
//! Loading only checks types. Semantic checks (known protocol classes, valve
//! indices, durations) happen in [`crate::experiment::validate`] right before a
//! block starts, so an operator can fix the file and retry without restarting.

use crate::error::{AppResult, CondError};
use crate::experiment::protocol::ProtocolClass;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Number of odor lines driven by one serializer board.
pub const LINES_PER_BOARD: usize = 8;

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub trial: TrialSettings,
    pub odor: OdorSettings,
    pub video: VideoSettings,
    pub animal: AnimalSettings,
    pub experiment: ExperimentSettings,
    pub hardware: HardwareSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Use simulated devices instead of hardware.
    pub simulate: bool,
    /// Base directory for relative paths (odor list, logs, videos).
    pub data_dir: PathBuf,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "Shock Conditioning".to_string(),
            log_level: "info".to_string(),
            simulate: true,
            data_dir: PathBuf::from("."),
        }
    }
}

/// Trial timing and per-class trial counts. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialSettings {
    pub num_trials: BTreeMap<ProtocolClass, u32>,
    pub num_shock_trials: u32,
    pub trial_duration: f64,
    pub shock_duration: f64,
    pub iti_min: BTreeMap<ProtocolClass, f64>,
    pub iti_max: BTreeMap<ProtocolClass, f64>,
    pub prehab: f64,
    pub posthab: f64,
}

impl Default for TrialSettings {
    fn default() -> Self {
        use ProtocolClass::*;
        Self {
            num_trials: BTreeMap::from([(StdTrain, 10), (PsdTrain, 20), (OdorOnly, 10), (NoOdor, 10)]),
            num_shock_trials: 1,
            trial_duration: 3.0,
            shock_duration: 1.0,
            iti_min: BTreeMap::from([
                (StdTrain, 50.0),
                (PsdTrain, 106.0),
                (OdorOnly, 50.0),
                (NoOdor, 50.0),
            ]),
            iti_max: BTreeMap::from([
                (StdTrain, 120.0),
                (PsdTrain, 136.0),
                (OdorOnly, 110.0),
                (NoOdor, 110.0),
            ]),
            prehab: 10.0,
            posthab: 10.0,
        }
    }
}

impl TrialSettings {
    /// Trials in a block of `class`; classes missing from the table run none.
    pub fn trials_for(&self, class: ProtocolClass) -> u32 {
        self.num_trials.get(&class).copied().unwrap_or(0)
    }

    /// ITI bounds for `class`.
    pub fn iti_bounds(&self, class: ProtocolClass) -> AppResult<(f64, f64)> {
        let min = self.iti_min.get(&class).copied().ok_or_else(|| {
            CondError::Configuration(format!("iti_min has no entry for {}", class))
        })?;
        let max = self.iti_max.get(&class).copied().ok_or_else(|| {
            CondError::Configuration(format!("iti_max has no entry for {}", class))
        })?;
        Ok((min, max))
    }

    /// Longest configured ITI, used to size the timeline.
    pub fn longest_iti(&self) -> f64 {
        self.iti_max.values().copied().fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OdorSettings {
    pub odor_valve: String,
    pub no_valve: String,
    /// CSV of `index,name` rows overlaying the default `p{i}` names.
    pub odor_list_path: PathBuf,
    /// Groups of valves that switch together in the background rotation.
    pub rand_valves: Vec<Vec<String>>,
    pub valve_rand_min: f64,
    pub valve_rand_max: f64,
    pub num_boards: usize,
}

impl Default for OdorSettings {
    fn default() -> Self {
        Self {
            odor_valve: "p1".to_string(),
            no_valve: "p0".to_string(),
            odor_list_path: PathBuf::from("odor_list.txt"),
            rand_valves: Vec::new(),
            valve_rand_min: 0.4,
            valve_rand_max: 0.8,
            num_boards: 1,
        }
    }
}

impl OdorSettings {
    /// Total addressable odor lines.
    pub fn num_lines(&self) -> usize {
        self.num_boards * LINES_PER_BOARD
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub ports: Vec<u32>,
    pub port_names: Vec<String>,
    pub record: Vec<bool>,
    pub img_fmt: Vec<String>,
    pub pre_record: f64,
    pub post_record: f64,
    pub video_filename: String,
    pub output_dir: PathBuf,
    pub frame_wait_timeout_ms: u64,
    pub sim_width: u32,
    pub sim_height: u32,
    pub sim_rate: f64,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            ports: vec![0],
            port_names: vec![String::new()],
            record: vec![false],
            img_fmt: vec!["gray".to_string()],
            pre_record: 3.0,
            post_record: 3.0,
            video_filename: "RatO1D{day}G{group}R{animal}C{cycle}Trial{trial}Cam{cam}.avi".to_string(),
            output_dir: PathBuf::from("."),
            frame_wait_timeout_ms: 5000,
            sim_width: 160,
            sim_height: 120,
            sim_rate: 30.0,
        }
    }
}

/// Per-camera lookup into a list that may be shorter than `ports`; missing
/// entries repeat the last one.
fn autofill<'a, T>(values: &'a [T], idx: usize) -> Option<&'a T> {
    values.get(idx).or_else(|| values.last())
}

impl VideoSettings {
    pub fn num_cameras(&self) -> usize {
        self.ports.len()
    }

    pub fn port_name(&self, idx: usize) -> String {
        match autofill(&self.port_names, idx) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => idx.to_string(),
        }
    }

    pub fn records(&self, idx: usize) -> bool {
        autofill(&self.record, idx).copied().unwrap_or(false)
    }

    pub fn pixel_format(&self, idx: usize) -> AppResult<crate::core::PixelFormat> {
        autofill(&self.img_fmt, idx)
            .map(String::as_str)
            .unwrap_or("gray")
            .parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimalSettings {
    /// Animal id -> protocol class names, one per entry of `days`.
    pub animal_cls: BTreeMap<String, Vec<String>>,
    pub days: Vec<String>,
    pub cycles: Vec<u32>,
    pub groups: Vec<String>,
}

impl Default for AnimalSettings {
    fn default() -> Self {
        Self {
            animal_cls: BTreeMap::from([("10".to_string(), vec!["StdTrain".to_string()])]),
            days: vec!["hab".to_string()],
            cycles: vec![0],
            groups: vec![String::new()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentSettings {
    /// strftime pattern with an `{animal}` placeholder; empty disables the trial log.
    pub log_filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSettings {
    pub odor_port: String,
    pub pin_port: String,
    pub baud_rate: u32,
    pub shocker_pin: u8,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        Self {
            odor_port: String::new(),
            pin_port: String::new(),
            baud_rate: 9600,
            shocker_pin: 0,
        }
    }
}

impl Settings {
    /// Loads settings from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(CondError::Configuration(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("SOCK_COND_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Resolves `path` against `application.data_dir` unless it is absolute.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.application.data_dir.join(path)
        }
    }
}

#[allow(clippy::expect_used)]
fn valve_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^p([0-9]+)$").expect("valve name pattern compiles"))
}

/// Parses a valve name such as `p3` into its line index, checking it against
/// the number of available lines.
pub fn parse_valve_name(name: &str, num_lines: usize) -> AppResult<usize> {
    let caps = valve_name_pattern().captures(name).ok_or_else(|| {
        CondError::Configuration(format!("{} does not match the valve name pattern", name))
    })?;
    let idx: usize = caps[1]
        .parse()
        .map_err(|_| CondError::Configuration(format!("{} is not a valid valve index", name)))?;
    if idx >= num_lines {
        return Err(CondError::Configuration(format!(
            "valve {} is out of bounds for {} lines",
            name, num_lines
        )));
    }
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_rig() {
        let settings = Settings::default();
        assert_eq!(settings.trial.trials_for(ProtocolClass::PsdTrain), 20);
        assert_eq!(settings.trial.iti_bounds(ProtocolClass::PsdTrain).unwrap(), (106.0, 136.0));
        assert_eq!(settings.trial.longest_iti(), 136.0);
        assert_eq!(settings.odor.num_lines(), 8);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conditioning.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[application]
simulate = false

[trial]
num_trials = {{ StdTrain = 1 }}
prehab = 2.5

[animal]
animal_cls = {{ "1" = ["StdTrain"] }}

[odor]
rand_valves = [["p4", "p5"], ["p6"]]
"#
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert!(!settings.application.simulate);
        assert_eq!(settings.trial.trials_for(ProtocolClass::StdTrain), 1);
        assert_eq!(settings.trial.prehab, 2.5);
        assert_eq!(settings.animal.animal_cls["1"], vec!["StdTrain".to_string()]);
        assert_eq!(settings.odor.rand_valves.len(), 2);
        // untouched sections keep their defaults
        assert_eq!(settings.trial.posthab, 10.0);
    }

    #[test]
    fn test_rendered_config_reloads() {
        let mut settings = Settings::default();
        settings.trial.prehab = 4.0;
        settings.video.ports = vec![0, 2];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rendered.toml");
        std::fs::write(&path, toml::to_string_pretty(&settings).unwrap()).unwrap();

        let loaded = Settings::load(Some(&path)).unwrap();
        assert_eq!(loaded.trial.prehab, 4.0);
        assert_eq!(loaded.video.ports, vec![0, 2]);
        assert_eq!(loaded.trial.trials_for(ProtocolClass::PsdTrain), 20);
    }

    #[test]
    fn test_unknown_class_key_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[trial]\nnum_trials = { Bogus = 3 }\n").unwrap();
        let err = Settings::load(Some(&path)).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Settings::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_parse_valve_name() {
        assert_eq!(parse_valve_name("p3", 8).unwrap(), 3);
        assert!(parse_valve_name("p8", 8).is_err());
        assert!(parse_valve_name("valve3", 8).is_err());
        assert!(parse_valve_name("p", 8).is_err());
    }

    #[test]
    fn test_camera_lists_autofill() {
        let video = VideoSettings {
            ports: vec![0, 1, 2],
            port_names: vec!["left".into(), "right".into()],
            record: vec![true],
            ..VideoSettings::default()
        };
        assert_eq!(video.port_name(2), "right");
        assert!(video.records(2));
        assert_eq!(video.pixel_format(1).unwrap(), crate::core::PixelFormat::Gray);
    }
}
