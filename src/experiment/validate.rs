//! Pre-block configuration checks.
//!
//! [`validate`] turns the loaded settings into a [`ValidatedConfig`] or
//! fails with a configuration error before any valve moves.

use std::collections::BTreeMap;

use crate::config::Settings;
use crate::core::AnimalBlock;
use crate::error::{AppResult, CondError};
use crate::experiment::odors::{read_odors, ValveRoles};
use crate::experiment::protocol::ProtocolClass;
use crate::experiment::timing::TimingProfile;

/// Settings checked and resolved for running blocks.
#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    pub odor_names: Vec<String>,
    pub roles: ValveRoles,
    pub timing: TimingProfile,
    /// Parsed class table: animal id -> class per day.
    pub classes: BTreeMap<String, Vec<ProtocolClass>>,
}

impl ValidatedConfig {
    /// Class of `block`: the entry for the block's day, clamped to the last
    /// configured entry.
    pub fn class_for(&self, settings: &Settings, block: &AnimalBlock) -> AppResult<ProtocolClass> {
        let classes = self.classes.get(&block.animal_id).ok_or_else(|| {
            CondError::Configuration(format!("animal {} has no protocol class", block.animal_id))
        })?;
        let day = settings
            .animal
            .days
            .iter()
            .position(|d| *d == block.day)
            .unwrap_or(0);
        classes
            .get(day)
            .or_else(|| classes.last())
            .copied()
            .ok_or_else(|| CondError::Configuration(format!("animal {} has an empty class list", block.animal_id)))
    }
}

fn check_duration(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(CondError::Configuration(format!(
            "{} must be a non-negative number, got {}",
            name, value
        )))
    }
}

pub fn validate(settings: &Settings) -> AppResult<ValidatedConfig> {
    let odor = &settings.odor;
    let num_lines = odor.num_lines();
    let odor_names = read_odors(&settings.resolve_path(&odor.odor_list_path), num_lines)?;

    let mut classes = BTreeMap::new();
    for (animal, names) in &settings.animal.animal_cls {
        let parsed = names
            .iter()
            .map(|n| n.parse::<ProtocolClass>())
            .collect::<AppResult<Vec<_>>>()?;
        classes.insert(animal.clone(), parsed);
    }

    let trial = &settings.trial;
    let timing = TimingProfile::from_settings(trial, &settings.video)?;
    check_duration("shock_duration", trial.shock_duration)?;
    check_duration("valve_rand_min", odor.valve_rand_min)?;
    check_duration("valve_rand_max", odor.valve_rand_max)?;
    if classes.values().flatten().any(|c| c.delivers_shock()) && trial.shock_duration <= 0.0 {
        return Err(CondError::Configuration(
            "shock_duration must be positive when a shock class is configured".to_string(),
        ));
    }
    if trial.shock_duration > trial.trial_duration {
        return Err(CondError::Configuration(format!(
            "shock_duration ({}) exceeds trial_duration ({})",
            trial.shock_duration, trial.trial_duration
        )));
    }
    if odor.valve_rand_min > odor.valve_rand_max {
        return Err(CondError::Configuration(
            "valve_rand_min exceeds valve_rand_max".to_string(),
        ));
    }
    for class in classes.values().flatten() {
        let (min, max) = trial.iti_bounds(*class)?;
        check_duration(&format!("iti_min[{}]", class), min)?;
        check_duration(&format!("iti_max[{}]", class), max)?;
        if min > max {
            return Err(CondError::Configuration(format!(
                "iti_min ({}) exceeds iti_max ({}) for {}",
                min, max, class
            )));
        }
    }
    let psd_trials = trial.trials_for(ProtocolClass::PsdTrain);
    if trial.num_shock_trials > psd_trials {
        return Err(CondError::Configuration(format!(
            "num_shock_trials ({}) exceeds the {} PsdTrain trials",
            trial.num_shock_trials, psd_trials
        )));
    }

    let roles = ValveRoles::resolve(odor)?;
    Ok(ValidatedConfig {
        odor_names,
        roles,
        timing,
        classes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> (tempfile::TempDir, Settings) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("odor_list.txt"), "2,Vanilla\n").unwrap();
        let mut settings = Settings::default();
        settings.application.data_dir = dir.path().to_path_buf();
        (dir, settings)
    }

    #[test]
    fn test_defaults_validate() {
        let (_dir, s) = settings();
        let config = validate(&s).unwrap();
        assert_eq!(config.odor_names.len(), 8);
        assert_eq!(config.odor_names[2], "Vanilla");
        assert_eq!(config.classes["10"], vec![ProtocolClass::StdTrain]);
    }

    #[test]
    fn test_unknown_class_rejected() {
        let (_dir, mut s) = settings();
        s.animal.animal_cls.insert("2".into(), vec!["OdorOnly".into(), "Shockless".into()]);
        let err = validate(&s).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("Shockless"));
    }

    #[test]
    fn test_shock_longer_than_trial_rejected() {
        let (_dir, mut s) = settings();
        s.trial.shock_duration = 4.0;
        assert!(validate(&s).unwrap_err().is_config());
    }

    #[test]
    fn test_iti_bounds_checked() {
        let (_dir, mut s) = settings();
        s.trial.iti_min.insert(ProtocolClass::StdTrain, 200.0);
        assert!(validate(&s).unwrap_err().is_config());
    }

    #[test]
    fn test_class_lookup_by_day() {
        let (_dir, mut s) = settings();
        s.animal.days = vec!["hab".into(), "train".into(), "test".into()];
        s.animal
            .animal_cls
            .insert("4".into(), vec!["NoOdor".into(), "PsdTrain".into()]);
        let config = validate(&s).unwrap();

        let block = AnimalBlock::new("4").with_day("train");
        assert_eq!(config.class_for(&s, &block).unwrap(), ProtocolClass::PsdTrain);
        let clamped = AnimalBlock::new("4").with_day("test");
        assert_eq!(config.class_for(&s, &clamped).unwrap(), ProtocolClass::PsdTrain);
        assert!(config.class_for(&s, &AnimalBlock::new("99")).unwrap_err().is_config());
    }

    #[test]
    fn test_missing_odor_list_rejected() {
        let (_dir, mut s) = settings();
        s.application.data_dir = std::path::PathBuf::from("/nonexistent/dir");
        let err = validate(&s).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_zero_shock_rejected_for_shock_classes() {
        let (_dir, mut s) = settings();
        s.trial.shock_duration = 0.0;
        assert!(validate(&s).unwrap_err().is_config());

        s.animal.animal_cls.clear();
        s.animal.animal_cls.insert("3".into(), vec!["OdorOnly".into(), "NoOdor".into()]);
        assert!(validate(&s).is_ok());
    }
}
