//! Protocol classes and per-trial stimulus selection.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, CondError};

/// Training protocol applied to one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolClass {
    /// Odor paired with shock on every trial.
    StdTrain,
    /// Explicitly unpaired: each trial is odor only or shock only.
    PsdTrain,
    /// Odor on every trial, never a shock.
    OdorOnly,
    /// Neither odor nor shock; the animal only sits through the timeline.
    NoOdor,
}

impl ProtocolClass {
    /// Every class, in configuration order.
    pub const ALL: [ProtocolClass; 4] = [
        ProtocolClass::StdTrain,
        ProtocolClass::PsdTrain,
        ProtocolClass::OdorOnly,
        ProtocolClass::NoOdor,
    ];

    /// Whether any trial of this class switches the shock line.
    pub fn delivers_shock(self) -> bool {
        matches!(self, ProtocolClass::StdTrain | ProtocolClass::PsdTrain)
    }

    /// Name used in configuration files and the trial log.
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolClass::StdTrain => "StdTrain",
            ProtocolClass::PsdTrain => "PsdTrain",
            ProtocolClass::OdorOnly => "OdorOnly",
            ProtocolClass::NoOdor => "NoOdor",
        }
    }
}

impl fmt::Display for ProtocolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolClass {
    type Err = CondError;

    fn from_str(s: &str) -> AppResult<Self> {
        ProtocolClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CondError::Configuration(format!("Protocol {} not recognized", s)))
    }
}

/// Stimuli delivered on one trial.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stimulus {
    pub odor: bool,
    pub shock: bool,
}

/// Picks each trial's stimulus for one block of a given class.
///
/// For `PsdTrain` every trial is either odor only or shock only. The odor
/// quota (`total - num_shock`) is checked first, then the shock cap; only
/// when neither is exhausted is a fair coin flipped.
#[derive(Clone, Debug)]
pub struct StimulusSelector {
    class: ProtocolClass,
    total: u32,
    num_shock: u32,
    odor_count: u32,
    shock_count: u32,
}

impl StimulusSelector {
    pub fn new(class: ProtocolClass, total: u32, num_shock: u32) -> AppResult<Self> {
        if class == ProtocolClass::PsdTrain && num_shock > total {
            return Err(CondError::Configuration(format!(
                "num_shock_trials ({}) exceeds the {} trials of a {} block",
                num_shock, total, class
            )));
        }
        Ok(Self {
            class,
            total,
            num_shock,
            odor_count: 0,
            shock_count: 0,
        })
    }

    pub fn class(&self) -> ProtocolClass {
        self.class
    }

    pub fn next<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Stimulus {
        let stimulus = match self.class {
            ProtocolClass::NoOdor => Stimulus::default(),
            ProtocolClass::StdTrain => Stimulus { odor: true, shock: true },
            ProtocolClass::OdorOnly => Stimulus { odor: true, shock: false },
            ProtocolClass::PsdTrain => {
                let odor_quota = self.total - self.num_shock;
                let shock = if self.odor_count >= odor_quota {
                    true
                } else if self.shock_count >= self.num_shock {
                    false
                } else {
                    rng.gen_bool(0.5)
                };
                Stimulus { odor: !shock, shock }
            }
        };
        self.odor_count += u32::from(stimulus.odor);
        self.shock_count += u32::from(stimulus.shock);
        stimulus
    }

    pub fn counts(&self) -> (u32, u32) {
        (self.odor_count, self.shock_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_class_names() {
        for class in ProtocolClass::ALL {
            assert_eq!(class.to_string().parse::<ProtocolClass>().unwrap(), class);
        }
        let err = "Bogus".parse::<ProtocolClass>().unwrap_err();
        assert_eq!(err.to_string(), "Configuration validation error: Protocol Bogus not recognized");
    }

    #[test]
    fn test_fixed_classes() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut std = StimulusSelector::new(ProtocolClass::StdTrain, 3, 1).unwrap();
        assert_eq!(std.next(&mut rng), Stimulus { odor: true, shock: true });
        let mut none = StimulusSelector::new(ProtocolClass::NoOdor, 3, 1).unwrap();
        assert_eq!(none.next(&mut rng), Stimulus::default());
        let mut odor = StimulusSelector::new(ProtocolClass::OdorOnly, 3, 1).unwrap();
        assert_eq!(odor.next(&mut rng), Stimulus { odor: true, shock: false });
    }

    #[test]
    fn test_psd_quotas_hold_for_any_seed() {
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut selector = StimulusSelector::new(ProtocolClass::PsdTrain, 10, 3).unwrap();
            for _ in 0..10 {
                let s = selector.next(&mut rng);
                assert!(s.odor != s.shock);
            }
            assert_eq!(selector.counts(), (7, 3));
        }
    }

    #[test]
    fn test_psd_forces_shock_after_odor_quota() {
        // every odor slot taken: remaining trials must shock
        let mut rng = StdRng::seed_from_u64(0);
        let mut selector = StimulusSelector::new(ProtocolClass::PsdTrain, 4, 2).unwrap();
        selector.odor_count = 2;
        assert!(selector.next(&mut rng).shock);
        assert!(selector.next(&mut rng).shock);
    }

    #[test]
    fn test_psd_rejects_excess_shocks() {
        assert!(StimulusSelector::new(ProtocolClass::PsdTrain, 2, 3).unwrap_err().is_config());
        assert!(StimulusSelector::new(ProtocolClass::StdTrain, 2, 3).is_ok());
    }
}
