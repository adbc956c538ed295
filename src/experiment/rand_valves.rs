//! Randomized background valve rotation.
//!
//! The configured valve groups are split into a high and a low partition.
//! Every tick both partitions are shuffled and a random-length prefix of
//! each crosses over to the other side, so the set of open background
//! valves keeps changing independently of the trial timeline.

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

use crate::hardware::odor_line;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RandValves {
    high: Vec<Vec<usize>>,
    low: Vec<Vec<usize>>,
}

impl RandValves {
    /// All groups start low. Duplicate groups are kept once.
    pub fn new(groups: &[Vec<usize>]) -> Self {
        let mut low: Vec<Vec<usize>> = Vec::with_capacity(groups.len());
        for group in groups {
            if !low.contains(group) {
                low.push(group.clone());
            }
        }
        Self { high: Vec::new(), low }
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    /// Moves a random prefix of each shuffled partition to the other side.
    pub fn rotate<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.high.shuffle(rng);
        self.low.shuffle(rng);
        let to_high = rng.gen_range(0..=self.low.len());
        let to_low = rng.gen_range(0..=self.high.len());

        let mut high: Vec<Vec<usize>> = self.low.drain(..to_high).collect();
        let mut low: Vec<Vec<usize>> = self.high.drain(..to_low).collect();
        high.append(&mut self.high);
        low.append(&mut self.low);
        self.high = high;
        self.low = low;
    }

    /// Drives everything low, as at block end.
    pub fn reset(&mut self) {
        self.low.append(&mut self.high);
    }

    /// Line names for a `set_state(high, low)` call.
    pub fn line_states(&self) -> (Vec<String>, Vec<String>) {
        let names = |groups: &[Vec<usize>]| -> Vec<String> { groups.iter().flatten().map(|i| odor_line(*i)).collect() };
        (names(&self.high), names(&self.low))
    }

    pub fn high_groups(&self) -> &[Vec<usize>] {
        &self.high
    }
}

/// Delay until the next rotation, uniform in `[min, max]` seconds.
pub fn next_delay<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> Duration {
    let secs = if max > min { rng.gen_range(min..=max) } else { min };
    Duration::from_secs_f64(secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    #[test]
    fn test_rotation_keeps_partitions_disjoint() {
        let groups = vec![vec![2, 3], vec![4], vec![5], vec![4]];
        let mut valves = RandValves::new(&groups);
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen_high = false;

        for _ in 0..100 {
            valves.rotate(&mut rng);
            let (high, low) = valves.line_states();
            let high: BTreeSet<_> = high.into_iter().collect();
            let low: BTreeSet<_> = low.into_iter().collect();
            assert!(high.is_disjoint(&low));
            assert_eq!(high.len() + low.len(), 4);
            seen_high |= !high.is_empty();
        }
        assert!(seen_high);
    }

    #[test]
    fn test_reset_drives_all_low() {
        let mut valves = RandValves::new(&[vec![1], vec![2]]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            valves.rotate(&mut rng);
        }
        valves.reset();
        assert!(valves.high_groups().is_empty());
        assert_eq!(valves.line_states().1.len(), 2);
    }

    #[test]
    fn test_next_delay_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let d = next_delay(&mut rng, 0.4, 0.8).as_secs_f64();
            assert!((0.4..=0.8).contains(&d));
        }
        assert_eq!(next_delay(&mut rng, 0.5, 0.5), Duration::from_millis(500));
    }
}
