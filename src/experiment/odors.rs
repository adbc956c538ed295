//! Odor names and valve roles.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

use crate::config::{parse_valve_name, OdorSettings};
use crate::error::{AppResult, CondError};
use crate::hardware::odor_line;

/// Reads the odor list, overlaying names onto the default `p{i}` names.
///
/// Rows are `index,name[,...]`; blank lines are skipped and later rows win.
/// The file must exist; an empty file keeps every default name.
pub fn read_odors(path: &Path, num_lines: usize) -> AppResult<Vec<String>> {
    let mut names: Vec<String> = (0..num_lines).map(odor_line).collect();
    if !path.is_file() {
        return Err(CondError::Configuration(format!(
            "odor list {} not found",
            path.display()
        )));
    }
    debug!("reading odor list {}", path.display());

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    for record in reader.records() {
        let record = record?;
        let (Some(index), Some(name)) = (record.get(0), record.get(1)) else {
            if record.iter().all(str::is_empty) {
                continue;
            }
            return Err(CondError::Configuration(format!(
                "odor list row {:?} needs an index and a name",
                record.iter().collect::<Vec<_>>()
            )));
        };
        let idx: usize = index
            .parse()
            .map_err(|_| CondError::Configuration(format!("odor index '{}' is not a number", index)))?;
        if idx >= num_lines {
            return Err(CondError::Configuration(format!(
                "odor index {} is out of bounds for {} lines",
                idx, num_lines
            )));
        }
        names[idx] = name.to_string();
    }
    Ok(names)
}

/// Valve lines with a designated role, as line indices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValveRoles {
    pub odor_valve: usize,
    pub no_valve: usize,
    /// Background rotation groups; each group switches as one unit.
    pub rand_valves: Vec<Vec<usize>>,
}

impl ValveRoles {
    /// Resolves the configured valve names. Every role must name a distinct line.
    pub fn resolve(odor: &OdorSettings) -> AppResult<Self> {
        let num_lines = odor.num_lines();
        let odor_valve = parse_valve_name(&odor.odor_valve, num_lines)?;
        let no_valve = parse_valve_name(&odor.no_valve, num_lines)?;
        if odor_valve == no_valve {
            return Err(CondError::Configuration(format!(
                "odor valve and NO valve are both {}",
                odor.odor_valve
            )));
        }

        let mut used = BTreeSet::from([odor_valve, no_valve]);
        let mut rand_valves = Vec::with_capacity(odor.rand_valves.len());
        for group in &odor.rand_valves {
            let mut lines = Vec::with_capacity(group.len());
            for name in group {
                let idx = parse_valve_name(name, num_lines)?;
                if !used.insert(idx) {
                    return Err(CondError::Configuration(format!(
                        "random valve {} is already assigned another role",
                        name
                    )));
                }
                lines.push(idx);
            }
            if !lines.is_empty() {
                rand_valves.push(lines);
            }
        }
        Ok(Self {
            odor_valve,
            no_valve,
            rand_valves,
        })
    }

    /// Lines driven high while odor is delivered.
    pub fn odor_lines(&self) -> [String; 2] {
        [odor_line(self.odor_valve), odor_line(self.no_valve)]
    }
}
