//! Append-only CSV trial log.
//!
//! One file per animal (or per whatever the filename template distinguishes).
//! The file is reopened only when the resolved filename changes, and every
//! open writes the header row before appending.

use chrono::Local;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::TrialLog;
use crate::error::{AppResult, CondError};

pub const HEADER: [&str; 6] = ["Date", "RatID", "Trial", "Time", "Odor?", "Shock?"];

/// Month/day/year and 12-hour time, as the analysis sheets expect.
const DATE_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

#[derive(Default)]
pub struct TrialLogFile {
    path: Option<PathBuf>,
    writer: Option<csv::Writer<File>>,
}

/// Resolves the log filename template: `{animal}` first, then strftime
/// fields against the current local time.
pub fn log_filename(template: &str, animal_id: &str) -> AppResult<String> {
    if template.is_empty() {
        return Ok(String::new());
    }
    let vars = HashMap::from([("animal".to_string(), animal_id.to_string())]);
    let named = strfmt::strfmt(template, &vars)
        .map_err(|e| CondError::Configuration(format!("log filename '{}': {}", template, e)))?;

    let mut resolved = String::new();
    std::fmt::Write::write_fmt(&mut resolved, format_args!("{}", Local::now().format(&named)))
        .map_err(|_| CondError::Configuration(format!("log filename '{}' has an invalid time field", template)))?;
    Ok(resolved)
}

impl TrialLogFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Points the log at `path`. An empty path suspends logging.
    pub fn rotate(&mut self, path: Option<PathBuf>) -> AppResult<()> {
        if path == self.path && (path.is_none() || self.writer.is_some()) {
            return Ok(());
        }
        self.close()?;
        let Some(path) = path else {
            info!("trial logging suspended");
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(HEADER)?;
        writer.flush()?;
        info!("trial log open at {}", path.display());
        self.path = Some(path);
        self.writer = Some(writer);
        Ok(())
    }

    /// Appends one completed trial. No-op while logging is suspended.
    pub fn append(&mut self, animal_id: &str, log: &TrialLog) -> AppResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writer.write_record([
            log.timestamp.format(DATE_FORMAT).to_string(),
            animal_id.to_string(),
            log.trial.to_string(),
            format!("{:.3}", log.event_time),
            u8::from(log.odor).to_string(),
            u8::from(log.shock).to_string(),
        ])?;
        writer.flush()?;
        Ok(())
    }

    pub fn close(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        self.path = None;
        Ok(())
    }
}
