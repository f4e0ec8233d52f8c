use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowError;

pub const LOCK_MARKER: &str = "lock_csp";
pub const STATUS_MARKER: &str = "csp.stat";

/// Contents of the status marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub algorithm: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: String,
    pub generation: Option<u32>,
    pub batch: Option<usize>,
    pub skipped: usize,
}

impl RunStatus {
    pub fn started(algorithm: &str) -> Self {
        let now = Utc::now();
        Self {
            algorithm: algorithm.to_string(),
            started_at: now,
            updated_at: now,
            phase: "init".to_string(),
            generation: None,
            batch: None,
            skipped: 0,
        }
    }
}

/// Marker locations for one work directory.
#[derive(Debug, Clone)]
pub struct RunMarkers {
    lock_path: PathBuf,
    status_path: PathBuf,
}

impl RunMarkers {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            lock_path: dir.join(LOCK_MARKER),
            status_path: dir.join(STATUS_MARKER),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }

    /// Takes the run lock, or fails without touching either marker.
    pub fn acquire(&self, algorithm: &str) -> Result<RunLock, WorkflowError> {
        if self.status_path.exists() {
            return Err(WorkflowError::StatusMarkerPresent(self.status_path.clone()));
        }
        if self.lock_path.exists() {
            return Err(WorkflowError::LockMarkerPresent(self.lock_path.clone()));
        }

        if let Some(dir) = self.lock_path.parent() {
            fs::create_dir_all(dir).map_err(|source| WorkflowError::Marker {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .map_err(|source| match source.kind() {
                ErrorKind::AlreadyExists => WorkflowError::LockMarkerPresent(self.lock_path.clone()),
                _ => WorkflowError::Marker {
                    path: self.lock_path.clone(),
                    source,
                },
            })?;
        writeln!(file, "pid {}", std::process::id()).map_err(|source| WorkflowError::Marker {
            path: self.lock_path.clone(),
            source,
        })?;

        let lock = RunLock {
            lock_path: self.lock_path.clone(),
            status_path: self.status_path.clone(),
            status: RunStatus::started(algorithm),
        };
        lock.write_status()?;
        info!("Acquired run lock {}", self.lock_path.display());
        Ok(lock)
    }
}

/// Proof that this process owns the work directory.
///
/// Released only through [`RunLock::release`]; dropping it on an error path
/// leaves the lock marker in place.
#[derive(Debug)]
pub struct RunLock {
    lock_path: PathBuf,
    status_path: PathBuf,
    status: RunStatus,
}

impl RunLock {
    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// Updates the status marker with the current position in the run.
    pub fn record(
        &mut self,
        phase: &str,
        generation: Option<u32>,
        batch: Option<usize>,
        skipped: usize,
    ) -> Result<(), WorkflowError> {
        self.status.phase = phase.to_string();
        self.status.generation = generation;
        self.status.batch = batch;
        self.status.skipped = skipped;
        self.status.updated_at = Utc::now();
        self.write_status()
    }

    /// Records the batch just joined. Phase and skip count are left as they are.
    pub fn record_batch(&mut self, generation: u32, batch: usize) -> Result<(), WorkflowError> {
        self.status.generation = Some(generation);
        self.status.batch = Some(batch);
        self.status.updated_at = Utc::now();
        self.write_status()
    }

    fn write_status(&self) -> Result<(), WorkflowError> {
        let marker_err = |source: std::io::Error| WorkflowError::Marker {
            path: self.status_path.clone(),
            source,
        };
        let text = serde_json::to_string_pretty(&self.status)
            .map_err(|e| marker_err(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        fs::write(&self.status_path, text).map_err(marker_err)?;
        debug!("Status: {} gen {:?} batch {:?}", self.status.phase, self.status.generation, self.status.batch);
        Ok(())
    }

    /// Removes the lock marker. The status marker stays as the run record.
    pub fn release(self) -> Result<(), WorkflowError> {
        fs::remove_file(&self.lock_path).map_err(|source| WorkflowError::Marker {
            path: self.lock_path.clone(),
            source,
        })?;
        info!("Released run lock {}", self.lock_path.display());
        Ok(())
    }
}
