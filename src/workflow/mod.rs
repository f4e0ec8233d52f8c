//! Generation loop: batch submission, result collection and advancement.

use std::path::PathBuf;

use crossbeam_channel::Sender;

use crate::algorithms::AlgorithmError;
use crate::core::config::ConfigError;
use crate::core::domain::{CandidateId, Structure};

pub mod advancer;
pub mod batch;
pub mod collector;
pub mod lock;
pub mod master;
pub mod state;

pub use advancer::{advance, Advance};
pub use batch::{BatchDriver, BatchReceipt, OutcomeStatus, RelaxationOutcome, SubmissionLog};
pub use collector::{enthalpy_per_atom, Collection, PackedEntry, PackedResults, ResultCollector, SkippedCandidate};
pub use lock::{RunLock, RunMarkers, RunStatus};
pub use master::{Phase, SearchWorkflow, WorkflowReport};
pub use state::{GenerationState, PendingQueue};

/// Summary of one completed generation.
#[derive(Debug, Clone, Default)]
pub struct GenStats {
    pub generation: u32,
    pub submitted: usize,
    pub relaxed: usize,
    pub skipped: usize,
    /// Lowest enthalpy per atom seen so far, across all generations.
    pub best_energy: Option<f64>,
    pub best_id: Option<CandidateId>,
    /// Packed energies and structures of this pass.
    pub packed: PackedResults,
}

/// Progress events emitted by the workflow to whoever drives it.
#[derive(Debug, Clone)]
pub enum SolverEvent {
    /// Diagnostic log message.
    Log(String),

    BatchSubmitted {
        generation: u32,
        batch: usize,
        size: usize,
        remaining: usize,
    },

    BatchCompleted {
        generation: u32,
        batch: usize,
        failed: usize,
    },

    CandidateSkipped(SkippedCandidate),

    /// A generation's results have been collected.
    GenerationUpdate(GenStats),

    /// A structure that beats the current best enthalpy per atom.
    NewBest {
        id: CandidateId,
        energy_per_atom: f64,
        structure: Structure,
    },

    /// Run has finished.
    Finished,
}

/// Optional event channel. Sends never fail the workflow: a dropped receiver
/// only means nobody is listening.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<Sender<SolverEvent>>);

impl EventSink {
    pub fn new(tx: Sender<SolverEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn send(&self, event: SolverEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("algorithm rejected: {0}")]
    UnsupportedAlgorithm(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("status marker {0} exists; resume is not supported, clean the work directory")]
    StatusMarkerPresent(PathBuf),
    #[error("lock marker {0} exists; another run is in progress or ended abnormally")]
    LockMarkerPresent(PathBuf),
    #[error("run marker I/O failed for {path}: {source}")]
    Marker {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("initialization failed: {0}")]
    Initialization(#[source] AlgorithmError),
    #[error("advancing generation {generation} failed: {source}")]
    Advance {
        generation: u32,
        #[source]
        source: AlgorithmError,
    },
    #[error("backend returned generation {found}, expected {expected}")]
    GenerationSkew { expected: u32, found: u32 },
    #[error("writing run output {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },
}
