use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use log::{info, warn};
use rayon::prelude::*;

use crate::core::domain::{CandidateId, Structure};
use crate::workflow::state::PendingQueue;
use crate::workflow::{EventSink, SolverEvent};

/// Terminal state of one submitted relaxation.
#[derive(Debug, Clone)]
pub enum OutcomeStatus {
    Relaxed { raw_energy: f64, structure: Structure },
    Failed { reason: String },
}

/// Result of one submission, produced exactly once per submitted id.
#[derive(Debug, Clone)]
pub struct RelaxationOutcome {
    pub candidate_id: CandidateId,
    pub status: OutcomeStatus,
}

impl RelaxationOutcome {
    pub fn relaxed(candidate_id: CandidateId, raw_energy: f64, structure: Structure) -> Self {
        Self {
            candidate_id,
            status: OutcomeStatus::Relaxed {
                raw_energy,
                structure,
            },
        }
    }

    pub fn failed(candidate_id: CandidateId, reason: impl Into<String>) -> Self {
        Self {
            candidate_id,
            status: OutcomeStatus::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Relaxed { .. })
    }

    pub fn raw_energy(&self) -> Option<f64> {
        match &self.status {
            OutcomeStatus::Relaxed { raw_energy, .. } => Some(*raw_energy),
            OutcomeStatus::Failed { .. } => None,
        }
    }

    pub fn relaxed_structure(&self) -> Option<&Structure> {
        match &self.status {
            OutcomeStatus::Relaxed { structure, .. } => Some(structure),
            OutcomeStatus::Failed { .. } => None,
        }
    }
}

/// What one `submit_all` call did.
#[derive(Debug, Clone, Default)]
pub struct SubmissionLog {
    /// Latest outcome per id.
    pub outcomes: BTreeMap<CandidateId, RelaxationOutcome>,
    /// Ids of each batch, in submission order.
    pub batches: Vec<Vec<CandidateId>>,
    pub submissions: usize,
}

/// Progress handed to the per-batch hook after a batch has joined.
#[derive(Debug, Clone, Copy)]
pub struct BatchReceipt {
    pub generation: u32,
    pub batch: usize,
    pub size: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// Drains a pending queue in fixed-size batches.
///
/// Every id of a batch is submitted on the rayon pool and the batch joins
/// before the next one is taken; a failing id never cuts its batch short.
#[derive(Debug, Clone)]
pub struct BatchDriver {
    batch_size: NonZeroUsize,
    events: EventSink,
}

impl BatchDriver {
    pub fn new(batch_size: NonZeroUsize) -> Self {
        Self {
            batch_size,
            events: EventSink::none(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.get()
    }

    pub fn submit_all<F>(&self, generation: u32, queue: &mut PendingQueue, submit_one: F) -> SubmissionLog
    where
        F: Fn(CandidateId) -> RelaxationOutcome + Sync,
    {
        self.submit_all_with(generation, queue, submit_one, |_| {})
    }

    /// Like [`submit_all`](Self::submit_all), calling `after_batch` once per joined batch.
    pub fn submit_all_with<F, H>(
        &self,
        generation: u32,
        queue: &mut PendingQueue,
        submit_one: F,
        mut after_batch: H,
    ) -> SubmissionLog
    where
        F: Fn(CandidateId) -> RelaxationOutcome + Sync,
        H: FnMut(&BatchReceipt),
    {
        let mut log = SubmissionLog::default();

        while !queue.is_empty() {
            let ids = queue.take_batch(self.batch_size.get());
            let batch = log.batches.len();

            info!(
                "Generation {}: submitted batch {} of {} calculations, {} remaining",
                generation,
                batch,
                ids.len(),
                queue.len()
            );
            self.events.send(SolverEvent::BatchSubmitted {
                generation,
                batch,
                size: ids.len(),
                remaining: queue.len(),
            });

            let outcomes: Vec<RelaxationOutcome> = ids.par_iter().map(|&id| submit_one(id)).collect();

            let failed = outcomes.iter().filter(|o| !o.is_success()).count();
            if failed > 0 {
                warn!("Generation {}: batch {} had {} failed relaxations", generation, batch, failed);
            }

            log.submissions += ids.len();
            // par_iter keeps input order, so outcomes line up with ids
            for (&id, outcome) in ids.iter().zip(outcomes) {
                log.outcomes.insert(id, outcome);
            }
            log.batches.push(ids);

            let receipt = BatchReceipt {
                generation,
                batch,
                size: log.batches[batch].len(),
                failed,
                remaining: queue.len(),
            };
            self.events.send(SolverEvent::BatchCompleted {
                generation,
                batch,
                failed,
            });
            after_batch(&receipt);
        }

        log
    }
}
