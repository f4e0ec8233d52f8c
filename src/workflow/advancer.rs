use log::info;

use crate::algorithms::{AlgorithmBlob, ResultsTable, SearchAlgorithm};
use crate::core::domain::StructureSet;
use crate::workflow::state::{GenerationState, PendingQueue};
use crate::workflow::WorkflowError;

/// The next generation, ready to be submitted.
#[derive(Debug, Clone)]
pub struct Advance {
    pub candidates: StructureSet,
    pub pending: PendingQueue,
    pub blob: AlgorithmBlob,
    pub results: ResultsTable,
}

impl Advance {
    /// Replaces the state's blob, results and queue. The old state is consumed.
    pub fn into_state(self) -> (StructureSet, GenerationState) {
        (
            self.candidates,
            GenerationState::new(self.blob, self.results, self.pending),
        )
    }
}

/// Asks the backend for the next generation and wraps it for submission.
///
/// The fresh queue holds exactly the new candidate ids, in ascending order.
pub fn advance(
    algorithm: &dyn SearchAlgorithm,
    state: &GenerationState,
    initial: &StructureSet,
    optimized: &StructureSet,
) -> Result<Advance, WorkflowError> {
    let generation = state.generation();
    let next = algorithm
        .next_generation(&state.blob, initial, optimized, &state.results)
        .map_err(|source| WorkflowError::Advance { generation, source })?;

    let expected = generation + 1;
    if next.blob.generation() != expected {
        return Err(WorkflowError::GenerationSkew {
            expected,
            found: next.blob.generation(),
        });
    }

    let pending: PendingQueue = next.structures.keys().copied().collect();
    info!(
        "Advanced to generation {} with {} candidates",
        expected,
        pending.len()
    );

    Ok(Advance {
        candidates: next.structures,
        pending,
        blob: next.blob,
        results: next.results,
    })
}
