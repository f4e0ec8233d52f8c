use std::collections::VecDeque;

use crate::algorithms::{AlgorithmBlob, ResultsTable};
use crate::core::domain::CandidateId;

/// Ordered backlog of ids awaiting relaxation. Consumed front-to-back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingQueue {
    ids: VecDeque<CandidateId>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateId> {
        self.ids.iter()
    }

    /// Removes and returns up to `n` ids from the front.
    pub fn take_batch(&mut self, n: usize) -> Vec<CandidateId> {
        let n = n.min(self.ids.len());
        self.ids.drain(..n).collect()
    }
}

impl FromIterator<CandidateId> for PendingQueue {
    fn from_iter<I: IntoIterator<Item = CandidateId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<CandidateId>> for PendingQueue {
    fn from(ids: Vec<CandidateId>) -> Self {
        Self { ids: ids.into() }
    }
}

/// Everything carried from one generation to the next.
#[derive(Debug, Clone)]
pub struct GenerationState {
    pub blob: AlgorithmBlob,
    pub results: ResultsTable,
    pub pending: PendingQueue,
}

impl GenerationState {
    pub fn new(blob: AlgorithmBlob, results: ResultsTable, pending: PendingQueue) -> Self {
        Self {
            blob,
            results,
            pending,
        }
    }

    pub fn generation(&self) -> u32 {
        self.blob.generation()
    }
}
