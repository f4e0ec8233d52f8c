use log::{debug, info};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::algorithms::{
    record_row, AlgorithmBlob, AlgorithmError, AlgorithmKind, Initialization, NextGeneration,
    Registration, ResultsTable, SearchAlgorithm,
};
use crate::core::chemistry::InteractionGrid;
use crate::core::config::SearchConfig;
use crate::core::domain::{CandidateId, Lattice, Structure, StructureSet};
use crate::core::spatial;

const SAMPLE_ATTEMPTS: usize = 50;

/// Builds random, overlap-free candidates with the configured stoichiometry.
#[derive(Debug, Clone)]
pub(crate) struct CandidateSampler {
    grid: InteractionGrid,
    atom_counts: Vec<usize>,
    box_size: f64,
    cell: Option<Lattice>,
}

impl CandidateSampler {
    pub(crate) fn new(config: &SearchConfig) -> Self {
        let st = &config.structure;
        let cell = if st.periodic { Lattice::cubic(st.box_size) } else { None };
        Self {
            grid: InteractionGrid::new(&st.species, st.covalent_scale),
            atom_counts: st.atom_counts.clone(),
            box_size: st.box_size,
            cell,
        }
    }

    pub(crate) fn sample(&self, rng: &mut ChaCha8Rng) -> Result<Structure, AlgorithmError> {
        (0..SAMPLE_ATTEMPTS)
            .find_map(|_| {
                Structure::new_random(&self.atom_counts, self.box_size, self.cell.as_ref(), &self.grid, &mut *rng)
            })
            .ok_or(AlgorithmError::Generation {
                attempts: SAMPLE_ATTEMPTS,
            })
    }

    /// Overlap-free and with the target stoichiometry.
    pub(crate) fn is_valid(&self, s: &Structure) -> bool {
        s.check_stoichiometry(&self.atom_counts) && spatial::check_overlap(s, &self.grid)
    }

    /// Samples `count` structures with consecutive ids starting at `first_id`.
    pub(crate) fn sample_set(
        &self,
        first_id: CandidateId,
        count: usize,
        generation: u32,
        rng: &mut ChaCha8Rng,
    ) -> Result<StructureSet, AlgorithmError> {
        (first_id..first_id + count)
            .map(|id| -> Result<(CandidateId, Structure), AlgorithmError> {
                let mut s = self.sample(rng)?;
                s.generation = generation;
                Ok((id, s))
            })
            .collect()
    }
}

pub(crate) fn seeded_rng(config: &SearchConfig) -> ChaCha8Rng {
    match config.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RandomBookkeeping {
    next_id: CandidateId,
    sampled: usize,
}

/// Random search: every generation is a fresh random population.
/// Not generation-aware; the blob's generation only drives the loop.
pub struct RandomSearch {
    sampler: CandidateSampler,
    population_size: usize,
    rng: Mutex<ChaCha8Rng>,
}

impl RandomSearch {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            sampler: CandidateSampler::new(config),
            population_size: config.evolution.population_size,
            rng: Mutex::new(seeded_rng(config)),
        }
    }
}

impl SearchAlgorithm for RandomSearch {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::RandomSearch
    }

    fn initialize(&self) -> Result<Initialization, AlgorithmError> {
        let initial = self
            .sampler
            .sample_set(0, self.population_size, 1, &mut self.rng.lock())?;
        info!("RS: generated {} initial structures", initial.len());

        let book = RandomBookkeeping {
            next_id: self.population_size,
            sampled: self.population_size,
        };
        Ok(Initialization {
            pending: initial.keys().copied().collect(),
            initial,
            optimized: StructureSet::new(),
            results: ResultsTable::new(),
            blob: AlgorithmBlob::new(1, serde_json::to_value(book)?),
        })
    }

    fn register_result(
        &self,
        entry: &Registration<'_>,
        results: &mut ResultsTable,
    ) -> Result<(), AlgorithmError> {
        record_row(entry, results)
    }

    fn next_generation(
        &self,
        blob: &AlgorithmBlob,
        _initial: &StructureSet,
        _optimized: &StructureSet,
        results: &ResultsTable,
    ) -> Result<NextGeneration, AlgorithmError> {
        let mut book: RandomBookkeeping = serde_json::from_value(blob.payload().clone())?;
        let next_gen = blob.generation() + 1;

        let structures = self.sampler.sample_set(
            book.next_id,
            self.population_size,
            next_gen,
            &mut self.rng.lock(),
        )?;
        debug!("RS: sampled ids {}..{}", book.next_id, book.next_id + structures.len());

        book.next_id += structures.len();
        book.sampled += structures.len();

        Ok(NextGeneration {
            structures,
            blob: AlgorithmBlob::new(next_gen, serde_json::to_value(book)?),
            results: results.clone(),
        })
    }
}
