use std::collections::BTreeSet;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::algorithms::random::{seeded_rng, CandidateSampler};
use crate::algorithms::{
    record_row, AlgorithmBlob, AlgorithmError, AlgorithmKind, Initialization, NextGeneration,
    Registration, ResultStatus, ResultsTable, SearchAlgorithm,
};
use crate::core::config::{EvolutionParams, SearchConfig};
use crate::core::domain::{CandidateId, Structure, StructureSet};
use crate::engine::operators::{crossover_cut_splice, Mutator};

/// Per-generation summary kept in the blob's history table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub generation: u32,
    pub evaluated: usize,
    pub best_id: Option<CandidateId>,
    pub best_energy: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EvolutionBookkeeping {
    next_id: CandidateId,
    /// Survivors of the last selection, best first.
    elites: Vec<CandidateId>,
    history: Vec<GenerationSummary>,
}

/// Generation-aware evolutionary backend.
///
/// Parents are drawn from the relaxed members of the current generation plus
/// the previous elites. Children come from cut-and-splice crossover or
/// mutation of tournament winners; slots that cannot be bred are filled with
/// random structures.
pub struct EvolutionarySearch {
    sampler: CandidateSampler,
    params: EvolutionParams,
    rng: Mutex<ChaCha8Rng>,
}

impl EvolutionarySearch {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            sampler: CandidateSampler::new(config),
            params: config.evolution.clone(),
            rng: Mutex::new(seeded_rng(config)),
        }
    }

    fn tournament_select<'a>(
        &self,
        pool: &'a [(CandidateId, f64, &'a Structure)],
        rng: &mut impl Rng,
    ) -> &'a Structure {
        let rounds = self.params.tournament_size.max(1);
        let mut best = &pool[rng.gen_range(0..pool.len())];
        for _ in 1..rounds {
            let challenger = &pool[rng.gen_range(0..pool.len())];
            if challenger.1 < best.1 {
                best = challenger;
            }
        }
        best.2
    }

    fn breed(
        &self,
        pool: &[(CandidateId, f64, &Structure)],
        rng: &mut ChaCha8Rng,
    ) -> Option<Structure> {
        let p1 = self.tournament_select(pool, rng);

        let child = if pool.len() >= 2 && rng.gen::<f64>() < self.params.crossover_rate {
            let p2 = self.tournament_select(pool, rng);
            let mut child = crossover_cut_splice(p1, p2, rng)?;
            if rng.gen::<f64>() < self.params.mutation_rate {
                child = Mutator::new().rattle(0.1).apply(&child, rng);
            }
            child
        } else {
            let mut mutator = Mutator::new().rotate(0.5).rattle(0.2).swap(1);
            if rng.gen_bool(0.2) {
                mutator = mutator.breathing(0.05);
            }
            mutator.apply(p1, rng)
        };

        self.sampler.is_valid(&child).then_some(child)
    }
}

impl SearchAlgorithm for EvolutionarySearch {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Evolutionary
    }

    fn initialize(&self) -> Result<Initialization, AlgorithmError> {
        let n = self.params.population_size;
        let initial = self.sampler.sample_set(0, n, 1, &mut self.rng.lock())?;
        info!("EA: generated {} first-generation structures", initial.len());

        let book = EvolutionBookkeeping {
            next_id: n,
            ..Default::default()
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
        initial: &StructureSet,
        optimized: &StructureSet,
        results: &ResultsTable,
    ) -> Result<NextGeneration, AlgorithmError> {
        let mut book: EvolutionBookkeeping = serde_json::from_value(blob.payload().clone())?;
        let gen = blob.generation();
        let next_gen = gen + 1;

        // Selection pool: this generation's relaxed candidates plus prior elites
        let members: BTreeSet<CandidateId> = initial
            .keys()
            .chain(book.elites.iter())
            .copied()
            .collect();
        let mut pool: Vec<(CandidateId, f64, &Structure)> = members
            .iter()
            .filter_map(|id| {
                let row = results.get(*id)?;
                let s = optimized.get(id)?;
                Some((*id, row.energy_per_atom, s))
            })
            .collect();
        pool.sort_by(|a, b| a.1.total_cmp(&b.1));

        let evaluated = initial.keys().filter(|id| results.get(**id).is_some()).count();
        book.history.push(GenerationSummary {
            generation: gen,
            evaluated,
            best_id: pool.first().map(|p| p.0),
            best_energy: pool.first().map(|p| p.1),
        });

        let mut next_results = results.clone();
        book.elites = pool
            .iter()
            .take(self.params.elitism_count)
            .map(|p| p.0)
            .collect();
        for id in &book.elites {
            if let Some(row) = next_results.get_mut(*id) {
                row.status = ResultStatus::Elite;
            }
        }

        let target = self.params.population_size;
        let mut rng = self.rng.lock();
        let mut children = Vec::with_capacity(target);

        if pool.is_empty() {
            warn!("EA: generation {} has no relaxed candidates, reseeding at random", gen);
        } else {
            let mut attempts = 0;
            while children.len() < target && attempts < target * 50 {
                attempts += 1;
                if let Some(child) = self.breed(&pool, &mut rng) {
                    children.push(child);
                }
            }
            debug!("EA: bred {} children in {} attempts", children.len(), attempts);
        }

        while children.len() < target {
            children.push(self.sampler.sample(&mut rng)?);
        }

        let mut structures = StructureSet::new();
        for mut child in children {
            child.generation = next_gen;
            structures.insert(book.next_id, child);
            book.next_id += 1;
        }

        info!(
            "EA: generation {} -> {} ({} candidates, elites {:?})",
            gen,
            next_gen,
            structures.len(),
            book.elites
        );

        Ok(NextGeneration {
            structures,
            blob: AlgorithmBlob::new(next_gen, serde_json::to_value(book)?),
            results: next_results,
        })
    }
}
