#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Result};
use nalgebra::Point3;
use parking_lot::Mutex;

use csp_workflow::algorithms::{
    AlgorithmBlob, AlgorithmError, AlgorithmKind, Initialization, NextGeneration, Registration,
    ResultStatus, ResultRow, ResultsTable, SearchAlgorithm,
};
use csp_workflow::core::config::SearchConfig;
use csp_workflow::core::domain::{Atom, CandidateId, Structure, StructureSet};
use csp_workflow::engine::relaxer::{Relaxation, Relaxer};

/// A cluster of `n` atoms on the x axis, alternating species 0 and 1.
pub fn line_cluster(n: usize) -> Structure {
    let mut s = Structure::new("Test");
    for i in 0..n {
        s.atoms.push(Atom::new(i % 2, Point3::new(i as f64 * 2.0, 0.0, 0.0)));
    }
    s
}

/// Small, seeded configuration rooted in `work_dir`.
pub fn small_config(algorithm: &str, work_dir: &std::path::Path) -> SearchConfig {
    let mut config = SearchConfig::default();
    config.algorithm = algorithm.to_string();
    config.seed = Some(7);
    config.max_generations = 3;
    config.batch_size = 2;
    config.pressure = Some(serde_json::json!(0.0));
    config.work_dir = work_dir.to_path_buf();
    config.structure.atom_counts = vec![2, 2];
    config.evolution.population_size = 4;
    config.evolution.elitism_count = 1;
    config
}

/// Deterministic stand-in for GULP: energy is minus the summed distance
/// from the origin, the geometry comes back unchanged.
#[derive(Default)]
pub struct MockRelaxer {
    calls: AtomicUsize,
    /// Every n-th call fails, when set.
    fail_every: Option<usize>,
}

impl MockRelaxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_every(n: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_every: Some(n),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Relaxer for MockRelaxer {
    fn relax(&self, structure: &Structure) -> Result<Relaxation> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(n) = self.fail_every {
            if call % n == 0 {
                bail!("mock relaxation {} did not converge", call);
            }
        }

        let energy = -structure
            .atoms
            .iter()
            .map(|a| a.position.coords.norm())
            .sum::<f64>();
        Ok(Relaxation {
            energy,
            structure: structure.clone(),
        })
    }

    fn name(&self) -> &str {
        "Mock Relaxer"
    }
}

/// Backend with fixed, hand-checkable candidates: `population` two-atom
/// clusters per generation with consecutive ids.
pub struct ScriptedAlgorithm {
    pub population: usize,
    /// Generation of the initial candidate set.
    pub start_generation: u32,
    pub generation_aware: bool,
    /// Added to the generation returned by `next_generation`.
    pub skew: u32,
    pub advanced: Mutex<Vec<u32>>,
}

impl ScriptedAlgorithm {
    pub fn new(population: usize) -> Self {
        Self {
            population,
            start_generation: 1,
            generation_aware: true,
            skew: 0,
            advanced: Mutex::new(Vec::new()),
        }
    }

    fn candidates(&self, first: CandidateId, generation: u32) -> StructureSet {
        (first..first + self.population)
            .map(|id| {
                let mut s = line_cluster(2);
                s.generation = generation;
                (id, s)
            })
            .collect()
    }
}

impl SearchAlgorithm for ScriptedAlgorithm {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Evolutionary
    }

    fn is_generation_aware(&self) -> bool {
        self.generation_aware
    }

    fn initialize(&self) -> Result<Initialization, AlgorithmError> {
        let initial = self.candidates(0, self.start_generation);
        Ok(Initialization {
            pending: initial.keys().copied().collect(),
            initial,
            optimized: StructureSet::new(),
            results: ResultsTable::new(),
            blob: AlgorithmBlob::new(
                self.start_generation,
                serde_json::json!({ "next_id": self.population }),
            ),
        })
    }

    fn register_result(&self, entry: &Registration<'_>, results: &mut ResultsTable) -> Result<(), AlgorithmError> {
        if !entry.initial.contains_key(&entry.id) {
            return Err(AlgorithmError::UnknownCandidate(entry.id));
        }
        results.upsert(
            entry.id,
            ResultRow {
                generation: entry.generation,
                energy_per_atom: entry.enthalpy_per_atom,
                raw_energy: entry.raw_energy,
                num_atoms: entry.structure.num_atoms(),
                volume: entry.structure.volume(),
                structure_reference: entry.structure.uid,
                status: ResultStatus::Relaxed,
            },
        );
        Ok(())
    }

    fn next_generation(
        &self,
        blob: &AlgorithmBlob,
        _initial: &StructureSet,
        _optimized: &StructureSet,
        results: &ResultsTable,
    ) -> Result<NextGeneration, AlgorithmError> {
        let next_id = blob.payload()["next_id"].as_u64().unwrap_or(0) as usize;
        let next_gen = blob.generation() + 1;
        self.advanced.lock().push(blob.generation());

        Ok(NextGeneration {
            structures: self.candidates(next_id, next_gen),
            blob: AlgorithmBlob::new(
                next_gen + self.skew,
                serde_json::json!({ "next_id": next_id + self.population }),
            ),
            results: results.clone(),
        })
    }
}
