//! Search backends: the book-keeping and next-generation logic the workflow
//! delegates to. The workflow only ever reads [`AlgorithmBlob::generation`].

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::config::SearchConfig;
use crate::core::domain::{CandidateId, Structure, StructureSet};

pub mod evolution;
pub mod random;

pub use evolution::EvolutionarySearch;
pub use random::RandomSearch;

/// Supported backend identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmKind {
    /// Evolutionary algorithm; results are tagged with their generation.
    Evolutionary,
    /// Random search; results carry no generation tag.
    RandomSearch,
}

impl FromStr for AlgorithmKind {
    type Err = AlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EA" => Ok(AlgorithmKind::Evolutionary),
            "RS" => Ok(AlgorithmKind::RandomSearch),
            _ => Err(AlgorithmError::Unsupported(s.to_string())),
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmKind::Evolutionary => write!(f, "EA"),
            AlgorithmKind::RandomSearch => write!(f, "RS"),
        }
    }
}

/// Backend state carried between generations.
///
/// `payload` belongs to the backend that produced it; only `generation` is
/// part of the contract with the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmBlob {
    generation: u32,
    payload: serde_json::Value,
}

impl AlgorithmBlob {
    pub fn new(generation: u32, payload: serde_json::Value) -> Self {
        Self { generation, payload }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Relaxed,
    /// Selected to survive into the next generation.
    Elite,
}

/// One row of the results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub generation: Option<u32>,
    /// Enthalpy per atom (eV/atom); plain energy per atom at zero pressure.
    pub energy_per_atom: f64,
    pub raw_energy: f64,
    pub num_atoms: usize,
    pub volume: f64,
    pub structure_reference: Uuid,
    pub status: ResultStatus,
}

/// Per-candidate results, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsTable {
    rows: BTreeMap<CandidateId, ResultRow>,
}

#[derive(Serialize)]
struct CsvRow<'a> {
    id: CandidateId,
    generation: Option<u32>,
    energy_per_atom: f64,
    raw_energy: f64,
    num_atoms: usize,
    volume: f64,
    structure_reference: String,
    status: &'a str,
}

impl ResultsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the row for `id`.
    pub fn upsert(&mut self, id: CandidateId, row: ResultRow) {
        self.rows.insert(id, row);
    }

    pub fn get(&self, id: CandidateId) -> Option<&ResultRow> {
        self.rows.get(&id)
    }

    pub fn get_mut(&mut self, id: CandidateId) -> Option<&mut ResultRow> {
        self.rows.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CandidateId, &ResultRow)> {
        self.rows.iter()
    }

    /// Rows sorted by energy per atom, lowest first.
    pub fn ranked(&self) -> Vec<(CandidateId, &ResultRow)> {
        let mut ranked: Vec<_> = self.rows.iter().map(|(id, r)| (*id, r)).collect();
        ranked.sort_by(|a, b| a.1.energy_per_atom.total_cmp(&b.1.energy_per_atom));
        ranked
    }

    pub fn write_csv(&self, path: &Path) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for (id, row) in &self.rows {
            writer.serialize(CsvRow {
                id: *id,
                generation: row.generation,
                energy_per_atom: row.energy_per_atom,
                raw_energy: row.raw_energy,
                num_atoms: row.num_atoms,
                volume: row.volume,
                structure_reference: row.structure_reference.to_string(),
                status: match row.status {
                    ResultStatus::Relaxed => "relaxed",
                    ResultStatus::Elite => "elite",
                },
            })?;
        }
        writer.flush()
    }
}

/// Everything a backend needs to record one relaxed candidate.
#[derive(Debug, Clone, Copy)]
pub struct Registration<'a> {
    pub id: CandidateId,
    /// Set only for generation-aware backends.
    pub generation: Option<u32>,
    pub structure: &'a Structure,
    pub raw_energy: f64,
    pub enthalpy_per_atom: f64,
    pub initial: &'a StructureSet,
}

/// Output of the one-time initialization step.
#[derive(Debug, Clone)]
pub struct Initialization {
    pub initial: StructureSet,
    pub optimized: StructureSet,
    pub results: ResultsTable,
    pub blob: AlgorithmBlob,
    pub pending: Vec<CandidateId>,
}

/// Output of one "produce next generation" call.
#[derive(Debug, Clone)]
pub struct NextGeneration {
    pub structures: StructureSet,
    pub blob: AlgorithmBlob,
    pub results: ResultsTable,
}

#[derive(Debug, thiserror::Error)]
pub enum AlgorithmError {
    #[error("algo not supported: {0}")]
    Unsupported(String),
    #[error("could not generate a valid structure after {attempts} attempts")]
    Generation { attempts: usize },
    #[error("candidate {0} is not part of the initial set")]
    UnknownCandidate(CandidateId),
    #[error("energy for candidate {id} is not finite: {energy}")]
    NonFiniteEnergy { id: CandidateId, energy: f64 },
    #[error("corrupt algorithm state: {0}")]
    State(#[from] serde_json::Error),
}

/// The search backend seam.
pub trait SearchAlgorithm: Send + Sync {
    fn kind(&self) -> AlgorithmKind;

    /// Whether results are tagged with the current generation number.
    fn is_generation_aware(&self) -> bool {
        self.kind() == AlgorithmKind::Evolutionary
    }

    /// Builds the first candidate set and the starting state.
    fn initialize(&self) -> Result<Initialization, AlgorithmError>;

    /// Records one relaxed candidate in the results table.
    fn register_result(
        &self,
        entry: &Registration<'_>,
        results: &mut ResultsTable,
    ) -> Result<(), AlgorithmError>;

    /// Produces the next generation's candidates and state.
    fn next_generation(
        &self,
        blob: &AlgorithmBlob,
        initial: &StructureSet,
        optimized: &StructureSet,
        results: &ResultsTable,
    ) -> Result<NextGeneration, AlgorithmError>;
}

/// Shared row-writing step used by both backends.
pub(crate) fn record_row(
    entry: &Registration<'_>,
    results: &mut ResultsTable,
) -> Result<(), AlgorithmError> {
    if !entry.initial.contains_key(&entry.id) {
        return Err(AlgorithmError::UnknownCandidate(entry.id));
    }
    if !entry.enthalpy_per_atom.is_finite() {
        return Err(AlgorithmError::NonFiniteEnergy {
            id: entry.id,
            energy: entry.enthalpy_per_atom,
        });
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

/// Builds the backend named in the configuration.
pub fn build_algorithm(config: &SearchConfig) -> Result<Arc<dyn SearchAlgorithm>, AlgorithmError> {
    let algorithm: Arc<dyn SearchAlgorithm> = match config.algorithm.parse::<AlgorithmKind>()? {
        AlgorithmKind::Evolutionary => Arc::new(EvolutionarySearch::new(config)),
        AlgorithmKind::RandomSearch => Arc::new(RandomSearch::new(config)),
    };
    Ok(algorithm)
}
