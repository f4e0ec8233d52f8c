use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::algorithms::{Registration, ResultsTable, SearchAlgorithm};
use crate::core::domain::{CandidateId, StructureSet};
use crate::workflow::batch::{OutcomeStatus, RelaxationOutcome};
use crate::workflow::{EventSink, SolverEvent};

/// eV/Å^3 per GPa.
pub const GPA_TO_EV_PER_A3: f64 = 1.0 / 160.217_662_08;

/// Enthalpy per atom `(E + P·V) / N`, with `P` in GPa and `V` in Å^3.
///
/// At zero pressure this is exactly `E / N`. Returns `None` for `N == 0`.
pub fn enthalpy_per_atom(raw_energy: f64, volume: f64, num_atoms: usize, pressure_gpa: f64) -> Option<f64> {
    if num_atoms == 0 {
        return None;
    }
    let n = num_atoms as f64;
    if pressure_gpa == 0.0 {
        return Some(raw_energy / n);
    }
    Some((raw_energy + pressure_gpa * GPA_TO_EV_PER_A3 * volume) / n)
}

/// One entry of the packed summary: raw energy plus a portable structure dict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedEntry {
    pub energy: f64,
    pub structure: serde_json::Value,
}

pub type PackedResults = BTreeMap<CandidateId, PackedEntry>;

/// An id that contributed nothing to this generation, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub id: CandidateId,
    pub generation: u32,
    pub reason: String,
}

/// Output of one collection pass.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub optimized: StructureSet,
    pub results: ResultsTable,
    pub packed: PackedResults,
    pub skipped: Vec<SkippedCandidate>,
}

/// Turns relaxation outcomes into registered results.
///
/// Every id either lands in `packed` (and the optimized set and results
/// table) or in `skipped`; one bad id never stops the others.
pub struct ResultCollector<'a> {
    algorithm: &'a dyn SearchAlgorithm,
    pressure_gpa: f64,
    events: EventSink,
}

impl<'a> ResultCollector<'a> {
    pub fn new(algorithm: &'a dyn SearchAlgorithm, pressure_gpa: f64) -> Self {
        Self {
            algorithm,
            pressure_gpa,
            events: EventSink::none(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn collect(
        &self,
        generation: u32,
        outcomes: BTreeMap<CandidateId, RelaxationOutcome>,
        initial: &StructureSet,
        optimized: StructureSet,
        results: ResultsTable,
    ) -> Collection {
        let mut out = Collection {
            optimized,
            results,
            ..Default::default()
        };
        let tag = self.algorithm.is_generation_aware().then_some(generation);

        for (id, outcome) in outcomes {
            let (raw_energy, structure) = match outcome.status {
                OutcomeStatus::Relaxed { raw_energy, structure } => (raw_energy, structure),
                OutcomeStatus::Failed { reason } => {
                    warn!("Sub-process for ID {} failed: {}", id, reason);
                    self.skip(&mut out, id, generation, reason);
                    continue;
                }
            };

            let Some(enthalpy) =
                enthalpy_per_atom(raw_energy, structure.volume(), structure.num_atoms(), self.pressure_gpa)
            else {
                warn!("ID {} relaxed to an empty structure", id);
                self.skip(&mut out, id, generation, "relaxed structure has no atoms".to_string());
                continue;
            };

            let entry = Registration {
                id,
                generation: tag,
                structure: &structure,
                raw_energy,
                enthalpy_per_atom: enthalpy,
                initial,
            };
            if let Err(e) = self.algorithm.register_result(&entry, &mut out.results) {
                warn!("Registering ID {} failed: {}", id, e);
                self.skip(&mut out, id, generation, e.to_string());
                continue;
            }

            debug!("ID {}: E = {:.6} eV, H = {:.6} eV/atom", id, raw_energy, enthalpy);
            out.packed.insert(
                id,
                PackedEntry {
                    energy: raw_energy,
                    structure: structure.to_portable(),
                },
            );
            out.optimized.insert(id, structure);
        }

        out
    }

    fn skip(&self, out: &mut Collection, id: CandidateId, generation: u32, reason: String) {
        let skipped = SkippedCandidate { id, generation, reason };
        self.events.send(SolverEvent::CandidateSkipped(skipped.clone()));
        out.skipped.push(skipped);
    }
}
