use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use log::{info, warn};

use crate::algorithms::{build_algorithm, AlgorithmError, ResultsTable, SearchAlgorithm};
use crate::core::config::SearchConfig;
use crate::core::domain::{CandidateId, PortableStructure, StructureSet};
use crate::engine::relaxer::Relaxer;
use crate::workflow::advancer::advance;
use crate::workflow::batch::{BatchDriver, RelaxationOutcome};
use crate::workflow::collector::{PackedResults, ResultCollector, SkippedCandidate};
use crate::workflow::lock::{RunLock, RunMarkers};
use crate::workflow::state::{GenerationState, PendingQueue};
use crate::workflow::{EventSink, GenStats, SolverEvent, WorkflowError};

pub const RESULTS_FILE: &str = "results.csv";
pub const OPTIMIZED_FILE: &str = "optimized.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Iterating,
    Done,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Iterating => "iterating",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Final products of a completed run.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    /// Generation of the last evaluated candidate set.
    pub final_generation: u32,
    /// Submit/collect passes, the final pass included.
    pub outer_iterations: usize,
    pub submissions: usize,
    pub results: ResultsTable,
    /// Every relaxed structure of the run, by id.
    pub optimized: StructureSet,
    /// Packed summary of the final pass.
    pub packed: PackedResults,
    pub skipped: Vec<SkippedCandidate>,
    /// One entry per submit/collect pass, each with its packed summary.
    pub generations: Vec<GenStats>,
}

/// Mutable run bookkeeping threaded through the passes.
struct RunContext {
    lock: RunLock,
    events: EventSink,
    phase: Phase,
    /// Generation of the candidate set currently being worked on.
    generation: Option<u32>,
    submissions: usize,
    skipped: Vec<SkippedCandidate>,
    history: Vec<GenStats>,
    best: Option<(CandidateId, f64)>,
}

/// Products of the passes, before the lock is released.
struct Passes {
    state: GenerationState,
    optimized: StructureSet,
    packed: PackedResults,
    outer_iterations: usize,
}

/// The master loop: initialize, then submit/collect/advance until the
/// generation ceiling, then one last submit/collect pass.
pub struct SearchWorkflow {
    algorithm: Arc<dyn SearchAlgorithm>,
    relaxer: Arc<dyn Relaxer>,
    max_generations: u32,
    batch_size: NonZeroUsize,
    pressure_gpa: f64,
    work_dir: PathBuf,
    write_outputs: bool,
}

impl SearchWorkflow {
    pub fn new(
        algorithm: Arc<dyn SearchAlgorithm>,
        relaxer: Arc<dyn Relaxer>,
        config: &SearchConfig,
    ) -> Result<Self, WorkflowError> {
        Ok(Self {
            algorithm,
            relaxer,
            max_generations: config.max_generations,
            batch_size: config.batch_size()?,
            pressure_gpa: config.target_pressure(),
            work_dir: config.work_dir.clone(),
            write_outputs: true,
        })
    }

    /// Builds the backend named in `config`. An unknown identifier is
    /// rejected here, before any marker or state exists.
    pub fn from_config(config: &SearchConfig, relaxer: Arc<dyn Relaxer>) -> Result<Self, WorkflowError> {
        let algorithm = build_algorithm(config).map_err(|e| match e {
            AlgorithmError::Unsupported(id) => WorkflowError::UnsupportedAlgorithm(id),
            other => WorkflowError::Initialization(other),
        })?;
        Self::new(algorithm, relaxer, config)
    }

    /// Skips writing `results.csv` / `optimized.json`.
    pub fn without_outputs(mut self) -> Self {
        self.write_outputs = false;
        self
    }

    pub fn markers(&self) -> RunMarkers {
        RunMarkers::in_dir(&self.work_dir)
    }

    pub fn run(&self, tx: Sender<SolverEvent>) -> Result<WorkflowReport, WorkflowError> {
        let events = EventSink::new(tx);
        let outcome = self.run_with(events.clone());
        if let Err(e) = &outcome {
            events.send(SolverEvent::Log(format!("Run aborted: {}", e)));
        }
        events.send(SolverEvent::Finished);
        outcome
    }

    pub fn run_with(&self, events: EventSink) -> Result<WorkflowReport, WorkflowError> {
        let start = Instant::now();
        let kind = self.algorithm.kind();

        // --- Init ---
        let lock = self.markers().acquire(&kind.to_string())?;
        let mut ctx = RunContext {
            lock,
            events,
            phase: Phase::Init,
            generation: None,
            submissions: 0,
            skipped: Vec::new(),
            history: Vec::new(),
            best: None,
        };

        let passes = match self.drive(&mut ctx) {
            Ok(passes) => passes,
            Err(e) => {
                // The lock stays; the status marker records where the run stopped
                self.enter(&mut ctx, Phase::Aborted);
                return Err(e);
            }
        };

        // --- Done ---
        self.enter(&mut ctx, Phase::Done);
        let RunContext {
            lock,
            events,
            submissions,
            skipped,
            history,
            ..
        } = ctx;
        lock.release()?;

        info!(
            "Run finished: generation {}, {} submissions, {} skipped, {:.1}s",
            passes.state.generation(),
            submissions,
            skipped.len(),
            start.elapsed().as_secs_f64()
        );
        events.send(SolverEvent::Log(format!(
            "Run finished after {} passes",
            passes.outer_iterations
        )));

        Ok(WorkflowReport {
            final_generation: passes.state.generation(),
            outer_iterations: passes.outer_iterations,
            submissions,
            results: passes.state.results,
            optimized: passes.optimized,
            packed: passes.packed,
            skipped,
            generations: history,
        })
    }

    /// Everything between taking the lock and releasing it: initialize,
    /// iterate, the final pass and the output files.
    fn drive(&self, ctx: &mut RunContext) -> Result<Passes, WorkflowError> {
        let init = self
            .algorithm
            .initialize()
            .map_err(WorkflowError::Initialization)?;

        let mut state = GenerationState::new(init.blob, init.results, PendingQueue::from(init.pending));
        let mut initial = init.initial;
        let mut optimized = init.optimized;
        ctx.generation = Some(state.generation());
        info!(
            "{} run starting at generation {} (max {}), {} candidates",
            self.algorithm.kind(),
            state.generation(),
            self.max_generations,
            state.pending.len()
        );

        // --- Iterating ---
        self.enter(ctx, Phase::Iterating);
        let mut outer_iterations = 0;
        while state.generation() < self.max_generations {
            outer_iterations += 1;
            let (opt, _) = self.evaluate(ctx, &mut state, &initial, optimized);
            optimized = opt;

            let (candidates, next_state) =
                advance(self.algorithm.as_ref(), &state, &initial, &optimized)?.into_state();
            initial = candidates;
            state = next_state;
            ctx.generation = Some(state.generation());
        }

        // Final optimization pass, no further advancement
        info!("Running final optimization for generation {}", state.generation());
        outer_iterations += 1;
        let (optimized, packed) = self.evaluate(ctx, &mut state, &initial, optimized);

        if self.write_outputs {
            self.write_run_outputs(&state.results, &optimized)?;
        }

        Ok(Passes {
            state,
            optimized,
            packed,
            outer_iterations,
        })
    }

    fn enter(&self, ctx: &mut RunContext, to: Phase) {
        info!("Phase {} -> {}", ctx.phase, to);
        ctx.phase = to;
        let skipped = ctx.skipped.len();
        if let Err(e) = ctx.lock.record(&to.to_string(), ctx.generation, None, skipped) {
            warn!("Could not update status marker: {}", e);
        }
    }

    /// One submit + collect pass over the state's pending queue.
    fn evaluate(
        &self,
        ctx: &mut RunContext,
        state: &mut GenerationState,
        initial: &StructureSet,
        optimized: StructureSet,
    ) -> (StructureSet, PackedResults) {
        let generation = state.generation();
        let relaxer = self.relaxer.as_ref();

        let submit_one = |id: CandidateId| match initial.get(&id) {
            None => RelaxationOutcome::failed(id, "candidate missing from the initial set"),
            Some(structure) => match relaxer.relax(structure) {
                Ok(r) => RelaxationOutcome::relaxed(id, r.energy, r.structure),
                Err(e) => RelaxationOutcome::failed(id, format!("{:#}", e)),
            },
        };

        let driver = BatchDriver::new(self.batch_size).with_events(ctx.events.clone());
        let lock = &mut ctx.lock;
        let log = driver.submit_all_with(generation, &mut state.pending, submit_one, |receipt| {
            if let Err(e) = lock.record_batch(receipt.generation, receipt.batch) {
                warn!("Could not update status marker: {}", e);
            }
        });
        ctx.submissions += log.submissions;

        let collector =
            ResultCollector::new(self.algorithm.as_ref(), self.pressure_gpa).with_events(ctx.events.clone());
        let results = std::mem::take(&mut state.results);
        let collection = collector.collect(generation, log.outcomes, initial, optimized, results);
        state.results = collection.results;

        let relaxed = collection.packed.len();
        let skipped = collection.skipped.len();
        ctx.skipped.extend(collection.skipped);

        // Skip count is only known once the generation is collected
        let last_batch = ctx.lock.status().batch;
        if let Err(e) = ctx
            .lock
            .record(&Phase::Iterating.to_string(), Some(generation), last_batch, ctx.skipped.len())
        {
            warn!("Could not update status marker: {}", e);
        }

        // Track the best enthalpy per atom over the whole run
        if let Some((id, row)) = state.results.ranked().first() {
            let improved = ctx.best.map_or(true, |(_, e)| row.energy_per_atom < e - 1e-9);
            if improved {
                ctx.best = Some((*id, row.energy_per_atom));
                if let Some(structure) = collection.optimized.get(id) {
                    info!("New best: ID {} at {:.6} eV/atom", id, row.energy_per_atom);
                    ctx.events.send(SolverEvent::NewBest {
                        id: *id,
                        energy_per_atom: row.energy_per_atom,
                        structure: structure.clone(),
                    });
                }
            }
        }

        info!(
            "Generation {}: {} submitted, {} relaxed, {} skipped",
            generation, log.submissions, relaxed, skipped
        );
        let stats = GenStats {
            generation,
            submitted: log.submissions,
            relaxed,
            skipped,
            best_energy: ctx.best.map(|b| b.1),
            best_id: ctx.best.map(|b| b.0),
            packed: collection.packed.clone(),
        };
        ctx.history.push(stats.clone());
        ctx.events.send(SolverEvent::GenerationUpdate(stats));

        (collection.optimized, collection.packed)
    }

    fn write_run_outputs(&self, results: &ResultsTable, optimized: &StructureSet) -> Result<(), WorkflowError> {
        let results_path = self.work_dir.join(RESULTS_FILE);
        results
            .write_csv(&results_path)
            .map_err(|source| WorkflowError::Output {
                path: results_path.clone(),
                source,
            })?;

        let optimized_path = self.work_dir.join(OPTIMIZED_FILE);
        let portable: std::collections::BTreeMap<CandidateId, PortableStructure> = optimized
            .iter()
            .map(|(id, s)| (*id, PortableStructure::from(s)))
            .collect();
        let text = serde_json::to_string_pretty(&portable).map_err(|e| WorkflowError::Output {
            path: optimized_path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        fs::write(&optimized_path, text).map_err(|source| WorkflowError::Output {
            path: optimized_path.clone(),
            source,
        })?;

        info!(
            "Wrote {} and {}",
            results_path.display(),
            optimized_path.display()
        );
        Ok(())
    }
}
