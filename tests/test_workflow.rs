mod common;

use std::fs;
use std::sync::Arc;

use common::{small_config, MockRelaxer, ScriptedAlgorithm};
use crossbeam_channel::unbounded;
use csp_workflow::algorithms::{build_algorithm, AlgorithmBlob, AlgorithmKind, ResultStatus};
use csp_workflow::core::domain::StructureSet;
use csp_workflow::workflow::lock::{RunStatus, LOCK_MARKER, STATUS_MARKER};
use csp_workflow::workflow::master::{OPTIMIZED_FILE, RESULTS_FILE};
use csp_workflow::workflow::{
    advance, GenerationState, PendingQueue, SearchWorkflow, SolverEvent, WorkflowError,
};

#[test]
fn test_scripted_run_counts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config("EA", dir.path());
    config.max_generations = 4;

    let algo = Arc::new(ScriptedAlgorithm::new(3));
    let relaxer = Arc::new(MockRelaxer::new());
    let workflow = SearchWorkflow::new(algo.clone(), relaxer.clone(), &config).unwrap();

    let (tx, rx) = unbounded();
    let report = workflow.run(tx).unwrap();

    // Generations 1..=3 advance, generation 4 gets the final pass only
    assert_eq!(report.final_generation, 4);
    assert_eq!(report.outer_iterations, 4);
    assert_eq!(*algo.advanced.lock(), vec![1, 2, 3]);
    assert_eq!(report.submissions, 12);
    assert_eq!(relaxer.calls(), 12);
    assert_eq!(report.results.len(), 12);
    assert_eq!(report.packed.keys().copied().collect::<Vec<_>>(), vec![9, 10, 11]);
    assert!(report.skipped.is_empty());

    let generations: Vec<u32> = rx
        .try_iter()
        .filter_map(|e| match e {
            SolverEvent::GenerationUpdate(stats) => Some(stats.generation),
            _ => None,
        })
        .collect();
    assert_eq!(generations, vec![1, 2, 3, 4]);
}

#[test]
fn test_max_generation_one_runs_final_pass_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config("EA", dir.path());
    config.max_generations = 1;

    let algo = Arc::new(ScriptedAlgorithm::new(2));
    let relaxer = Arc::new(MockRelaxer::new());
    let report = SearchWorkflow::new(algo.clone(), relaxer.clone(), &config)
        .unwrap()
        .without_outputs()
        .run_with(Default::default())
        .unwrap();

    assert_eq!(report.outer_iterations, 1);
    assert!(algo.advanced.lock().is_empty());
    assert_eq!(relaxer.calls(), 2);
    assert!(!dir.path().join(RESULTS_FILE).exists());
}

#[test]
fn test_success_releases_lock_and_writes_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("EA", dir.path());

    let workflow =
        SearchWorkflow::new(Arc::new(ScriptedAlgorithm::new(2)), Arc::new(MockRelaxer::new()), &config).unwrap();
    workflow.run_with(Default::default()).unwrap();

    assert!(!dir.path().join(LOCK_MARKER).exists());
    let status: RunStatus =
        serde_json::from_str(&fs::read_to_string(dir.path().join(STATUS_MARKER)).unwrap()).unwrap();
    assert_eq!(status.phase, "done");
    assert_eq!(status.generation, Some(3));

    let csv = fs::read_to_string(dir.path().join(RESULTS_FILE)).unwrap();
    assert_eq!(csv.lines().count(), 1 + 6);
    let optimized: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join(OPTIMIZED_FILE)).unwrap()).unwrap();
    assert_eq!(optimized.as_object().unwrap().len(), 6);
}

#[test]
fn test_status_marker_blocks_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("EA", dir.path());
    fs::write(dir.path().join(STATUS_MARKER), "{}").unwrap();

    let relaxer = Arc::new(MockRelaxer::new());
    let workflow = SearchWorkflow::from_config(&config, relaxer.clone()).unwrap();
    let err = workflow.run_with(Default::default()).unwrap_err();

    assert!(matches!(err, WorkflowError::StatusMarkerPresent(_)));
    assert_eq!(relaxer.calls(), 0);
    assert!(!dir.path().join(LOCK_MARKER).exists());
    assert_eq!(fs::read_to_string(dir.path().join(STATUS_MARKER)).unwrap(), "{}");
}

#[test]
fn test_lock_marker_blocks_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("RS", dir.path());
    fs::write(dir.path().join(LOCK_MARKER), "pid 1").unwrap();

    let relaxer = Arc::new(MockRelaxer::new());
    let err = SearchWorkflow::from_config(&config, relaxer.clone())
        .unwrap()
        .run_with(Default::default())
        .unwrap_err();

    assert!(matches!(err, WorkflowError::LockMarkerPresent(_)));
    assert_eq!(relaxer.calls(), 0);
    assert_eq!(fs::read_to_string(dir.path().join(LOCK_MARKER)).unwrap(), "pid 1");
    assert!(!dir.path().join(STATUS_MARKER).exists());
}

#[test]
fn test_unsupported_algorithm_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("PSO", dir.path());

    let err = SearchWorkflow::from_config(&config, Arc::new(MockRelaxer::new()))
        .err()
        .expect("PSO must be rejected");

    assert!(matches!(err, WorkflowError::UnsupportedAlgorithm(ref id) if id == "PSO"));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_generation_skew_aborts_and_keeps_lock() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("EA", dir.path());
    let mut algo = ScriptedAlgorithm::new(2);
    algo.skew = 1;

    let err = SearchWorkflow::new(Arc::new(algo), Arc::new(MockRelaxer::new()), &config)
        .unwrap()
        .run_with(Default::default())
        .unwrap_err();

    assert!(matches!(err, WorkflowError::GenerationSkew { expected: 2, found: 3 }));
    assert!(dir.path().join(LOCK_MARKER).exists());
}

#[test]
fn test_failed_relaxations_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("EA", dir.path());

    let relaxer = Arc::new(MockRelaxer::failing_every(3));
    let report = SearchWorkflow::new(Arc::new(ScriptedAlgorithm::new(3)), relaxer.clone(), &config)
        .unwrap()
        .without_outputs()
        .run_with(Default::default())
        .unwrap();

    assert_eq!(report.submissions, 9);
    assert_eq!(report.skipped.len(), 3);
    assert_eq!(report.results.len() + report.skipped.len(), report.submissions);
}

#[test]
fn test_advance_builds_fresh_queue() {
    let algo = ScriptedAlgorithm::new(2);
    let state = GenerationState::new(
        AlgorithmBlob::new(1, serde_json::json!({ "next_id": 2 })),
        Default::default(),
        PendingQueue::new(),
    );

    let next = advance(&algo, &state, &StructureSet::new(), &StructureSet::new()).unwrap();
    assert_eq!(next.blob.generation(), 2);
    assert_eq!(next.pending.iter().copied().collect::<Vec<_>>(), vec![2, 3]);

    let (candidates, new_state) = next.into_state();
    assert_eq!(new_state.generation(), 2);
    assert!(candidates.values().all(|s| s.generation == 2));
}

#[test]
fn test_evolutionary_backend_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("EA", dir.path());
    let algorithm = build_algorithm(&config).unwrap();
    assert_eq!(algorithm.kind(), AlgorithmKind::Evolutionary);

    let relaxer = Arc::new(MockRelaxer::new());
    let report = SearchWorkflow::new(algorithm, relaxer.clone(), &config)
        .unwrap()
        .run_with(Default::default())
        .unwrap();

    assert_eq!(report.final_generation, 3);
    assert_eq!(relaxer.calls(), 12);
    assert_eq!(report.results.len(), 12);
    assert!(report.results.iter().all(|(_, row)| row.generation.is_some()));
    assert!(report
        .results
        .iter()
        .any(|(_, row)| row.status == ResultStatus::Elite));
    assert!(!dir.path().join(LOCK_MARKER).exists());
}

#[test]
fn test_random_backend_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("rs", dir.path());

    let relaxer = Arc::new(MockRelaxer::new());
    let report = SearchWorkflow::from_config(&config, relaxer.clone())
        .unwrap()
        .without_outputs()
        .run_with(Default::default())
        .unwrap();

    assert_eq!(report.final_generation, 3);
    assert_eq!(report.results.len(), 12);
    // Random search results carry no generation tag
    assert!(report.results.iter().all(|(_, row)| row.generation.is_none()));
    let ids: Vec<usize> = report.results.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, (0..12).collect::<Vec<_>>());
}

#[test]
fn test_loop_from_generation_zero() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config("EA", dir.path());
    config.max_generations = 5;

    let mut algo = ScriptedAlgorithm::new(1);
    algo.start_generation = 0;
    let algo = Arc::new(algo);
    let report = SearchWorkflow::new(algo.clone(), Arc::new(MockRelaxer::new()), &config)
        .unwrap()
        .without_outputs()
        .run_with(Default::default())
        .unwrap();

    assert_eq!(report.final_generation, 5);
    assert_eq!(report.outer_iterations, 6);
    assert_eq!(*algo.advanced.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_start_beyond_ceiling_runs_one_pass() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config("EA", dir.path());
    config.max_generations = 5;

    let mut algo = ScriptedAlgorithm::new(2);
    algo.start_generation = 7;
    let algo = Arc::new(algo);
    let relaxer = Arc::new(MockRelaxer::new());
    let report = SearchWorkflow::new(algo.clone(), relaxer.clone(), &config)
        .unwrap()
        .without_outputs()
        .run_with(Default::default())
        .unwrap();

    assert_eq!(report.final_generation, 7);
    assert_eq!(report.outer_iterations, 1);
    assert!(algo.advanced.lock().is_empty());
    assert_eq!(relaxer.calls(), 2);
}

#[test]
fn test_output_failure_marks_run_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("EA", dir.path());
    // A directory where the CSV should go makes the write fail
    fs::create_dir(dir.path().join(RESULTS_FILE)).unwrap();

    let err = SearchWorkflow::new(Arc::new(ScriptedAlgorithm::new(2)), Arc::new(MockRelaxer::new()), &config)
        .unwrap()
        .run_with(Default::default())
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Output { .. }));
    assert!(dir.path().join(LOCK_MARKER).exists());
    let status: RunStatus =
        serde_json::from_str(&fs::read_to_string(dir.path().join(STATUS_MARKER)).unwrap()).unwrap();
    assert_eq!(status.phase, "aborted");
    assert_eq!(status.generation, Some(3));
}

#[test]
fn test_status_counts_skips_of_collected_generation() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("EA", dir.path());
    let mut algo = ScriptedAlgorithm::new(2);
    algo.skew = 1;

    // One of the two first-generation relaxations fails, then advancing aborts
    let err = SearchWorkflow::new(Arc::new(algo), Arc::new(MockRelaxer::failing_every(2)), &config)
        .unwrap()
        .run_with(Default::default())
        .unwrap_err();
    assert!(matches!(err, WorkflowError::GenerationSkew { .. }));

    let status: RunStatus =
        serde_json::from_str(&fs::read_to_string(dir.path().join(STATUS_MARKER)).unwrap()).unwrap();
    assert_eq!(status.phase, "aborted");
    assert_eq!(status.generation, Some(1));
    assert_eq!(status.skipped, 1);
}

#[test]
fn test_every_pass_keeps_its_packed_summary() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config("EA", dir.path());

    let report = SearchWorkflow::new(Arc::new(ScriptedAlgorithm::new(2)), Arc::new(MockRelaxer::new()), &config)
        .unwrap()
        .without_outputs()
        .run_with(Default::default())
        .unwrap();

    let packed_ids: Vec<Vec<usize>> = report
        .generations
        .iter()
        .map(|g| g.packed.keys().copied().collect())
        .collect();
    assert_eq!(packed_ids, vec![vec![0, 1], vec![2, 3], vec![4, 5]]);
    assert_eq!(report.generations.iter().map(|g| g.generation).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(report.generations.last().unwrap().packed, report.packed);
}
