//! Task graph execution and caching.

use medvba::pipeline::{Action, TaskGraph, TaskState};
use std::path::Path;

fn convert(dir: &Path, source: &str, target: &str) -> Action {
    Action::ConvertLabels {
        source: dir.join(source),
        target: dir.join(target),
    }
}

fn chain(dir: &Path) -> TaskGraph {
    let mut graph = TaskGraph::new();
    graph.add("second", convert(dir, "b.txt", "c.txt")).unwrap();
    graph.add("first", convert(dir, "a.txt", "b.txt")).unwrap();
    graph
}

#[test]
fn test_execute_then_skip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "1 frontal\n2 parietal\n").unwrap();
    let state = dir.path().join("state.json");

    let mut graph = chain(dir.path());
    let summary = graph.execute(&state).unwrap();
    assert_eq!((summary.executed, summary.up_to_date), (2, 0));
    assert_eq!(graph.state("first"), Some(TaskState::Done));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("c.txt")).unwrap(),
        "1 frontal\n2 parietal\n"
    );

    let mut graph = chain(dir.path());
    let summary = graph.execute(&state).unwrap();
    assert_eq!((summary.executed, summary.up_to_date), (0, 2));
    assert_eq!(graph.state("second"), Some(TaskState::UpToDate));
}

#[test]
fn test_changed_input_reruns_downstream() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "1 frontal\n").unwrap();
    let state = dir.path().join("state.json");
    chain(dir.path()).execute(&state).unwrap();

    std::fs::write(dir.path().join("a.txt"), "1 occipital\n").unwrap();
    let plan = chain(dir.path()).dry_run(&state).unwrap();
    assert_eq!(
        plan,
        vec![
            ("first".to_string(), TaskState::Pending),
            ("second".to_string(), TaskState::Pending),
        ]
    );

    let summary = chain(dir.path()).execute(&state).unwrap();
    assert_eq!(summary.executed, 2);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("c.txt")).unwrap(),
        "1 occipital\n"
    );
}

#[test]
fn test_dry_run_after_success_is_up_to_date() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "1 frontal\n").unwrap();
    let state = dir.path().join("state.json");
    chain(dir.path()).execute(&state).unwrap();

    let plan = chain(dir.path()).dry_run(&state).unwrap();
    assert!(plan.iter().all(|(_, state)| *state == TaskState::UpToDate));
}

#[test]
fn test_deleted_target_reruns() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "1 frontal\n").unwrap();
    let state = dir.path().join("state.json");
    chain(dir.path()).execute(&state).unwrap();

    std::fs::remove_file(dir.path().join("c.txt")).unwrap();
    let summary = chain(dir.path()).execute(&state).unwrap();
    assert_eq!((summary.executed, summary.up_to_date), (1, 1));
}

#[test]
fn test_failure_leaves_downstream_pending() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "not-a-number frontal\n").unwrap();
    let state = dir.path().join("state.json");

    let mut graph = chain(dir.path());
    let err = graph.execute(&state).unwrap_err();
    assert!(err.to_string().contains("invalid label id"));
    assert_eq!(graph.state("first"), Some(TaskState::Failed));
    assert_eq!(graph.state("second"), Some(TaskState::Pending));
    assert!(!dir.path().join("b.txt").exists());
}
