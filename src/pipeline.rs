//! Ahead-of-time task graph for multi-step analyses.
//!
//! Every task declares the files it reads and writes. Edges are derived from
//! those declarations (a task depends on the producer of each of its inputs)
//! plus explicit dependencies, the graph is checked for duplicate targets and
//! cycles, and tasks then run sequentially in a deterministic topological
//! order. A task whose targets exist and whose cache key matches the key
//! stored in the state file is skipped.

use crate::cluster::{ClusterConfig, ClusterExtractor, Connectivity, CorrectionPolicy, OutputMode};
use crate::error::{Error, Result};
use crate::labels::LabelDictionary;
use crate::output;
use crate::report::RegionVolumeReporter;
use crate::smoothness;
use crate::stats::{self, GroupStatistics};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Operation performed by a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    WelchTest {
        groups: Vec<Vec<PathBuf>>,
        mask: Option<PathBuf>,
        t: PathBuf,
        p: Option<PathBuf>,
        z: Option<PathBuf>,
    },
    AverageImages {
        sources: Vec<PathBuf>,
        target: PathBuf,
    },
    ExtentClustering {
        statistic: PathBuf,
        mask: Option<PathBuf>,
        threshold: f64,
        min_size: usize,
        connectivity: u8,
        target: PathBuf,
        table: Option<PathBuf>,
    },
    ProbabilityClustering {
        statistic: PathBuf,
        mask: PathBuf,
        threshold: f64,
        max_p: f64,
        connectivity: u8,
        smoothness: Option<PathBuf>,
        target: PathBuf,
        table: Option<PathBuf>,
    },
    Smoothness {
        z: PathBuf,
        mask: PathBuf,
        target: PathBuf,
    },
    VolumeReport {
        clusters: PathBuf,
        atlas: PathBuf,
        labels: PathBuf,
        min_size: Option<usize>,
        target: PathBuf,
    },
    ConvertLabels {
        source: PathBuf,
        target: PathBuf,
    },
}

impl Action {
    /// Files read by the action.
    pub fn inputs(&self) -> Vec<PathBuf> {
        match self {
            Self::WelchTest { groups, mask, .. } => groups
                .iter()
                .flatten()
                .chain(mask.iter())
                .cloned()
                .collect(),
            Self::AverageImages { sources, .. } => sources.clone(),
            Self::ExtentClustering { statistic, mask, .. } => {
                std::iter::once(statistic).chain(mask.iter()).cloned().collect()
            }
            Self::ProbabilityClustering {
                statistic,
                mask,
                smoothness,
                ..
            } => [statistic, mask]
                .into_iter()
                .chain(smoothness.iter())
                .cloned()
                .collect(),
            Self::Smoothness { z, mask, .. } => vec![z.clone(), mask.clone()],
            Self::VolumeReport {
                clusters,
                atlas,
                labels,
                ..
            } => vec![clusters.clone(), atlas.clone(), labels.clone()],
            Self::ConvertLabels { source, .. } => vec![source.clone()],
        }
    }

    /// Files written by the action.
    pub fn targets(&self) -> Vec<PathBuf> {
        match self {
            Self::WelchTest { t, p, z, .. } => std::iter::once(t)
                .chain(p.iter())
                .chain(z.iter())
                .cloned()
                .collect(),
            Self::ExtentClustering { target, table, .. }
            | Self::ProbabilityClustering { target, table, .. } => {
                std::iter::once(target).chain(table.iter()).cloned().collect()
            }
            Self::AverageImages { target, .. }
            | Self::Smoothness { target, .. }
            | Self::VolumeReport { target, .. }
            | Self::ConvertLabels { target, .. } => vec![target.clone()],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::WelchTest { .. } => "welch_test",
            Self::AverageImages { .. } => "average_images",
            Self::ExtentClustering { .. } => "extent_clustering",
            Self::ProbabilityClustering { .. } => "probability_clustering",
            Self::Smoothness { .. } => "smoothness",
            Self::VolumeReport { .. } => "volume_report",
            Self::ConvertLabels { .. } => "convert_labels",
        }
    }

    /// Perform the action.
    pub fn run(&self) -> Result<()> {
        match self {
            Self::WelchTest {
                groups,
                mask,
                t,
                p,
                z,
            } => {
                let map = GroupStatistics::compute_paths(groups, mask.as_deref())?;
                map.save(t, p.as_deref(), z.as_deref())
            }
            Self::AverageImages { sources, target } => {
                crate::nifti::save(&stats::average_paths(sources)?, target)
            }
            Self::ExtentClustering {
                statistic,
                mask,
                threshold,
                min_size,
                connectivity,
                target,
                table,
            } => {
                let config = ClusterConfig::new(*threshold, CorrectionPolicy::Extent(*min_size))
                    .with_connectivity(Connectivity::from_neighbours(*connectivity)?)
                    .with_output(OutputMode::Magnitude);
                ClusterExtractor::new(config)?
                    .run(statistic, mask.as_deref(), None, target, table.as_deref())
                    .map(|_| ())
            }
            Self::ProbabilityClustering {
                statistic,
                mask,
                threshold,
                max_p,
                connectivity,
                smoothness,
                target,
                table,
            } => {
                let policy = CorrectionPolicy::Probability { max_p: *max_p };
                let config = ClusterConfig::new(*threshold, policy)
                    .with_connectivity(Connectivity::from_neighbours(*connectivity)?);
                ClusterExtractor::new(config)?
                    .run(
                        statistic,
                        Some(mask.as_path()),
                        smoothness.as_deref(),
                        target,
                        table.as_deref(),
                    )
                    .map(|_| ())
            }
            Self::Smoothness { z, mask, target } => {
                smoothness::estimate_files(z, mask)?.save(target)
            }
            Self::VolumeReport {
                clusters,
                atlas,
                labels,
                min_size,
                target,
            } => RegionVolumeReporter::new(*min_size)
                .run(clusters, atlas, labels, target)
                .map(|_| ()),
            Self::ConvertLabels { source, target } => LabelDictionary::load(source)?.save(target),
        }
    }
}

/// Completion state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    /// Ran successfully in this execution.
    Done,
    /// Skipped: targets exist and the cache key is unchanged.
    UpToDate,
    Failed,
}

/// A node of the graph.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub action: Action,
    /// Ids of tasks that must complete first, beyond file-derived edges.
    pub depends_on: Vec<String>,
    pub state: TaskState,
}

/// Outcome of [`TaskGraph::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: usize,
    pub up_to_date: usize,
}

/// Directed acyclic graph of tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    ids: HashMap<String, usize>,
    producers: HashMap<PathBuf, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Ids and targets must be unique across the graph.
    pub fn add(&mut self, id: impl Into<String>, action: Action) -> Result<()> {
        let id = id.into();
        if self.ids.contains_key(&id) {
            return Err(Error::config(format!("duplicate task id {id:?}")));
        }
        let index = self.tasks.len();
        let targets = action.targets();
        for target in &targets {
            if let Some(&other) = self.producers.get(target) {
                return Err(Error::config(format!(
                    "{} is a target of both {:?} and {id:?}",
                    target.display(),
                    self.tasks[other].id
                )));
            }
        }
        for target in targets {
            self.producers.insert(target, index);
        }
        self.ids.insert(id.clone(), index);
        self.tasks.push(Task {
            id,
            action,
            depends_on: Vec::new(),
            state: TaskState::Pending,
        });
        Ok(())
    }

    /// Require `task` to run after `dependency`.
    pub fn add_dependency(&mut self, task: &str, dependency: &str) -> Result<()> {
        if !self.ids.contains_key(dependency) {
            return Err(Error::config(format!("unknown task {dependency:?}")));
        }
        let index = *self
            .ids
            .get(task)
            .ok_or_else(|| Error::config(format!("unknown task {task:?}")))?;
        self.tasks[index].depends_on.push(dependency.to_string());
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn state(&self, id: &str) -> Option<TaskState> {
        self.ids.get(id).map(|&i| self.tasks[i].state)
    }

    /// Indices of the direct dependencies of each task.
    fn dependencies(&self) -> Vec<Vec<usize>> {
        self.tasks
            .iter()
            .map(|task| {
                let mut deps: Vec<usize> = task
                    .action
                    .inputs()
                    .iter()
                    .filter_map(|input| self.producers.get(input).copied())
                    .chain(task.depends_on.iter().filter_map(|id| self.ids.get(id).copied()))
                    .collect();
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect()
    }

    /// Execution order: topological, ties broken by insertion order.
    pub fn plan(&self) -> Result<Vec<usize>> {
        let dependencies = self.dependencies();
        let mut dependents = vec![Vec::new(); self.tasks.len()];
        let mut remaining = vec![0usize; self.tasks.len()];
        for (task, deps) in dependencies.iter().enumerate() {
            remaining[task] = deps.len();
            for &dep in deps {
                dependents[dep].push(task);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(task, _)| Reverse(task))
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(Reverse(task)) = ready.pop() {
            order.push(task);
            for &next in &dependents[task] {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() != self.tasks.len() {
            let stuck: Vec<&str> = remaining
                .iter()
                .enumerate()
                .filter(|(_, &count)| count > 0)
                .map(|(task, _)| self.tasks[task].id.as_str())
                .collect();
            return Err(Error::config(format!(
                "task graph has a cycle through {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Run every task in plan order, skipping up-to-date ones.
    ///
    /// Cache keys are read from and written to `state_file` (JSON). The first
    /// failure marks its task `Failed`, leaves later tasks `Pending` and is
    /// returned.
    pub fn execute(&mut self, state_file: &Path) -> Result<RunSummary> {
        let order = self.plan()?;
        let mut keys = load_state(state_file)?;
        let mut summary = RunSummary::default();

        for index in order {
            let id = self.tasks[index].id.clone();
            let key = cache_key(&self.tasks[index].action)?;
            if is_up_to_date(&self.tasks[index].action, keys.get(&id), &key) {
                self.tasks[index].state = TaskState::UpToDate;
                summary.up_to_date += 1;
                debug!(task = %id, "up to date");
                continue;
            }

            info!(task = %id, action = self.tasks[index].action.name(), "running");
            self.tasks[index].state = TaskState::Running;
            if let Err(err) = self.tasks[index].action.run() {
                self.tasks[index].state = TaskState::Failed;
                warn!(task = %id, error = %err, "task failed");
                return Err(err);
            }
            self.tasks[index].state = TaskState::Done;
            summary.executed += 1;

            keys.insert(id, key);
            save_state(state_file, &keys)?;
        }
        Ok(summary)
    }

    /// Plan order with the state each task would start in: `UpToDate` when
    /// it would be skipped right now, `Pending` otherwise. A task downstream
    /// of a `Pending` task is `Pending` too, since its inputs will be rewritten.
    pub fn dry_run(&self, state_file: &Path) -> Result<Vec<(String, TaskState)>> {
        let keys = load_state(state_file)?;
        let dependencies = self.dependencies();
        let mut states = vec![TaskState::Pending; self.tasks.len()];
        let order = self.plan()?;
        for &index in &order {
            let task = &self.tasks[index];
            let upstream_pending = dependencies[index]
                .iter()
                .any(|&dep| states[dep] == TaskState::Pending);
            states[index] = match cache_key(&task.action) {
                Ok(key)
                    if !upstream_pending
                        && is_up_to_date(&task.action, keys.get(&task.id), &key) =>
                {
                    TaskState::UpToDate
                }
                _ => TaskState::Pending,
            };
        }
        Ok(order
            .into_iter()
            .map(|index| (self.tasks[index].id.clone(), states[index]))
            .collect())
    }
}

fn is_up_to_date(action: &Action, stored: Option<&String>, key: &str) -> bool {
    stored.is_some_and(|stored| stored == key) && action.targets().iter().all(|t| t.exists())
}

/// SHA-256 over the serialized action and the contents of its inputs.
pub fn cache_key(action: &Action) -> Result<String> {
    let mut hasher = Sha256::new();
    let parameters = serde_json::to_vec(action)
        .map_err(|e| Error::config(format!("cannot serialize task: {e}")))?;
    hasher.update(&parameters);

    let mut buffer = vec![0u8; 64 * 1024];
    for input in action.inputs() {
        hasher.update(input.to_string_lossy().as_bytes());
        match File::open(&input) {
            Ok(mut file) => loop {
                let read = file
                    .read(&mut buffer)
                    .map_err(|e| Error::read(input.as_path(), e))?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            },
            Err(_) => hasher.update(b"\0missing"),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

fn load_state(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let text = std::fs::read_to_string(path).map_err(|e| Error::read(path, e))?;
    serde_json::from_str(&text)
        .map_err(|e| Error::parse(path, e.line(), format!("invalid task state: {e}")))
}

fn save_state(path: &Path, keys: &BTreeMap<String, String>) -> Result<()> {
    let text = serde_json::to_string_pretty(keys)
        .map_err(|e| Error::config(format!("cannot serialize task state: {e}")))?;
    output::write_bytes_atomic(path, text.as_bytes())
}
