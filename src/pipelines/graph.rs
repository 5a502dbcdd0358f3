//! Task graph model: stages, the registry that maps stage names to handlers, and the
//! fan-out of registered stages over discovered samples.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::defs::{PipelineError, FULL_TASK};
use crate::pipelines::sample::Sample;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Complete,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Skipped)
    }

    /// Statuses only move forward within a run.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Complete)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Running, Complete)
                | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Synthetic "directory ready" node.
    Directory,
    /// One stage applied to one sample.
    Sample(Sample),
    /// Terminal sentinel after every leaf task.
    Full,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub stage: String,
    pub kind: TaskKind,
    /// Registration order of the stage; directory nodes sort first, the sentinel last.
    pub order: usize,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub prerequisites: Vec<TaskId>,
    status: TaskStatus,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Applies a forward transition; anything else is an engine bug and is refused.
    pub fn set_status(&mut self, next: TaskStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::Checkpoint(format!(
                "Illegal status transition for {}: {} -> {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn sample(&self) -> Option<&Sample> {
        match &self.kind {
            TaskKind::Sample(sample) => Some(sample),
            _ => None,
        }
    }

    pub fn sample_id(&self) -> Option<&str> {
        self.sample().map(|s| s.id.as_str())
    }
}

/// What a handler is given when its task runs.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub task_id: TaskId,
    pub stage: String,
    pub sample: Option<Sample>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

/// A pipeline stage. Handlers are written against "one or two read files" so the same
/// handler serves single-end and paired-end samples.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Directory the stage writes into; becomes a directory-ready prerequisite.
    fn output_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Declared outputs for one unit of work. `sample` is `None` for the sentinel.
    fn outputs(&self, sample: Option<&Sample>, inputs: &[PathBuf]) -> Vec<PathBuf>;

    /// Produces every declared output or fails.
    async fn execute(&self, unit: &WorkUnit) -> anyhow::Result<()>;
}

/// Sentinel used when no handler is registered for `full`.
struct NoopSentinel;

#[async_trait]
impl StageHandler for NoopSentinel {
    fn outputs(&self, _sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        Vec::new()
    }

    async fn execute(&self, _unit: &WorkUnit) -> anyhow::Result<()> {
        Ok(())
    }
}

struct StageEntry {
    name: String,
    handler: Arc<dyn StageHandler>,
    prerequisites: Vec<String>,
}

/// Explicit stage name -> handler mapping, in registration order.
pub struct StageRegistry {
    stages: Vec<StageEntry>,
    full: Arc<dyn StageHandler>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn task_id(stage: &str, sample: &str) -> TaskId {
    format!("{}::{}", stage, sample)
}

pub fn directory_task_id(dir: &std::path::Path) -> TaskId {
    format!("mkdir::{}", dir.display())
}

impl StageRegistry {
    pub fn new() -> Self {
        StageRegistry {
            stages: Vec::new(),
            full: Arc::new(NoopSentinel),
        }
    }

    /// Registers a per-sample stage. Prerequisites must already be registered, which
    /// keeps the graph acyclic by construction.
    pub fn register(
        &mut self,
        name: &str,
        handler: Arc<dyn StageHandler>,
        prerequisites: &[&str],
    ) -> Result<(), PipelineError> {
        if name == FULL_TASK || name.is_empty() || name.contains("::") {
            return Err(PipelineError::InvalidConfig(format!("Invalid stage name '{}'", name)));
        }
        if self.position(name).is_some() {
            return Err(PipelineError::InvalidConfig(format!("Stage '{}' registered twice", name)));
        }
        for prerequisite in prerequisites {
            if self.position(prerequisite).is_none() {
                return Err(PipelineError::InvalidConfig(format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    name, prerequisite
                )));
            }
        }
        self.stages.push(StageEntry {
            name: name.to_string(),
            handler,
            prerequisites: prerequisites.iter().map(|p| p.to_string()).collect(),
        });
        Ok(())
    }

    /// Handler run by the `full` sentinel once every leaf task is terminal.
    pub fn register_full(&mut self, handler: Arc<dyn StageHandler>) {
        self.full = handler;
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn handler(&self, stage: &str) -> Option<Arc<dyn StageHandler>> {
        if stage == FULL_TASK {
            return Some(self.full.clone());
        }
        self.position(stage).map(|i| self.stages[i].handler.clone())
    }

    fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == stage)
    }

    /// Instantiates one task per (stage, sample), the directory nodes the stages write
    /// into, and the `full` sentinel. Tasks come back in deterministic scheduling order.
    pub fn build(&self, samples: &[Sample]) -> Result<Vec<Task>, PipelineError> {
        let mut samples: Vec<&Sample> = samples.iter().collect();
        samples.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(pair) = samples.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(PipelineError::InputNaming(format!("Duplicate sample id '{}'", pair[0].id)));
        }

        let mut directories: BTreeSet<PathBuf> = BTreeSet::new();
        for entry in &self.stages {
            if let Some(dir) = entry.handler.output_dir() {
                directories.insert(dir);
            }
        }
        if let Some(dir) = self.full.output_dir() {
            directories.insert(dir);
        }

        let mut tasks: Vec<Task> = directories
            .iter()
            .map(|dir| Task {
                id: directory_task_id(dir),
                stage: "mkdir".to_string(),
                kind: TaskKind::Directory,
                order: 0,
                inputs: Vec::new(),
                outputs: vec![dir.clone()],
                prerequisites: Vec::new(),
                status: TaskStatus::Pending,
            })
            .collect();

        // (stage, sample) -> declared outputs, for chaining inputs
        let mut produced: BTreeMap<(String, String), Vec<PathBuf>> = BTreeMap::new();
        let mut depended_on: HashSet<TaskId> = HashSet::new();
        let mut sample_tasks: Vec<Task> = Vec::new();

        for (index, entry) in self.stages.iter().enumerate() {
            let stage_dir = entry.handler.output_dir();
            for sample in &samples {
                let mut inputs = Vec::new();
                let mut prerequisites = Vec::new();
                if entry.prerequisites.is_empty() {
                    inputs.extend(sample.reads.paths());
                }
                for prerequisite in &entry.prerequisites {
                    let key = (prerequisite.clone(), sample.id.clone());
                    if let Some(outputs) = produced.get(&key) {
                        inputs.extend(outputs.iter().cloned());
                    }
                    let id = task_id(prerequisite, &sample.id);
                    depended_on.insert(id.clone());
                    prerequisites.push(id);
                }
                if let Some(dir) = &stage_dir {
                    prerequisites.push(directory_task_id(dir));
                }
                let outputs = entry.handler.outputs(Some(sample), &inputs);
                produced.insert((entry.name.clone(), sample.id.clone()), outputs.clone());
                sample_tasks.push(Task {
                    id: task_id(&entry.name, &sample.id),
                    stage: entry.name.clone(),
                    kind: TaskKind::Sample((*sample).clone()),
                    order: index + 1,
                    inputs,
                    outputs,
                    prerequisites,
                    status: TaskStatus::Pending,
                });
            }
        }

        let leaves: Vec<&Task> = sample_tasks
            .iter()
            .filter(|t| !depended_on.contains(&t.id))
            .collect();
        let mut full_prerequisites: Vec<TaskId> = leaves.iter().map(|t| t.id.clone()).collect();
        let full_inputs: Vec<PathBuf> = leaves.iter().flat_map(|t| t.outputs.iter().cloned()).collect();
        if let Some(dir) = self.full.output_dir() {
            full_prerequisites.push(directory_task_id(&dir));
        }
        let full_outputs = self.full.outputs(None, &full_inputs);
        let full = Task {
            id: FULL_TASK.to_string(),
            stage: FULL_TASK.to_string(),
            kind: TaskKind::Full,
            order: usize::MAX,
            inputs: full_inputs,
            outputs: full_outputs,
            prerequisites: full_prerequisites,
            status: TaskStatus::Pending,
        };

        tasks.extend(sample_tasks);
        tasks.push(full);

        let mut owners: BTreeMap<&PathBuf, &str> = BTreeMap::new();
        for task in tasks.iter().filter(|t| t.kind != TaskKind::Directory) {
            for output in &task.outputs {
                if let Some(owner) = owners.insert(output, &task.id) {
                    return Err(PipelineError::InvalidConfig(format!(
                        "Tasks {} and {} both declare output {}",
                        owner,
                        task.id,
                        output.display()
                    )));
                }
            }
        }

        Ok(tasks)
    }
}
