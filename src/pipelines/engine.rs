//! Bounded-concurrency scheduler over the task graph.
//!
//! Tasks are visited in their build order (directory nodes, then stages in registration
//! order, then sample id), so submission order is reproducible across runs. Whether a task
//! runs is decided only from the checkpoint store and current file metadata.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::task::JoinSet;

use crate::config::defs::PipelineError;
use crate::pipelines::checkpoint::{fingerprint, freshness, CheckpointRecord, CheckpointStore, Freshness};
use crate::pipelines::graph::{StageRegistry, Task, TaskId, TaskKind, TaskStatus, WorkUnit};
use crate::utils::file::{partial_path, remove_if_exists};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub concurrency_limit: usize,
    /// Ignore every checkpoint.
    pub force_all: bool,
    /// Ignore checkpoints for these stages only.
    pub force_stages: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            concurrency_limit: 1,
            force_all: false,
            force_stages: Vec::new(),
        }
    }
}

impl RunOptions {
    fn forced(&self, stage: &str) -> bool {
        self.force_all || self.force_stages.iter().any(|s| s == stage)
    }
}

#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub sample: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSummary {
    pub complete: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_tasks: Vec<TaskId>,
}

impl SampleSummary {
    pub fn status(&self) -> &'static str {
        if self.failed > 0 {
            "failed"
        } else if self.skipped > 0 {
            "incomplete"
        } else {
            "complete"
        }
    }
}

#[derive(Debug, Default)]
pub struct RunResult {
    pub statuses: BTreeMap<TaskId, TaskStatus>,
    /// Tasks whose handler ran in this invocation.
    pub executed: usize,
    /// Tasks satisfied by a fresh checkpoint.
    pub up_to_date: usize,
    pub failures: Vec<TaskFailure>,
    pub samples: BTreeMap<String, SampleSummary>,
}

impl RunResult {
    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.statuses.get(task_id).copied()
    }

    pub fn all_complete(&self) -> bool {
        self.statuses.values().all(|s| *s == TaskStatus::Complete)
    }
}

/// Planned action for one task, as reported by `Engine::plan`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    UpToDate,
    Run(String),
}

pub struct Engine {
    registry: Arc<StageRegistry>,
    store: CheckpointStore,
}

type Outcome = (usize, anyhow::Result<()>);

impl Engine {
    pub fn new(registry: Arc<StageRegistry>, store: CheckpointStore) -> Self {
        Engine { registry, store }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Which tasks would run if `run` were invoked now, without executing anything.
    /// A task downstream of one that will run is reported as running too.
    pub fn plan(&self, tasks: &[Task], options: &RunOptions) -> Result<Vec<(TaskId, PlannedAction)>, PipelineError> {
        let mut will_run: HashSet<&str> = HashSet::new();
        let mut plan = Vec::with_capacity(tasks.len());
        for task in tasks {
            let action = if task.kind == TaskKind::Directory {
                if task.outputs.iter().all(|d| d.is_dir()) {
                    PlannedAction::UpToDate
                } else {
                    PlannedAction::Run("directory missing".to_string())
                }
            } else if options.forced(&task.stage) {
                PlannedAction::Run("forced".to_string())
            } else if let Some(upstream) = task.prerequisites.iter().find(|p| will_run.contains(p.as_str())) {
                PlannedAction::Run(format!("upstream {} reruns", upstream))
            } else {
                let record = self.store.get(&task.id)?;
                match freshness(record.as_ref(), &fingerprint(&task.inputs), &fingerprint(&task.outputs)) {
                    Freshness::Fresh => PlannedAction::UpToDate,
                    Freshness::Stale(reason) => PlannedAction::Run(reason),
                }
            };
            if action != PlannedAction::UpToDate {
                will_run.insert(task.id.as_str());
            }
            plan.push((task.id.clone(), action));
        }
        Ok(plan)
    }

    /// Runs the graph to completion.
    ///
    /// # Arguments
    ///
    /// * `tasks` - Tasks in build order, as returned by `StageRegistry::build`.
    /// * `options` - Concurrency limit and force flags.
    ///
    /// # Returns
    ///
    /// The terminal status of every task. Task failures are reported in the result, not
    /// as an error; `Err` is reserved for checkpoint store failures.
    pub async fn run(&self, mut tasks: Vec<Task>, options: &RunOptions) -> Result<RunResult, PipelineError> {
        let limit = options.concurrency_limit.max(1);
        let index: HashMap<TaskId, usize> = tasks.iter().enumerate().map(|(i, t)| (t.id.clone(), i)).collect();
        for task in &tasks {
            if let Some(missing) = task.prerequisites.iter().find(|p| !index.contains_key(p.as_str())) {
                return Err(PipelineError::InvalidConfig(format!(
                    "Task {} depends on unknown task {}",
                    task.id, missing
                )));
            }
        }

        let mut result = RunResult::default();
        let mut in_flight: JoinSet<Outcome> = JoinSet::new();
        info!("Running {} tasks with up to {} in flight", tasks.len(), limit);

        loop {
            for i in 0..tasks.len() {
                if tasks[i].status() != TaskStatus::Pending {
                    continue;
                }
                let prerequisite_states: Vec<TaskStatus> = tasks[i]
                    .prerequisites
                    .iter()
                    .map(|p| tasks[index[p]].status())
                    .collect();
                if !prerequisite_states.iter().all(|s| s.is_terminal()) {
                    continue;
                }

                let blocked = match tasks[i].kind {
                    // the sentinel tolerates failed samples, but not a missing output directory
                    TaskKind::Full => tasks[i]
                        .prerequisites
                        .iter()
                        .map(|p| &tasks[index[p]])
                        .any(|p| p.kind == TaskKind::Directory && p.status() != TaskStatus::Complete),
                    _ => prerequisite_states.iter().any(|s| *s != TaskStatus::Complete),
                };
                if blocked {
                    debug!("Skipping {}: a prerequisite did not complete", tasks[i].id);
                    tasks[i].set_status(TaskStatus::Skipped)?;
                    continue;
                }

                if tasks[i].kind == TaskKind::Directory {
                    self.make_directories(&mut tasks[i], &mut result)?;
                    continue;
                }

                if tasks[i].kind == TaskKind::Full {
                    let completed: Vec<PathBuf> = tasks[i]
                        .prerequisites
                        .iter()
                        .map(|p| &tasks[index[p]])
                        .filter(|p| p.kind != TaskKind::Directory && p.status() == TaskStatus::Complete)
                        .flat_map(|p| p.outputs.iter().cloned())
                        .collect();
                    tasks[i].inputs = completed;
                }

                if !options.forced(&tasks[i].stage) {
                    let record = self.store.get(&tasks[i].id)?;
                    let state = freshness(
                        record.as_ref(),
                        &fingerprint(&tasks[i].inputs),
                        &fingerprint(&tasks[i].outputs),
                    );
                    match state {
                        Freshness::Fresh => {
                            debug!("{} is up to date", tasks[i].id);
                            tasks[i].set_status(TaskStatus::Complete)?;
                            result.up_to_date += 1;
                            continue;
                        }
                        Freshness::Stale(reason) => debug!("{} is stale: {}", tasks[i].id, reason),
                    }
                }

                if in_flight.len() >= limit {
                    break;
                }

                tasks[i].set_status(TaskStatus::Ready)?;
                self.store.remove(&tasks[i].id).await?;
                self.submit(i, &mut tasks[i], &mut in_flight)?;
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (i, outcome) = joined.map_err(|e| PipelineError::Other(anyhow::anyhow!("Task join error: {}", e)))?;
            self.settle(&mut tasks[i], outcome, &mut result).await?;
        }

        for task in &tasks {
            if task.status() == TaskStatus::Pending {
                // unreachable with a well-formed graph; recorded rather than silently dropped
                warn!("Task {} never became ready", task.id);
            }
            result.statuses.insert(task.id.clone(), task.status());
            if let Some(sample) = task.sample_id() {
                let summary = result.samples.entry(sample.to_string()).or_default();
                match task.status() {
                    TaskStatus::Complete => summary.complete += 1,
                    TaskStatus::Failed => {
                        summary.failed += 1;
                        summary.failed_tasks.push(task.id.clone());
                    }
                    _ => summary.skipped += 1,
                }
            }
        }
        Ok(result)
    }

    fn make_directories(&self, task: &mut Task, result: &mut RunResult) -> Result<(), PipelineError> {
        task.set_status(TaskStatus::Ready)?;
        task.set_status(TaskStatus::Running)?;
        for dir in &task.outputs {
            if let Err(e) = std::fs::create_dir_all(dir) {
                error!("Cannot create {}: {}", dir.display(), e);
                result.failures.push(TaskFailure {
                    task_id: task.id.clone(),
                    sample: None,
                    error: e.to_string(),
                });
                return task.set_status(TaskStatus::Failed);
            }
        }
        task.set_status(TaskStatus::Complete)
    }

    fn submit(&self, i: usize, task: &mut Task, in_flight: &mut JoinSet<Outcome>) -> Result<(), PipelineError> {
        let handler = self
            .registry
            .handler(&task.stage)
            .ok_or_else(|| PipelineError::InvalidConfig(format!("No handler registered for stage {}", task.stage)))?;
        let unit = WorkUnit {
            task_id: task.id.clone(),
            stage: task.stage.clone(),
            sample: task.sample().cloned(),
            inputs: task.inputs.clone(),
            outputs: task.outputs.clone(),
        };
        task.set_status(TaskStatus::Running)?;
        info!("Starting {}", task.id);
        in_flight.spawn(async move {
            let outcome = AssertUnwindSafe(handler.execute(&unit)).catch_unwind().await;
            match outcome {
                Ok(result) => (i, result),
                Err(_) => (i, Err(anyhow::anyhow!("handler for {} panicked", unit.task_id))),
            }
        });
        Ok(())
    }

    /// Records the outcome of one execution. A task is only marked complete after its
    /// checkpoint has been flushed.
    async fn settle(&self, task: &mut Task, outcome: anyhow::Result<()>, result: &mut RunResult) -> Result<(), PipelineError> {
        result.executed += 1;
        let outcome = outcome.and_then(|_| {
            match task.outputs.iter().find(|o| !o.exists()) {
                Some(missing) => Err(PipelineError::MissingOutput {
                    task: task.id.clone(),
                    path: missing.clone(),
                }
                .into()),
                None => Ok(()),
            }
        });

        match outcome {
            Ok(()) => {
                let record = CheckpointRecord::new(
                    TaskStatus::Complete,
                    fingerprint(&task.inputs),
                    fingerprint(&task.outputs),
                );
                self.store.put(&task.id, &record).await?;
                task.set_status(TaskStatus::Complete)?;
                info!("Completed {}", task.id);
            }
            Err(e) => {
                error!("Task {} failed: {:#}", task.id, e);
                for output in &task.outputs {
                    for path in [output.clone(), partial_path(output)] {
                        if let Err(rm) = remove_if_exists(&path) {
                            warn!("Could not remove {} after failure: {}", path.display(), rm);
                        }
                    }
                }
                let record = CheckpointRecord::new(TaskStatus::Failed, fingerprint(&task.inputs), Vec::new());
                self.store.put(&task.id, &record).await?;
                task.set_status(TaskStatus::Failed)?;
                result.failures.push(TaskFailure {
                    task_id: task.id.clone(),
                    sample: task.sample_id().map(str::to_string),
                    error: format!("{:#}", e),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::graph::{directory_task_id, StageHandler};
    use crate::pipelines::sample::{ReadFiles, Sample};
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Echo {
        dir: PathBuf,
        calls: AtomicUsize,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl StageHandler for Echo {
        fn output_dir(&self) -> Option<PathBuf> {
            Some(self.dir.clone())
        }

        fn outputs(&self, sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
            vec![self.dir.join(format!("{}.out", sample.map(|s| s.id.as_str()).unwrap_or("all")))]
        }

        async fn execute(&self, unit: &WorkUnit) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let (Some(fail), Some(sample)) = (&self.fail_for, &unit.sample) {
                if *fail == sample.id {
                    fs::write(&unit.outputs[0], "partial")?;
                    anyhow::bail!("simulated failure");
                }
            }
            let text = fs::read_to_string(&unit.inputs[0])?;
            fs::write(&unit.outputs[0], text)?;
            Ok(())
        }
    }

    fn setup(root: &Path, fail_for: Option<&str>) -> anyhow::Result<(Arc<StageRegistry>, Arc<Echo>, Vec<Sample>)> {
        let mut samples = Vec::new();
        for id in ["S1", "S2"] {
            let path = root.join(format!("{}.fastq.gz", id));
            fs::write(&path, id)?;
            samples.push(Sample { id: id.to_string(), reads: ReadFiles::Single(path) });
        }
        let first = Arc::new(Echo { dir: root.join("one.dir"), calls: AtomicUsize::new(0), fail_for: fail_for.map(String::from) });
        let second = Arc::new(Echo { dir: root.join("two.dir"), calls: AtomicUsize::new(0), fail_for: None });
        let mut registry = StageRegistry::new();
        registry.register("one", first.clone(), &[])?;
        registry.register("two", second.clone(), &["one"])?;
        Ok((Arc::new(registry), second, samples))
    }

    #[tokio::test]
    async fn test_rerun_executes_nothing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (registry, _, samples) = setup(dir.path(), None)?;
        let engine = Engine::new(registry.clone(), CheckpointStore::temporary()?);
        let options = RunOptions { concurrency_limit: 2, ..Default::default() };

        let first = engine.run(registry.build(&samples)?, &options).await?;
        assert_eq!(first.executed, 5);
        assert!(first.all_complete());

        let second = engine.run(registry.build(&samples)?, &options).await?;
        assert_eq!(second.executed, 0);
        assert_eq!(second.up_to_date, 5);

        let plan = engine.plan(&registry.build(&samples)?, &options)?;
        assert!(plan.iter().all(|(_, a)| *a == PlannedAction::UpToDate));
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_sample_scoped() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (registry, second, samples) = setup(dir.path(), Some("S1"))?;
        let engine = Engine::new(registry.clone(), CheckpointStore::temporary()?);
        let result = engine.run(registry.build(&samples)?, &RunOptions::default()).await?;

        assert_eq!(result.status("one::S1"), Some(TaskStatus::Failed));
        assert_eq!(result.status("two::S1"), Some(TaskStatus::Skipped));
        assert_eq!(result.status("one::S2"), Some(TaskStatus::Complete));
        assert_eq!(result.status("two::S2"), Some(TaskStatus::Complete));
        assert_eq!(result.status("full"), Some(TaskStatus::Complete));
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("one.dir/S1.out").exists());
        assert_eq!(result.samples["S1"].status(), "failed");
        assert_eq!(result.samples["S2"].status(), "complete");
        assert_eq!(result.failures.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_touched_input_reruns_chain() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (registry, second, samples) = setup(dir.path(), None)?;
        let engine = Engine::new(registry.clone(), CheckpointStore::temporary()?);
        engine.run(registry.build(&samples)?, &RunOptions::default()).await?;

        fs::write(dir.path().join("S2.fastq.gz"), "S2 changed")?;
        let plan = engine.plan(&registry.build(&samples)?, &RunOptions::default())?;
        let running: Vec<&str> = plan
            .iter()
            .filter(|(_, a)| *a != PlannedAction::UpToDate)
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(running, vec!["one::S2", "two::S2", "full"]);

        let result = engine.run(registry.build(&samples)?, &RunOptions::default()).await?;
        assert_eq!(result.executed, 3);
        assert_eq!(second.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read_to_string(dir.path().join("two.dir/S2.out"))?, "S2 changed");
        Ok(())
    }

    #[tokio::test]
    async fn test_unusable_output_directory_blocks_sentinel() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (registry, _, samples) = setup(dir.path(), None)?;
        let mut registry = Arc::try_unwrap(registry).map_err(|_| anyhow::anyhow!("registry still shared"))?;
        let summary_dir = dir.path().join("summary.dir");
        // a plain file where the sentinel's directory should go
        fs::write(&summary_dir, "not a directory")?;
        let sentinel = Arc::new(Echo { dir: summary_dir.clone(), calls: AtomicUsize::new(0), fail_for: None });
        registry.register_full(sentinel.clone());
        let registry = Arc::new(registry);

        let engine = Engine::new(registry.clone(), CheckpointStore::temporary()?);
        let result = engine.run(registry.build(&samples)?, &RunOptions::default()).await?;

        assert_eq!(result.status(&directory_task_id(&summary_dir)), Some(TaskStatus::Failed));
        assert_eq!(result.status("full"), Some(TaskStatus::Skipped));
        assert_eq!(sentinel.calls.load(Ordering::SeqCst), 0);
        for id in ["one::S1", "one::S2", "two::S1", "two::S2"] {
            assert_eq!(result.status(id), Some(TaskStatus::Complete));
        }
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].sample.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_force_stage() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (registry, second, samples) = setup(dir.path(), None)?;
        let engine = Engine::new(registry.clone(), CheckpointStore::temporary()?);
        engine.run(registry.build(&samples)?, &RunOptions::default()).await?;
        let options = RunOptions { force_stages: vec!["two".to_string()], ..Default::default() };
        let result = engine.run(registry.build(&samples)?, &options).await?;
        assert_eq!(second.calls.load(Ordering::SeqCst), 4);
        assert!(result.executed >= 2);
        Ok(())
    }
}
