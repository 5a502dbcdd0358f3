use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use shotgun_pipelines::pipelines::checkpoint::CheckpointStore;
use shotgun_pipelines::pipelines::engine::{Engine, RunOptions};
use shotgun_pipelines::pipelines::graph::{StageHandler, StageRegistry, WorkUnit};
use shotgun_pipelines::pipelines::sample::{ReadFiles, Sample};


/// Sleeps briefly and tracks how many executions overlap.
struct Gauge {
    dir: PathBuf,
    name: &'static str,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl StageHandler for Gauge {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.dir.clone())
    }

    fn outputs(&self, sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        sample
            .map(|s| vec![self.dir.join(format!("{}_{}.done", s.id, self.name))])
            .unwrap_or_default()
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_millis(2)).await;
        tokio::fs::write(&unit.outputs[0], unit.task_id.as_bytes()).await?;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_samples_respect_concurrency_limit() -> Result<()> {
    let root = tempfile::tempdir()?;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let sample_counts = vec![10, 200];
    let limits = vec![1, 8];

    for num_samples in &sample_counts {
        for limit in &limits {
            let work = root.path().join(format!("{}_{}", num_samples, limit));
            let samples: Vec<Sample> = (0..*num_samples)
                .map(|i| Sample {
                    id: format!("S{:04}", i),
                    reads: ReadFiles::Single(work.join(format!("S{:04}.fastq.gz", i))),
                })
                .collect();
            std::fs::create_dir_all(&work)?;
            for sample in &samples {
                std::fs::write(sample.reads.first(), b"@r\nA\n+\nI\n")?;
            }

            let mut registry = StageRegistry::new();
            let mut previous: Vec<&str> = Vec::new();
            for name in ["a", "b", "c"] {
                let gauge = Gauge {
                    dir: work.join(format!("{}.dir", name)),
                    name,
                    running: running.clone(),
                    peak: peak.clone(),
                };
                registry.register(name, Arc::new(gauge), &previous)?;
                previous = vec![name];
            }
            let registry = Arc::new(registry);
            peak.store(0, Ordering::SeqCst);

            let start = Instant::now();
            let engine = Engine::new(registry.clone(), CheckpointStore::temporary()?);
            let options = RunOptions { concurrency_limit: *limit, ..Default::default() };
            let result = engine.run(registry.build(&samples)?, &options).await?;
            eprintln!(
                "Samples: {}, limit: {}, executed: {}, peak: {}, time: {:.3}s",
                num_samples,
                limit,
                result.executed,
                peak.load(Ordering::SeqCst),
                start.elapsed().as_secs_f64()
            );

            assert!(result.all_complete());
            assert_eq!(result.executed, num_samples * 3 + 1);
            assert!(peak.load(Ordering::SeqCst) <= *limit);
            assert_eq!(running.load(Ordering::SeqCst), 0);
        }
    }
    Ok(())
}
