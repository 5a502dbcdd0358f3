//! Shotgun read preprocessing: deduplication, adapter trimming, rRNA removal and
//! classification, host removal and low-complexity masking, with read counts after
//! every step.
//!
//! Each stage is a `StageHandler` registered in processing order; the task graph engine
//! fans them out over the discovered samples and resumes from the checkpoint store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tempfile::TempDir;

use crate::config::defs::{
    PipelineError, RunConfig, BBDUK_TAG, FULL_TASK, BMTAGGER_TAG, CDHIT_DUP_TAG, DEADAPT_DIR, DEDUP_DIR,
    DEHOST_DIR, DUSTED_DIR, HISAT2_MERGED_TABLE, HISAT2_TAG, PROCESSING_SUMMARY, READ_COUNT_DIR, READ_COUNT_TABLE,
    RRNA_CLASSIFIED_DIR, RRNA_MERGED_TABLE, RRNA_REMOVED_DIR, SORTMERNA_TAG, TRIMMOMATIC_TAG,
};
use crate::config::params::{DataType, HostTool};
use crate::pipelines::checkpoint::CheckpointStore;
use crate::pipelines::engine::{Engine, PlannedAction, RunOptions, RunResult};
use crate::pipelines::graph::{StageHandler, StageRegistry, Task, TaskId, WorkUnit};
use crate::pipelines::merge::{merge_files, MergeOptions, SuffixPattern};
use crate::pipelines::provenance::{count_file, write_count_file, ProvenanceStage, ProvenanceTracker};
use crate::pipelines::sample::{discover, ReadFiles, Sample, SampleLayout};
use crate::utils::command::{
    bbduk, bmtagger, cdhit, check_tools, hisat2, prefixed_reads, run_tool, sortmerna, sortmerna::SortmernaMode,
    trimmomatic,
};
use crate::utils::fastq::count_reads;
use crate::utils::file::{gzip_file, partial_path, promote_partials, remove_if_exists, snip, symlink_force, write_atomic};

pub const REMOVE_DUPLICATES: &str = "remove_duplicates";
pub const REMOVE_ADAPTERS: &str = "remove_adapters";
pub const REMOVE_RRNA: &str = "remove_rrna";
pub const CLASSIFY_RRNA: &str = "classify_rrna";
pub const REMOVE_HOST: &str = "remove_host";
pub const MASK_LOW_COMPLEXITY: &str = "mask_low_complexity";
pub const SUMMARIZE_HOST_ALIGNMENT: &str = "summarize_host_alignment";

pub const INPUT_TAG: &str = "input";
pub const DEDUP_TAG: &str = "deduped";
pub const DEADAPT_TAG: &str = "deadapt";
pub const RRNA_REMOVED_TAG: &str = "rRNAremoved";
pub const DEHOST_TAG: &str = "dehost";
pub const MASKED_TAG: &str = "masked";

/// Column suffix on per-sample OTU summaries, stripped again when they are merged.
pub const OTU_COLUMN_SUFFIX: &str = "_otus";
/// Raw `--summary-file` written next to the host-depleted reads.
pub const HISAT2_SUMMARY_SUFFIX: &str = "_hisat2_summary.txt";
/// Column suffix on per-sample host alignment tables.
pub const HISAT2_COLUMN_SUFFIX: &str = "_hisat2";

/// Where one read-producing stage puts its files.
#[derive(Debug, Clone)]
struct StageFiles {
    dir: PathBuf,
    tag: &'static str,
    layout: SampleLayout,
}

impl StageFiles {
    fn new(config: &RunConfig, dir_name: &str, tag: &'static str) -> Self {
        StageFiles {
            dir: config.stage_dir(dir_name),
            tag,
            layout: SampleLayout::default(),
        }
    }

    fn outputs(&self, sample: Option<&Sample>) -> Vec<PathBuf> {
        match sample {
            Some(sample) => self
                .layout
                .stage_reads(&self.dir, &sample.id, self.tag, sample.is_paired())
                .paths(),
            None => Vec::new(),
        }
    }

    fn log_path(&self, sample: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.log", sample, self.tag))
    }

    fn scratch(&self, sample: &str) -> Result<TempDir> {
        Ok(tempfile::Builder::new()
            .prefix(&format!(".{}_{}.", sample, self.tag))
            .tempdir_in(&self.dir)?)
    }
}

/// Read files among a task's paths; alignment summaries travel alongside the reads.
fn read_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter(|p| snip(p, HISAT2_SUMMARY_SUFFIX).is_none())
        .cloned()
        .collect()
}

/// Splits a work unit into its sample and read file sets.
fn unit_reads(unit: &WorkUnit) -> Result<(&Sample, ReadFiles, ReadFiles)> {
    let sample = unit
        .sample
        .as_ref()
        .ok_or_else(|| anyhow!("{} is not a per-sample task", unit.task_id))?;
    let inputs = ReadFiles::from_paths(&read_paths(&unit.inputs))?;
    let outputs = ReadFiles::from_paths(&read_paths(&unit.outputs))?;
    if inputs.is_paired() != outputs.is_paired() {
        return Err(anyhow!("{}: input and output mate counts differ", unit.task_id));
    }
    Ok((sample, inputs, outputs))
}

async fn compress_all(plain: &ReadFiles, gzipped: &ReadFiles) -> Result<()> {
    for (src, dst) in plain.paths().into_iter().zip(gzipped.paths()) {
        tokio::task::spawn_blocking(move || gzip_file(&src, &dst)).await??;
    }
    Ok(())
}

pub struct RemoveDuplicates {
    config: Arc<RunConfig>,
    files: StageFiles,
}

impl RemoveDuplicates {
    pub fn new(config: Arc<RunConfig>) -> Self {
        let files = StageFiles::new(&config, DEDUP_DIR, DEDUP_TAG);
        RemoveDuplicates { config, files }
    }
}

#[async_trait]
impl StageHandler for RemoveDuplicates {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.files.dir.clone())
    }

    fn outputs(&self, sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        self.files.outputs(sample)
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let (sample, inputs, outputs) = unit_reads(unit)?;
        let partial = outputs.map(partial_path);
        // cd-hit-dup only writes plain FASTQ
        let plain = partial.map(|p| p.with_extension(""));
        let params = &self.config.params.cdhit;
        let args = cdhit::arg_generator(params, &inputs, &plain);
        run_tool(&params.tool.program(CDHIT_DUP_TAG), &args, &self.files.log_path(&sample.id)).await?;
        compress_all(&plain, &partial).await?;
        for cluster_file in plain.paths() {
            remove_if_exists(&PathBuf::from(format!("{}.clstr", cluster_file.display())))?;
            remove_if_exists(&PathBuf::from(format!("{}2.clstr", cluster_file.display())))?;
        }
        promote_partials(&outputs.paths())?;
        Ok(())
    }
}

pub struct RemoveAdapters {
    config: Arc<RunConfig>,
    files: StageFiles,
}

impl RemoveAdapters {
    pub fn new(config: Arc<RunConfig>) -> Self {
        let files = StageFiles::new(&config, DEADAPT_DIR, DEADAPT_TAG);
        RemoveAdapters { config, files }
    }
}

#[async_trait]
impl StageHandler for RemoveAdapters {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.files.dir.clone())
    }

    fn outputs(&self, sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        self.files.outputs(sample)
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let (sample, inputs, outputs) = unit_reads(unit)?;
        let partial = outputs.map(partial_path);
        let unpaired1 = self.files.dir.join(format!("{}_{}_unpaired.fastq.1.gz", sample.id, self.files.tag));
        let unpaired2 = self.files.dir.join(format!("{}_{}_unpaired.fastq.2.gz", sample.id, self.files.tag));
        let params = &self.config.params.trimmomatic;
        let args = trimmomatic::arg_generator(params, &inputs, &partial, (&unpaired1, &unpaired2));
        run_tool(&params.tool.program(TRIMMOMATIC_TAG), &args, &self.files.log_path(&sample.id)).await?;
        promote_partials(&outputs.paths())?;
        Ok(())
    }
}

/// Filters rRNA with sortmerna for metatranscriptomes; metagenomes pass through as links.
pub struct RemoveRibosomalRna {
    config: Arc<RunConfig>,
    files: StageFiles,
}

impl RemoveRibosomalRna {
    pub fn new(config: Arc<RunConfig>) -> Self {
        let files = StageFiles::new(&config, RRNA_REMOVED_DIR, RRNA_REMOVED_TAG);
        RemoveRibosomalRna { config, files }
    }
}

#[async_trait]
impl StageHandler for RemoveRibosomalRna {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.files.dir.clone())
    }

    fn outputs(&self, sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        self.files.outputs(sample)
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let (sample, inputs, outputs) = unit_reads(unit)?;
        match self.config.params.data_type {
            DataType::Metagenome => {
                for (input, output) in inputs.paths().iter().zip(outputs.paths()) {
                    symlink_force(input, &output)?;
                }
            }
            DataType::Metatranscriptome => {
                let scratch = self.files.scratch(&sample.id)?;
                let prefix = scratch.path().join("other");
                let params = &self.config.params.sortmerna;
                let args = sortmerna::arg_generator(params, &inputs, scratch.path(), &prefix, SortmernaMode::Filter);
                run_tool(&params.tool.program(SORTMERNA_TAG), &args, &self.files.log_path(&sample.id)).await?;
                let produced = prefixed_reads(&prefix, inputs.is_paired(), ("_fwd", "_rev"), ".fq.gz");
                for (src, dst) in produced.paths().iter().zip(outputs.paths()) {
                    fs::rename(src, partial_path(&dst))?;
                }
                promote_partials(&outputs.paths())?;
            }
        }
        Ok(())
    }
}

/// Per-taxon read counts from a sortmerna OTU map (`<taxon> <read> <read> ...` per line).
pub fn summarize_otu_map(otu_map: &str, column: &str) -> String {
    let mut counts: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for line in otu_map.lines() {
        let mut fields = line.split_whitespace();
        if let Some(taxon) = fields.next() {
            *counts.entry(taxon).or_default() += fields.count();
        }
    }
    let mut out = format!("#taxonomy\t{}\n", column);
    for (taxon, reads) in counts {
        out.push_str(&format!("{}\t{}\n", taxon, reads));
    }
    out
}

/// Classifies rRNA reads into OTUs and writes the per-sample taxon table.
pub struct ClassifyRibosomalRna {
    config: Arc<RunConfig>,
    dir: PathBuf,
}

impl ClassifyRibosomalRna {
    pub fn new(config: Arc<RunConfig>) -> Self {
        let dir = config.stage_dir(RRNA_CLASSIFIED_DIR);
        ClassifyRibosomalRna { config, dir }
    }
}

#[async_trait]
impl StageHandler for ClassifyRibosomalRna {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.dir.clone())
    }

    fn outputs(&self, sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        match sample {
            Some(sample) => vec![
                self.dir.join(format!("{}_otu_map.txt", sample.id)),
                self.dir.join(format!("{}{}.tsv", sample.id, OTU_COLUMN_SUFFIX)),
            ],
            None => Vec::new(),
        }
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let sample = unit
            .sample
            .as_ref()
            .ok_or_else(|| anyhow!("{} is not a per-sample task", unit.task_id))?;
        let inputs = ReadFiles::from_paths(&unit.inputs)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!(".{}_otus.", sample.id))
            .tempdir_in(&self.dir)?;
        let prefix = scratch.path().join("aligned");
        let params = &self.config.params.sortmerna;
        let args = sortmerna::arg_generator(params, &inputs, scratch.path(), &prefix, SortmernaMode::OtuMap);
        let log_path = self.dir.join(format!("{}_otus.log", sample.id));
        run_tool(&params.tool.program(SORTMERNA_TAG), &args, &log_path).await?;

        let otu_map = tokio::fs::read_to_string(scratch.path().join("out").join("otu_map.txt")).await?;
        let table = summarize_otu_map(&otu_map, &format!("{}{}", sample.id, OTU_COLUMN_SUFFIX));
        write_atomic(&unit.outputs[0], otu_map.as_bytes())?;
        write_atomic(&unit.outputs[1], table.as_bytes())?;
        Ok(())
    }
}

pub struct RemoveHost {
    config: Arc<RunConfig>,
    files: StageFiles,
}

impl RemoveHost {
    pub fn new(config: Arc<RunConfig>) -> Self {
        let files = StageFiles::new(&config, DEHOST_DIR, DEHOST_TAG);
        RemoveHost { config, files }
    }

    fn summary_path(&self, sample: &str) -> PathBuf {
        self.files.dir.join(format!("{}_{}{}", sample, self.files.tag, HISAT2_SUMMARY_SUFFIX))
    }

    async fn bmtagger(&self, sample: &Sample, inputs: &ReadFiles, partial: &ReadFiles) -> Result<()> {
        let params = &self.config.params.bmtagger;
        let program = params.tool.program(BMTAGGER_TAG);
        let scratch = self.files.scratch(&sample.id)?;
        // each host genome filters what the previous one left
        let mut current = inputs.clone();
        for genome in 0..params.bitmasks.len() {
            let prefix = scratch.path().join(format!("host{}", genome));
            let args = bmtagger::arg_generator(params, genome, &current, scratch.path(), &prefix);
            let log_path = self.files.dir.join(format!("{}_{}.host{}.log", sample.id, self.files.tag, genome));
            run_tool(&program, &args, &log_path).await?;
            current = prefixed_reads(&prefix, inputs.is_paired(), ("_1", "_2"), ".fastq");
        }
        compress_all(&current, partial).await
    }

    async fn hisat2(&self, sample: &Sample, inputs: &ReadFiles, partial: &ReadFiles) -> Result<()> {
        let params = &self.config.params.hisat2;
        let unaligned = match partial {
            ReadFiles::Paired(..) => {
                let layout = &self.files.layout;
                let templated = layout.read1_suffix.replacen('1', "%", 1);
                partial_path(&self.files.dir.join(format!("{}_{}{}", sample.id, self.files.tag, templated)))
                    .to_string_lossy()
                    .into_owned()
            }
            ReadFiles::Single(path) => path.to_string_lossy().into_owned(),
        };
        let summary = self.summary_path(&sample.id);
        let args = hisat2::arg_generator(params, inputs, &unaligned, &summary);
        run_tool(&params.tool.program(HISAT2_TAG), &args, &self.files.log_path(&sample.id)).await?;
        Ok(())
    }
}

#[async_trait]
impl StageHandler for RemoveHost {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.files.dir.clone())
    }

    fn outputs(&self, sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        let mut outputs = self.files.outputs(sample);
        if let (Some(sample), HostTool::Hisat) = (sample, self.config.params.host_tool) {
            outputs.push(self.summary_path(&sample.id));
        }
        outputs
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let (sample, inputs, outputs) = unit_reads(unit)?;
        let partial = outputs.map(partial_path);
        match self.config.params.host_tool {
            HostTool::Bmtagger => self.bmtagger(sample, &inputs, &partial).await?,
            HostTool::Hisat => self.hisat2(sample, &inputs, &partial).await?,
        }
        promote_partials(&outputs.paths())?;
        Ok(())
    }
}

pub struct MaskLowComplexity {
    config: Arc<RunConfig>,
    files: StageFiles,
}

impl MaskLowComplexity {
    pub fn new(config: Arc<RunConfig>) -> Self {
        let files = StageFiles::new(&config, DUSTED_DIR, MASKED_TAG);
        MaskLowComplexity { config, files }
    }
}

#[async_trait]
impl StageHandler for MaskLowComplexity {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.files.dir.clone())
    }

    fn outputs(&self, sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        self.files.outputs(sample)
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let (sample, inputs, outputs) = unit_reads(unit)?;
        let partial = outputs.map(partial_path);
        let params = &self.config.params.bbduk;
        let args = bbduk::arg_generator(params, &inputs, &partial);
        run_tool(&params.tool.program(BBDUK_TAG), &args, &self.files.log_path(&sample.id)).await?;
        promote_partials(&outputs.paths())?;
        Ok(())
    }
}

/// Counts the reads in the first read file of its input and records it as `<sample>_<tag>.nreads`.
pub struct CountReads {
    dir: PathBuf,
    tag: &'static str,
}

impl CountReads {
    pub fn new(config: &RunConfig, tag: &'static str) -> Self {
        CountReads {
            dir: config.stage_dir(READ_COUNT_DIR),
            tag,
        }
    }
}

#[async_trait]
impl StageHandler for CountReads {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.dir.clone())
    }

    fn outputs(&self, sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        sample
            .map(|s| vec![count_file(&self.dir, &s.id, self.tag)])
            .unwrap_or_default()
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let first = read_paths(&unit.inputs)
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{} has no input reads", unit.task_id))?;
        let count = count_reads(first).await?;
        write_count_file(&unit.outputs[0], count)?;
        info!("{}: {} reads", unit.task_id, count);
        Ok(())
    }
}

/// Metrics from a hisat2 `--summary-file`, in file order.
///
/// Count lines (`850 (85.00%) aligned concordantly exactly 1 time`) give the count under
/// their description; the closing line gives `overall alignment rate` as a percentage.
/// Repeated descriptions keep their first value.
pub fn parse_hisat2_summary(text: &str) -> Vec<(String, f64)> {
    let mut metrics: Vec<(String, f64)> = Vec::new();
    for line in text.lines().map(str::trim) {
        let parsed = if let Some(rate) = line.strip_suffix("overall alignment rate") {
            rate.trim()
                .trim_end_matches('%')
                .parse::<f64>()
                .ok()
                .map(|v| ("overall alignment rate".to_string(), v))
        } else {
            line.split_once(char::is_whitespace).and_then(|(count, rest)| {
                let count = count.parse::<u64>().ok()?;
                let rest = rest.trim_start();
                // drop the "(85.00%)" share
                let rest = match rest.strip_prefix('(') {
                    Some(share) => share.split_once(')').map(|(_, r)| r).unwrap_or(share),
                    None => rest,
                };
                let label = rest.trim().trim_end_matches("; of these:").trim();
                (!label.is_empty()).then(|| (label.to_string(), count as f64))
            })
        };
        match parsed {
            Some((label, value)) if metrics.iter().any(|(l, _)| *l == label) => {
                debug!("Repeated hisat2 metric '{}' ({}) ignored", label, value)
            }
            Some(metric) => metrics.push(metric),
            None => {}
        }
    }
    metrics
}

/// Turns one sample's hisat2 summary into a `#metric` table for the cross-sample merge.
pub struct SummarizeHostAlignment {
    dir: PathBuf,
}

impl SummarizeHostAlignment {
    pub fn new(config: &RunConfig) -> Self {
        SummarizeHostAlignment { dir: config.stage_dir(DEHOST_DIR) }
    }
}

#[async_trait]
impl StageHandler for SummarizeHostAlignment {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.dir.clone())
    }

    fn outputs(&self, sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        sample
            .map(|s| vec![self.dir.join(format!("{}{}.tsv", s.id, HISAT2_COLUMN_SUFFIX))])
            .unwrap_or_default()
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let sample = unit
            .sample
            .as_ref()
            .ok_or_else(|| anyhow!("{} is not a per-sample task", unit.task_id))?;
        let summary = unit
            .inputs
            .iter()
            .find(|p| snip(p, HISAT2_SUMMARY_SUFFIX).is_some())
            .ok_or_else(|| anyhow!("{}: no hisat2 summary among its inputs", unit.task_id))?;
        let text = tokio::fs::read_to_string(summary).await?;
        let metrics = parse_hisat2_summary(&text);
        if metrics.is_empty() {
            return Err(anyhow!("No alignment metrics in {}", summary.display()));
        }
        let mut table = format!("#metric\t{}{}\n", sample.id, HISAT2_COLUMN_SUFFIX);
        for (label, value) in metrics {
            table.push_str(&format!("{}\t{}\n", label, value));
        }
        write_atomic(&unit.outputs[0], table.as_bytes())?;
        Ok(())
    }
}

/// Work done once every per-sample chain has finished: read-count collation, and the
/// merges of the per-sample OTU tables (metatranscriptomes) and host alignment
/// summaries (hisat2).
pub struct Summarize {
    config: Arc<RunConfig>,
    samples: Vec<String>,
    stages: Vec<ProvenanceStage>,
    merge_otus: bool,
    merge_host: bool,
}

impl Summarize {
    pub fn new(config: Arc<RunConfig>, samples: &[Sample], stages: Vec<ProvenanceStage>) -> Self {
        let merge_otus = config.params.data_type == DataType::Metatranscriptome;
        let merge_host = config.params.host_tool == HostTool::Hisat;
        Summarize {
            config,
            samples: samples.iter().map(|s| s.id.clone()).collect(),
            stages,
            merge_otus,
            merge_host,
        }
    }

    fn count_dir(&self) -> PathBuf {
        self.config.stage_dir(READ_COUNT_DIR)
    }

    fn merged_otus(&self) -> PathBuf {
        self.config.stage_dir(RRNA_CLASSIFIED_DIR).join(RRNA_MERGED_TABLE)
    }

    fn merged_host(&self) -> PathBuf {
        self.config.stage_dir(DEHOST_DIR).join(HISAT2_MERGED_TABLE)
    }

    /// Merges the completed per-sample tables named `*<column_suffix>.tsv`. With none
    /// completed, `target` gets a header holding only `key_label`.
    fn merge_sample_tables(&self, inputs: &[PathBuf], column_suffix: &str, key_label: &str, target: &Path) -> Result<()> {
        let file_suffix = format!("{}.tsv", column_suffix);
        let tables: Vec<PathBuf> = inputs
            .iter()
            .filter(|p| snip(p, &file_suffix).is_some())
            .cloned()
            .collect();
        if tables.is_empty() {
            warn!("No per-sample *{} tables completed; writing an empty {}", file_suffix, target.display());
            write_atomic(target, format!("{}\n", key_label).as_bytes())?;
            return Ok(());
        }
        let options = MergeOptions {
            drop_zero_rows: self.config.params.merge.drop_zero_rows,
        };
        merge_files(&tables, &SuffixPattern::new(column_suffix)?, &options, target)?;
        Ok(())
    }
}

#[async_trait]
impl StageHandler for Summarize {
    fn output_dir(&self) -> Option<PathBuf> {
        Some(self.count_dir())
    }

    fn outputs(&self, _sample: Option<&Sample>, _inputs: &[PathBuf]) -> Vec<PathBuf> {
        let mut outputs = vec![
            self.count_dir().join(READ_COUNT_TABLE),
            self.config.out_dir.join(PROCESSING_SUMMARY),
        ];
        if self.merge_otus {
            outputs.push(self.merged_otus());
        }
        if self.merge_host {
            outputs.push(self.merged_host());
        }
        outputs
    }

    async fn execute(&self, unit: &WorkUnit) -> Result<()> {
        let mut tracker = ProvenanceTracker::new();
        tracker.load_count_files(&self.count_dir(), &unit.inputs, &self.samples, &self.stages);
        let table = tracker.collate(&self.samples, &self.stages);
        if !table.warnings.is_empty() {
            warn!("{} read-count anomalies; see the log above", table.warnings.len());
        }
        table.write(&unit.outputs[0], &unit.outputs[1])?;
        info!("Wrote {}", unit.outputs[1].display());

        if self.merge_otus {
            self.merge_sample_tables(&unit.inputs, OTU_COLUMN_SUFFIX, "taxonomy", &self.merged_otus())?;
        }
        if self.merge_host {
            self.merge_sample_tables(&unit.inputs, HISAT2_COLUMN_SUFFIX, "metric", &self.merged_host())?;
        }
        Ok(())
    }
}

/// Registers the preprocessing stages for `samples` in processing order.
pub fn build_registry(config: Arc<RunConfig>, samples: &[Sample]) -> Result<StageRegistry, PipelineError> {
    let mut registry = StageRegistry::new();
    let mut provenance = vec![ProvenanceStage::new(INPUT_TAG, false)];
    let count_stage = |tag: &str| format!("count_{}", tag);

    registry.register(&count_stage(INPUT_TAG), Arc::new(CountReads::new(&config, INPUT_TAG)), &[])?;

    let read_stages: Vec<(&str, Arc<dyn StageHandler>, &'static str, Vec<&str>)> = vec![
        (REMOVE_DUPLICATES, Arc::new(RemoveDuplicates::new(config.clone())) as Arc<dyn StageHandler>, DEDUP_TAG, vec![]),
        (REMOVE_ADAPTERS, Arc::new(RemoveAdapters::new(config.clone())) as Arc<dyn StageHandler>, DEADAPT_TAG, vec![REMOVE_DUPLICATES]),
        (REMOVE_RRNA, Arc::new(RemoveRibosomalRna::new(config.clone())) as Arc<dyn StageHandler>, RRNA_REMOVED_TAG, vec![REMOVE_ADAPTERS]),
        (REMOVE_HOST, Arc::new(RemoveHost::new(config.clone())) as Arc<dyn StageHandler>, DEHOST_TAG, vec![REMOVE_RRNA]),
        (MASK_LOW_COMPLEXITY, Arc::new(MaskLowComplexity::new(config.clone())) as Arc<dyn StageHandler>, MASKED_TAG, vec![REMOVE_HOST]),
    ];

    for (name, handler, tag, prerequisites) in read_stages {
        registry.register(name, handler, &prerequisites)?;
        registry.register(&count_stage(tag), Arc::new(CountReads::new(&config, tag)), &[name])?;
        // a metagenome keeps every read through rRNA removal, so it is not a removal step there
        let removal = !(name == REMOVE_RRNA && config.params.data_type == DataType::Metagenome);
        provenance.push(ProvenanceStage::new(tag, removal));
        if name == REMOVE_ADAPTERS && config.params.data_type == DataType::Metatranscriptome {
            registry.register(CLASSIFY_RRNA, Arc::new(ClassifyRibosomalRna::new(config.clone())), &[REMOVE_ADAPTERS])?;
        }
        if name == REMOVE_HOST && config.params.host_tool == HostTool::Hisat {
            registry.register(SUMMARIZE_HOST_ALIGNMENT, Arc::new(SummarizeHostAlignment::new(&config)), &[REMOVE_HOST])?;
        }
    }

    registry.register_full(Arc::new(Summarize::new(config, samples, provenance)));
    Ok(registry)
}

fn run_options(config: &RunConfig, registry: &StageRegistry) -> Result<RunOptions, PipelineError> {
    let known = registry.stage_names();
    for stage in &config.args.force_stage {
        if stage != FULL_TASK && !known.contains(stage) {
            return Err(PipelineError::InvalidConfig(format!(
                "Unknown stage '{}' for --force-stage (known: {})",
                stage,
                known.join(", ")
            )));
        }
    }
    Ok(RunOptions {
        concurrency_limit: config.jobs,
        force_all: config.args.force,
        force_stages: config.args.force_stage.clone(),
    })
}

struct Prepared {
    engine: Engine,
    tasks: Vec<Task>,
    options: RunOptions,
}

fn prepare(config: Arc<RunConfig>) -> Result<Prepared, PipelineError> {
    config.params.validate()?;
    let samples = discover(&config.input_dir, &SampleLayout::default())?;
    let registry = Arc::new(build_registry(config.clone(), &samples)?);
    let tasks = registry.build(&samples)?;
    let options = run_options(&config, &registry)?;
    let store = CheckpointStore::open(&config.state_db)?;
    Ok(Prepared {
        engine: Engine::new(registry, store),
        tasks,
        options,
    })
}

/// Runs (or resumes) preprocessing for every sample in the input directory.
///
/// # Arguments
///
/// * `config` - Resolved run configuration.
///
/// # Returns
///
/// The per-task outcome. Configuration problems are returned as errors before any task
/// starts; task failures are recorded in the result.
pub async fn run(config: Arc<RunConfig>) -> Result<RunResult, PipelineError> {
    config.params.validate()?;
    if !config.args.skip_tool_check {
        check_tools(&config.params.required_tools())?;
    }
    fs::create_dir_all(&config.out_dir)?;
    let prepared = prepare(config)?;
    let result = prepared.engine.run(prepared.tasks, &prepared.options).await?;

    info!(
        "{} tasks executed, {} already up to date, {} failed",
        result.executed,
        result.up_to_date,
        result.failures.len()
    );
    for (sample, summary) in &result.samples {
        let first_failure = result
            .failures
            .iter()
            .find(|f| f.sample.as_deref() == Some(sample.as_str()))
            .map(|f| format!(": {}", f.error))
            .unwrap_or_default();
        let line = format!(
            "{}\t{}\tcomplete={} failed={} skipped={}{}",
            sample, summary.status(), summary.complete, summary.failed, summary.skipped, first_failure
        );
        if summary.failed > 0 {
            warn!("{}", line);
        } else {
            info!("{}", line);
        }
    }
    Ok(result)
}

/// The scheduling plan, read purely from checkpoint state.
pub async fn show(config: Arc<RunConfig>) -> Result<Vec<(TaskId, PlannedAction)>, PipelineError> {
    let prepared = prepare(config)?;
    let plan = prepared.engine.plan(&prepared.tasks, &prepared.options)?;
    for (task, action) in &plan {
        match action {
            PlannedAction::UpToDate => println!("{}\tup to date", task),
            PlannedAction::Run(reason) => println!("{}\twould run ({})", task, reason),
        }
    }
    Ok(plan)
}
