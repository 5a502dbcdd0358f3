//! Sample discovery and per-sample read file sets.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use log::{debug, info};

use crate::config::defs::{PipelineError, FASTQ1_SUFFIX, FASTQ2_SUFFIX, FASTQ_SUFFIX};

/// One (single-end) or two (paired-end) read files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFiles {
    Single(PathBuf),
    Paired(PathBuf, PathBuf),
}

impl ReadFiles {
    pub fn from_paths(paths: &[PathBuf]) -> anyhow::Result<Self> {
        match paths {
            [single] => Ok(ReadFiles::Single(single.clone())),
            [first, second] => Ok(ReadFiles::Paired(first.clone(), second.clone())),
            _ => Err(anyhow!("Expected one or two read files, got {}", paths.len())),
        }
    }

    pub fn is_paired(&self) -> bool {
        matches!(self, ReadFiles::Paired(..))
    }

    pub fn first(&self) -> &Path {
        match self {
            ReadFiles::Single(p) | ReadFiles::Paired(p, _) => p,
        }
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            ReadFiles::Single(p) => vec![p.clone()],
            ReadFiles::Paired(p1, p2) => vec![p1.clone(), p2.clone()],
        }
    }

    pub fn map(&self, f: impl Fn(&Path) -> PathBuf) -> ReadFiles {
        match self {
            ReadFiles::Single(p) => ReadFiles::Single(f(p)),
            ReadFiles::Paired(p1, p2) => ReadFiles::Paired(f(p1), f(p2)),
        }
    }
}

/// File-naming convention used to group input files into samples.
#[derive(Debug, Clone)]
pub struct SampleLayout {
    pub read1_suffix: String,
    pub read2_suffix: String,
    pub single_suffix: String,
}

impl Default for SampleLayout {
    fn default() -> Self {
        SampleLayout {
            read1_suffix: FASTQ1_SUFFIX.to_string(),
            read2_suffix: FASTQ2_SUFFIX.to_string(),
            single_suffix: FASTQ_SUFFIX.to_string(),
        }
    }
}

impl SampleLayout {
    /// File name of `reads` for `sample` under `dir` with `tag`, following this layout.
    pub fn stage_reads(&self, dir: &Path, sample: &str, tag: &str, paired: bool) -> ReadFiles {
        let base = format!("{}_{}", sample, tag);
        if paired {
            ReadFiles::Paired(
                dir.join(format!("{}{}", base, self.read1_suffix)),
                dir.join(format!("{}{}", base, self.read2_suffix)),
            )
        } else {
            ReadFiles::Single(dir.join(format!("{}{}", base, self.single_suffix)))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub id: String,
    pub reads: ReadFiles,
}

impl Sample {
    pub fn is_paired(&self) -> bool {
        self.reads.is_paired()
    }
}

#[derive(Default)]
struct Found {
    read1: Option<PathBuf>,
    read2: Option<PathBuf>,
    single: Option<PathBuf>,
}

/// Enumerates the samples in `input_dir`, sorted by id.
///
/// A sample with both mate files is paired-end; one with only the single-end suffix is
/// single-end. A lone mate, or a sample present under both conventions, is a configuration
/// error reported before any task is built.
pub fn discover(input_dir: &Path, layout: &SampleLayout) -> Result<Vec<Sample>, PipelineError> {
    let entries = fs::read_dir(input_dir).map_err(|e| {
        PipelineError::InputNaming(format!("Cannot read input directory {}: {}", input_dir.display(), e))
    })?;

    let mut found: BTreeMap<String, Found> = BTreeMap::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(stem) = name.strip_suffix(layout.read1_suffix.as_str()) {
            found.entry(stem.to_string()).or_default().read1 = Some(path.clone());
        } else if let Some(stem) = name.strip_suffix(layout.read2_suffix.as_str()) {
            found.entry(stem.to_string()).or_default().read2 = Some(path.clone());
        } else if let Some(stem) = name.strip_suffix(layout.single_suffix.as_str()) {
            found.entry(stem.to_string()).or_default().single = Some(path.clone());
        } else {
            debug!("Ignoring {} (no recognised read suffix)", name);
        }
    }

    if found.is_empty() {
        return Err(PipelineError::InputNaming(format!(
            "No input files detected in {}; check the file suffixes ({}, {}, {})",
            input_dir.display(),
            layout.read1_suffix,
            layout.read2_suffix,
            layout.single_suffix
        )));
    }

    let mut samples = Vec::with_capacity(found.len());
    for (id, files) in found {
        if id.is_empty() {
            return Err(PipelineError::InputNaming("Input file with an empty sample name".to_string()));
        }
        let reads = match files {
            Found { read1: Some(r1), read2: Some(r2), single: None } => ReadFiles::Paired(r1, r2),
            Found { read1: None, read2: None, single: Some(s) } => ReadFiles::Single(s),
            Found { read1: Some(r1), read2: None, single: None } => {
                return Err(PipelineError::InputNaming(format!(
                    "Sample {} has {} but no matching {}",
                    id,
                    r1.display(),
                    layout.read2_suffix
                )));
            }
            Found { read1: None, read2: Some(r2), single: None } => {
                return Err(PipelineError::InputNaming(format!(
                    "Sample {} has {} but no matching {}",
                    id,
                    r2.display(),
                    layout.read1_suffix
                )));
            }
            _ => {
                return Err(PipelineError::InputNaming(format!(
                    "Sample {} is present as both single-end and paired-end files",
                    id
                )));
            }
        };
        samples.push(Sample { id, reads });
    }

    let paired = samples.iter().filter(|s| s.is_paired()).count();
    info!(
        "Discovered {} samples in {} ({} paired-end, {} single-end)",
        samples.len(),
        input_dir.display(),
        paired,
        samples.len() - paired
    );
    Ok(samples)
}
