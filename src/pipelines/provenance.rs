//! Read-count provenance: surviving reads per (stage, sample), collated into an
//! attrition table.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};

use crate::config::defs::{NREADS_EXT, NREADS_HEADER};
use crate::utils::file::write_atomic;

/// A stage as it appears in the provenance table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceStage {
    pub name: String,
    /// Removal stages may only lower the count; an increase is reported as an anomaly.
    pub removal: bool,
}

impl ProvenanceStage {
    pub fn new(name: &str, removal: bool) -> Self {
        ProvenanceStage { name: name.to_string(), removal }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceWarning {
    pub sample: String,
    pub stage: String,
    pub previous_stage: String,
    pub previous: u64,
    pub count: u64,
}

/// Rows are stages, columns are samples. `None` is "unknown", never zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceTable {
    pub stages: Vec<String>,
    pub samples: Vec<String>,
    pub cells: Vec<Vec<Option<u64>>>,
    pub warnings: Vec<ProvenanceWarning>,
}

#[derive(Debug, Default)]
pub struct ProvenanceTracker {
    counts: BTreeMap<(String, String), u64>,
}

/// Path of the count file for one (sample, stage).
pub fn count_file(dir: &Path, sample: &str, stage: &str) -> PathBuf {
    dir.join(format!("{}_{}.{}", sample, stage, NREADS_EXT))
}

pub fn write_count_file(path: &Path, count: u64) -> Result<()> {
    write_atomic(path, format!("{}\n{}\n", NREADS_HEADER, count).as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub fn read_count_file(path: &Path) -> Result<u64> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    match (lines.next(), lines.next()) {
        (Some(header), Some(value)) if header == NREADS_HEADER => value
            .parse::<u64>()
            .map_err(|e| anyhow!("Invalid count '{}' in {}: {}", value, path.display(), e)),
        _ => Err(anyhow!("Malformed count file {}", path.display())),
    }
}

impl ProvenanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&mut self, sample: &str, stage: &str, count: u64) {
        self.counts.insert((stage.to_string(), sample.to_string()), count);
    }

    pub fn count(&self, sample: &str, stage: &str) -> Option<u64> {
        self.counts.get(&(stage.to_string(), sample.to_string())).copied()
    }

    /// Re-derives counts from the count files of this run's completed counting tasks.
    /// A count file absent from `completed` stays unknown even if an earlier run left it
    /// on disk; unreadable ones are logged and also stay unknown.
    pub fn load_count_files(&mut self, dir: &Path, completed: &[PathBuf], samples: &[String], stages: &[ProvenanceStage]) {
        let completed: HashSet<&PathBuf> = completed.iter().collect();
        for sample in samples {
            for stage in stages {
                let path = count_file(dir, sample, &stage.name);
                if !completed.contains(&path) {
                    if path.exists() {
                        debug!("Ignoring {} left by an earlier run", path.display());
                    }
                    continue;
                }
                match read_count_file(&path) {
                    Ok(count) => self.record_count(sample, &stage.name, count),
                    Err(e) => warn!("Ignoring count for {} at {}: {:#}", sample, stage.name, e),
                }
            }
        }
    }

    /// Builds the stage x sample table and checks removal stages against the closest
    /// earlier stage with a known count for the same sample.
    pub fn collate(&self, samples: &[String], stages: &[ProvenanceStage]) -> ProvenanceTable {
        let cells: Vec<Vec<Option<u64>>> = stages
            .iter()
            .map(|stage| samples.iter().map(|sample| self.count(sample, &stage.name)).collect())
            .collect();

        let mut warnings = Vec::new();
        for (column, sample) in samples.iter().enumerate() {
            let mut previous: Option<(usize, u64)> = None;
            for (row, stage) in stages.iter().enumerate() {
                let Some(count) = cells[row][column] else {
                    continue;
                };
                if let Some((prev_row, prev_count)) = previous {
                    if stage.removal && count > prev_count {
                        warn!(
                            "Read count for {} rose from {} after {} to {} after {}",
                            sample, prev_count, stages[prev_row].name, count, stage.name
                        );
                        warnings.push(ProvenanceWarning {
                            sample: sample.clone(),
                            stage: stage.name.clone(),
                            previous_stage: stages[prev_row].name.clone(),
                            previous: prev_count,
                            count,
                        });
                    }
                }
                previous = Some((row, count));
            }
        }
        debug!("Collated read counts for {} samples over {} stages", samples.len(), stages.len());

        ProvenanceTable {
            stages: stages.iter().map(|s| s.name.clone()).collect(),
            samples: samples.to_vec(),
            cells,
            warnings,
        }
    }
}

fn cell(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl ProvenanceTable {
    pub fn to_tsv(&self) -> String {
        let mut out = String::new();
        out.push_str("stage");
        for sample in &self.samples {
            out.push('\t');
            out.push_str(sample);
        }
        out.push('\n');
        for (stage, row) in self.stages.iter().zip(&self.cells) {
            out.push_str(stage);
            for value in row {
                out.push('\t');
                out.push_str(&cell(*value));
            }
            out.push('\n');
        }
        out
    }

    /// Per-sample attrition: reads lost at each step and as a share of the input.
    /// The first stage is taken as the input count; unknown values give blank cells.
    pub fn processing_summary(&self) -> String {
        let mut out = String::from("sample_id\tinput_reads\toutput_reads");
        let steps = self.stages.iter().skip(1);
        for stage in steps.clone() {
            out.push_str(&format!("\t{}_lost", stage));
        }
        for stage in steps {
            out.push_str(&format!("\t{}_percent_lost", stage));
        }
        out.push_str("\tremaining_percent\n");

        for (column, sample) in self.samples.iter().enumerate() {
            let values: Vec<Option<u64>> = self.cells.iter().map(|row| row[column]).collect();
            let input = values.first().copied().flatten();
            let output = values.last().copied().flatten();

            let lost: Vec<Option<i64>> = values
                .windows(2)
                .map(|pair| match (pair[0], pair[1]) {
                    (Some(before), Some(after)) => Some(before as i64 - after as i64),
                    _ => None,
                })
                .collect();
            let percent = |n: Option<i64>| match (n, input) {
                (Some(n), Some(total)) if total > 0 => format!("{:.2}", n as f64 * 100.0 / total as f64),
                _ => String::new(),
            };

            out.push_str(&format!("{}\t{}\t{}", sample, cell(input), cell(output)));
            for n in &lost {
                out.push_str(&format!("\t{}", n.map(|v| v.to_string()).unwrap_or_default()));
            }
            for n in &lost {
                out.push_str(&format!("\t{}", percent(*n)));
            }
            let remaining = percent(output.map(|v| v as i64));
            out.push_str(&format!("\t{}\n", remaining));
        }
        out
    }

    pub fn write(&self, table_path: &Path, summary_path: &Path) -> Result<()> {
        write_atomic(table_path, self.to_tsv().as_bytes())
            .with_context(|| format!("Failed to write {}", table_path.display()))?;
        write_atomic(summary_path, self.processing_summary().as_bytes())
            .with_context(|| format!("Failed to write {}", summary_path.display()))?;
        Ok(())
    }
}
