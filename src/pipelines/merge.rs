//! Cross-sample table merge.
//!
//! Per-sample tables are sparse, tab-separated, with a header whose first token carries a
//! comment marker naming the feature-key column. Merging takes the union of feature keys,
//! names each column by a canonical sample id and fills absent cells with zero.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use futures::future::join_all;
use log::{info, warn};
use regex::Regex;
use thiserror::Error;

use crate::config::defs::{STRATUM_DELIMITER, TABLE_COMMENT_MARKER};
use crate::utils::file::{open_reader, write_atomic};

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Failed to read table {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Table {path:?} is empty")]
    EmptyTable { path: PathBuf },

    #[error("Table {path:?}: header must begin with '{marker}' followed by the feature-key label")]
    MissingKeyMarker { path: PathBuf, marker: String },

    #[error("Table {path:?} has no value columns")]
    NoValueColumns { path: PathBuf },

    #[error("Table {path:?} line {line}: expected {expected} fields, found {found}")]
    RaggedRow { path: PathBuf, line: usize, expected: usize, found: usize },

    #[error("Table {path:?} line {line}: value '{value}' is not numeric")]
    BadValue { path: PathBuf, line: usize, value: String },

    #[error("Table {path:?}: feature '{key}' appears more than once")]
    DuplicateFeature { path: PathBuf, key: String },

    #[error("Tables {first:?} and {second:?} both map to sample id '{id}'")]
    DuplicateSample { id: String, first: PathBuf, second: PathBuf },

    #[error("Table {path:?} has key column '{found}' but {reference:?} has '{expected}'")]
    KeyMismatch { path: PathBuf, found: String, reference: PathBuf, expected: String },

    #[error("No tables to merge for level '{0}'")]
    NoTables(String),

    #[error("Invalid suffix pattern '{pattern}': {error}")]
    BadPattern { pattern: String, error: String },
}

/// One sample's sparse table as read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutputTable {
    pub source: PathBuf,
    pub key_label: String,
    pub columns: Vec<String>,
    pub rows: Vec<(String, Vec<f64>)>,
}

impl StageOutputTable {
    pub fn read(path: &Path) -> Result<Self, MergeError> {
        let io_err = |e: std::io::Error| MergeError::Io { path: path.to_path_buf(), error: e.to_string() };
        let mut text = String::new();
        open_reader(path).map_err(io_err)?.read_to_string(&mut text).map_err(io_err)?;
        Self::parse(path, &text)
    }

    pub fn parse(source: &Path, text: &str) -> Result<Self, MergeError> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let Some((_, header)) = lines.next() else {
            return Err(MergeError::EmptyTable { path: source.to_path_buf() });
        };

        let fields: Vec<&str> = header.split('\t').collect();
        let key_label = fields[0]
            .strip_prefix(TABLE_COMMENT_MARKER)
            .map(|label| label.trim().to_lowercase())
            .filter(|label| !label.is_empty())
            .ok_or_else(|| MergeError::MissingKeyMarker {
                path: source.to_path_buf(),
                marker: TABLE_COMMENT_MARKER.to_string(),
            })?;
        let columns: Vec<String> = fields[1..].iter().map(|c| c.trim().to_string()).collect();
        if columns.is_empty() {
            return Err(MergeError::NoValueColumns { path: source.to_path_buf() });
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut rows = Vec::new();
        for (number, line) in lines {
            let line_no = number + 1;
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != columns.len() + 1 {
                return Err(MergeError::RaggedRow {
                    path: source.to_path_buf(),
                    line: line_no,
                    expected: columns.len() + 1,
                    found: fields.len(),
                });
            }
            let key = fields[0];
            if !seen.insert(key) {
                return Err(MergeError::DuplicateFeature { path: source.to_path_buf(), key: key.to_string() });
            }
            let values = fields[1..]
                .iter()
                .map(|v| {
                    v.trim().parse::<f64>().ok().filter(|x| x.is_finite()).ok_or_else(|| MergeError::BadValue {
                        path: source.to_path_buf(),
                        line: line_no,
                        value: v.to_string(),
                    })
                })
                .collect::<Result<Vec<f64>, MergeError>>()?;
            rows.push((key.to_string(), values));
        }

        Ok(StageOutputTable { source: source.to_path_buf(), key_label, columns, rows })
    }
}

/// Suffix stripped from a header token to obtain the canonical sample id.
#[derive(Debug, Clone)]
pub struct SuffixPattern {
    regex: Regex,
}

impl SuffixPattern {
    /// `pattern` is a regular expression anchored at the end of the token and matched
    /// case-insensitively. An empty pattern strips nothing. Canonical ids are lower-cased,
    /// so `S1_otus` and `s1_OTUS` name the same sample.
    pub fn new(pattern: &str) -> Result<Self, MergeError> {
        let anchored = if pattern.is_empty() { "$^".to_string() } else { format!("(?i)(?:{})$", pattern) };
        let regex = Regex::new(&anchored).map_err(|e| MergeError::BadPattern {
            pattern: pattern.to_string(),
            error: e.to_string(),
        })?;
        Ok(SuffixPattern { regex })
    }

    pub fn canonicalize(&self, token: &str) -> String {
        let token = token.trim();
        let stripped = self.regex.replace(token, "");
        if stripped.is_empty() {
            token.to_lowercase()
        } else {
            stripped.to_lowercase()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Drop rows whose total across all samples is zero. Each row is judged on its own
    /// total, so stratified rows are kept or dropped independently of their parent.
    pub drop_zero_rows: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedTable {
    pub key_label: String,
    pub columns: Vec<String>,
    pub rows: Vec<(String, Vec<f64>)>,
}

impl MergedTable {
    pub fn value(&self, key: &str, column: &str) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows.iter().find(|(k, _)| k == key).map(|(_, v)| v[col])
    }

    /// Rows keyed `feature|stratum`.
    pub fn stratified_rows(&self) -> usize {
        self.rows.iter().filter(|(k, _)| k.contains(STRATUM_DELIMITER)).count()
    }

    pub fn to_tsv(&self) -> String {
        let mut out = self.key_label.clone();
        for column in &self.columns {
            out.push('\t');
            out.push_str(column);
        }
        out.push('\n');
        for (key, values) in &self.rows {
            out.push_str(key);
            for value in values {
                out.push('\t');
                out.push_str(&value.to_string());
            }
            out.push('\n');
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<(), MergeError> {
        write_atomic(path, self.to_tsv().as_bytes()).map_err(|e| MergeError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }
}

/// Merges per-sample tables into one wide table.
///
/// # Arguments
///
/// * `tables` - Parsed per-sample tables, in any order.
/// * `pattern` - Suffix stripped from each value-column header to name the sample.
/// * `options` - Row filtering.
///
/// # Returns
///
/// The merged table: one row per feature key in the union, one column per canonical
/// sample id sorted lexicographically, rows by descending total then key.
pub fn merge(tables: &[StageOutputTable], pattern: &SuffixPattern, options: &MergeOptions) -> Result<MergedTable, MergeError> {
    let mut tables: Vec<&StageOutputTable> = tables.iter().collect();
    tables.sort_by(|a, b| a.source.cmp(&b.source));
    let Some(reference) = tables.first() else {
        return Err(MergeError::NoTables(String::new()));
    };

    let mut owners: BTreeMap<String, &Path> = BTreeMap::new();
    for table in &tables {
        if table.key_label != reference.key_label {
            return Err(MergeError::KeyMismatch {
                path: table.source.clone(),
                found: table.key_label.clone(),
                reference: reference.source.clone(),
                expected: reference.key_label.clone(),
            });
        }
        for column in &table.columns {
            let id = pattern.canonicalize(column);
            if let Some(first) = owners.insert(id.clone(), &table.source) {
                return Err(MergeError::DuplicateSample {
                    id,
                    first: first.to_path_buf(),
                    second: table.source.clone(),
                });
            }
        }
    }

    let columns: Vec<String> = owners.keys().cloned().collect();
    let position: HashMap<&str, usize> = columns.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();

    let mut cells: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for table in &tables {
        let targets: Vec<usize> = table.columns.iter().map(|c| position[pattern.canonicalize(c).as_str()]).collect();
        for (key, values) in &table.rows {
            let row = cells.entry(key.as_str()).or_insert_with(|| vec![0.0; columns.len()]);
            for (target, value) in targets.iter().zip(values) {
                row[*target] = *value;
            }
        }
    }

    let mut rows: Vec<(String, Vec<f64>, f64)> = cells
        .into_iter()
        .map(|(key, values)| {
            let total: f64 = values.iter().sum();
            (key.to_string(), values, total)
        })
        .collect();
    if options.drop_zero_rows {
        rows.retain(|(_, _, total)| *total != 0.0);
    }
    rows.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(&b.0)));

    Ok(MergedTable {
        key_label: reference.key_label.clone(),
        columns,
        rows: rows.into_iter().map(|(key, values, _)| (key, values)).collect(),
    })
}

/// Reads, merges and atomically writes one level.
pub fn merge_files(
    paths: &[PathBuf],
    pattern: &SuffixPattern,
    options: &MergeOptions,
    out_path: &Path,
) -> Result<MergedTable, MergeError> {
    let tables = paths
        .iter()
        .map(|p| StageOutputTable::read(p))
        .collect::<Result<Vec<_>, MergeError>>()?;
    let merged = merge(&tables, pattern, options)?;
    merged.write(out_path)?;
    info!(
        "Merged {} tables into {} ({} rows, {} stratified, x {} samples)",
        tables.len(),
        out_path.display(),
        merged.rows.len(),
        merged.stratified_rows(),
        merged.columns.len()
    );
    Ok(merged)
}

/// One independent merge dimension: every table whose file name ends with `file_suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeLevel {
    pub name: String,
    pub file_suffix: String,
}

impl MergeLevel {
    /// Parses `NAME=SUFFIX`.
    pub fn parse(arg: &str) -> Result<Self, String> {
        match arg.split_once('=') {
            Some((name, suffix)) if !name.trim().is_empty() && !suffix.trim().is_empty() => Ok(MergeLevel {
                name: name.trim().to_string(),
                file_suffix: suffix.trim().to_string(),
            }),
            _ => Err(format!("Expected NAME=SUFFIX, got '{}'", arg)),
        }
    }

    pub fn output_path(&self, out_dir: &Path) -> PathBuf {
        out_dir.join(format!("merged_{}.tsv", self.name))
    }

    pub fn collect_files(&self, dir: &Path) -> Result<Vec<PathBuf>, MergeError> {
        let io_err = |e: std::io::Error| MergeError::Io { path: dir.to_path_buf(), error: e.to_string() };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&self.file_suffix));
            if matches && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(MergeError::NoTables(self.name.clone()));
        }
        Ok(files)
    }
}

/// Merges every level independently; a failing level does not affect the others.
pub async fn merge_levels(
    levels: &[MergeLevel],
    tables_dir: &Path,
    out_dir: &Path,
    pattern: &SuffixPattern,
    options: &MergeOptions,
) -> Vec<(String, Result<PathBuf, MergeError>)> {
    let jobs = levels.iter().map(|level| {
        let level = level.clone();
        let tables_dir = tables_dir.to_path_buf();
        let out_path = level.output_path(out_dir);
        let target = out_path.clone();
        let pattern = pattern.clone();
        let options = options.clone();
        async move {
            let name = level.name.clone();
            let joined = tokio::task::spawn_blocking(move || -> Result<PathBuf, MergeError> {
                let files = level.collect_files(&tables_dir)?;
                merge_files(&files, &pattern, &options, &out_path)?;
                Ok(out_path)
            })
            .await;
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(MergeError::Io { path: target, error: e.to_string() }),
            };
            if let Err(e) = &result {
                warn!("Merge of level {} failed: {}", name, e);
            }
            (name, result)
        }
    });
    join_all(jobs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table(name: &str, text: &str) -> StageOutputTable {
        StageOutputTable::parse(Path::new(name), text).unwrap()
    }

    #[test]
    fn test_parse_header_marker() {
        let t = table("a.tsv", "# Gene Family\tA_Abundance\nk1\t1\nk2\t2.5\n");
        assert_eq!(t.key_label, "gene family");
        assert_eq!(t.columns, vec!["A_Abundance"]);
        assert_eq!(t.rows[1], ("k2".to_string(), vec![2.5]));

        let err = StageOutputTable::parse(Path::new("b.tsv"), "taxonomy\tB\nx\t1\n").unwrap_err();
        assert!(matches!(err, MergeError::MissingKeyMarker { .. }));
        let err = StageOutputTable::parse(Path::new("c.tsv"), "#taxonomy\tC\nx\tn/a\n").unwrap_err();
        assert!(matches!(err, MergeError::BadValue { line: 2, .. }));
    }

    #[test]
    fn test_union_and_fill() -> anyhow::Result<()> {
        let a = table("A.tsv", "#feature\tA\nk1\t1\nk2\t2\n");
        let b = table("B.tsv", "#feature\tB\nk2\t3\nk3\t4\n");
        let merged = merge(&[b, a], &SuffixPattern::new("")?, &MergeOptions::default())?;
        assert_eq!(merged.columns, vec!["a", "b"]);
        assert_eq!(merged.rows.len(), 3);
        assert_eq!(merged.value("k1", "a"), Some(1.0));
        assert_eq!(merged.value("k1", "b"), Some(0.0));
        assert_eq!(merged.value("k2", "b"), Some(3.0));
        assert_eq!(merged.value("k3", "a"), Some(0.0));
        // totals: k2=5, k3=4, k1=1
        assert_eq!(merged.to_tsv(), "feature\ta\tb\nk2\t2\t3\nk3\t0\t4\nk1\t1\t0\n");
        Ok(())
    }

    #[test]
    fn test_suffix_is_stripped_case_insensitively() -> anyhow::Result<()> {
        let pattern = SuffixPattern::new("_Abundance(-RPKs)?")?;
        assert_eq!(pattern.canonicalize("S1_abundance-rpks"), "s1");
        assert_eq!(pattern.canonicalize("S2_ABUNDANCE"), "s2");
        assert_eq!(pattern.canonicalize("S3"), "s3");
        assert!(SuffixPattern::new("(").is_err());
        Ok(())
    }

    #[test]
    fn test_ids_differing_only_in_case_collide() -> anyhow::Result<()> {
        let a = table("run1/A.tsv", "#taxon\tS1_otus\nx\t1\n");
        let b = table("run2/B.tsv", "#taxon\ts1_OTUS\ny\t2\n");
        let err = merge(&[a, b], &SuffixPattern::new("_otus")?, &MergeOptions::default()).unwrap_err();
        match &err {
            MergeError::DuplicateSample { id, .. } => assert_eq!(id, "s1"),
            other => panic!("unexpected error: {}", other),
        }
        let message = err.to_string();
        assert!(message.contains("run1/A.tsv"));
        assert!(message.contains("run2/B.tsv"));
        Ok(())
    }

    #[test]
    fn test_values_print_shortest_exact_form() -> anyhow::Result<()> {
        let a = table("A.tsv", "#gene family\tA\nbig\t123456789012\nrpk\t0.000125\nhalf\t2.5\n");
        let merged = merge(&[a], &SuffixPattern::new("")?, &MergeOptions::default())?;
        assert_eq!(merged.to_tsv(), "gene family\ta\nbig\t123456789012\nhalf\t2.5\nrpk\t0.000125\n");
        Ok(())
    }

    #[test]
    fn test_drop_zero_rows_is_per_row() -> anyhow::Result<()> {
        let a = table("A.tsv", "#pathway\tA\npwyX\t0\npwyX|g__Genus\t2\npwyY\t0\n");
        let kept = merge(&[a.clone()], &SuffixPattern::new("")?, &MergeOptions::default())?;
        assert_eq!(kept.rows.len(), 3);
        let dropped = merge(&[a], &SuffixPattern::new("")?, &MergeOptions { drop_zero_rows: true })?;
        let keys: Vec<&str> = dropped.rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["pwyX|g__Genus"]);
        Ok(())
    }

    #[test]
    fn test_key_mismatch_and_duplicate_feature() -> anyhow::Result<()> {
        let a = table("A.tsv", "#taxonomy\tA\nx\t1\n");
        let b = table("B.tsv", "#pathway\tB\nx\t1\n");
        let err = merge(&[a, b], &SuffixPattern::new("")?, &MergeOptions::default()).unwrap_err();
        assert!(matches!(err, MergeError::KeyMismatch { .. }));

        let err = StageOutputTable::parse(Path::new("d.tsv"), "#taxonomy\tD\nx\t1\nx\t2\n").unwrap_err();
        assert!(matches!(err, MergeError::DuplicateFeature { .. }));
        assert!(matches!(
            merge(&[], &SuffixPattern::new("")?, &MergeOptions::default()),
            Err(MergeError::NoTables(_))
        ));
        Ok(())
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(
            MergeLevel::parse("genus=.genus.tsv"),
            Ok(MergeLevel { name: "genus".to_string(), file_suffix: ".genus.tsv".to_string() })
        );
        assert!(MergeLevel::parse("genus").is_err());
        assert!(MergeLevel::parse("=x").is_err());
    }

    #[tokio::test]
    async fn test_merge_levels_independently() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let out = tempdir()?;
        std::fs::write(dir.path().join("S1.genus.tsv"), "#taxon\tS1_otus\ng__A\t5\n")?;
        std::fs::write(dir.path().join("S2.genus.tsv"), "#taxon\tS2_otus\ng__B\t7\n")?;
        std::fs::write(dir.path().join("S1.phylum.tsv"), "#taxon\tS1_otus\np__A\t5\n")?;
        std::fs::write(dir.path().join("S1b.phylum.tsv"), "#taxon\ts1_OTUS\np__B\t1\n")?;

        let levels = vec![
            MergeLevel::parse("genus=.genus.tsv").map_err(anyhow::Error::msg)?,
            MergeLevel::parse("phylum=.phylum.tsv").map_err(anyhow::Error::msg)?,
        ];
        let results = merge_levels(&levels, dir.path(), out.path(), &SuffixPattern::new("_otus")?, &MergeOptions::default()).await;

        assert_eq!(results[0].0, "genus");
        let genus_path = results[0].1.as_ref().map_err(|e| anyhow::anyhow!("{}", e))?;
        assert_eq!(std::fs::read_to_string(genus_path)?, "taxon\ts1\ts2\ng__B\t0\t7\ng__A\t5\t0\n");
        assert!(matches!(results[1].1, Err(MergeError::DuplicateSample { .. })));
        assert!(!out.path().join("merged_phylum.tsv").exists());
        Ok(())
    }
}
