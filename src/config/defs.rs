use std::path::PathBuf;
use thiserror::Error;

use crate::cli::Arguments;
use crate::config::params::PipelineParams;
use crate::pipelines::merge::MergeError;

// External software
pub const CDHIT_DUP_TAG: &str = "cd-hit-dup";
pub const TRIMMOMATIC_TAG: &str = "trimmomatic";
pub const SORTMERNA_TAG: &str = "sortmerna";
pub const BMTAGGER_TAG: &str = "bmtagger.sh";
pub const HISAT2_TAG: &str = "hisat2";
pub const BBDUK_TAG: &str = "bbduk.sh";


// Input naming
pub const FASTQ1_SUFFIX: &str = ".fastq.1.gz";
pub const FASTQ2_SUFFIX: &str = ".fastq.2.gz";
pub const FASTQ_SUFFIX: &str = ".fastq.gz";

// Static directory names
pub const DEDUP_DIR: &str = "reads_deduped.dir";
pub const DEADAPT_DIR: &str = "reads_adaptersRemoved.dir";
pub const RRNA_REMOVED_DIR: &str = "reads_rrnaRemoved.dir";
pub const RRNA_CLASSIFIED_DIR: &str = "reads_rrnaClassified.dir";
pub const DEHOST_DIR: &str = "reads_hostRemoved.dir";
pub const DUSTED_DIR: &str = "reads_dusted.dir";
pub const READ_COUNT_DIR: &str = "read_count_summary.dir";

// Static filenames
pub const READ_COUNT_TABLE: &str = "read_counts.tsv";
pub const PROCESSING_SUMMARY: &str = "processing_summary.tsv";
pub const RRNA_MERGED_TABLE: &str = "metatranscriptome_otus.tsv";
pub const HISAT2_MERGED_TABLE: &str = "merged_hisat2_summary.tsv";
pub const NREADS_EXT: &str = "nreads";
pub const NREADS_HEADER: &str = "nreads";
pub const STATE_DB: &str = ".pipeline_state.db";

// Static parameters
pub const TABLE_COMMENT_MARKER: &str = "#";
pub const STRATUM_DELIMITER: char = '|';
pub const FULL_TASK: &str = "full";


#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Input naming error: {0}")]
    InputNaming(String),

    #[error("Tool {tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("Expected output missing after {task}: {path:?}")]
    MissingOutput { task: String, path: PathBuf },

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("I/O error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Configuration errors abort the whole run before any task starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidConfig(_)
                | PipelineError::MissingParameter(_)
                | PipelineError::InputNaming(_)
        )
    }
}

impl From<sled::Error> for PipelineError {
    fn from(e: sled::Error) -> Self {
        PipelineError::Checkpoint(e.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


pub struct RunConfig {
    pub cwd: PathBuf,
    pub input_dir: PathBuf,
    pub out_dir: PathBuf,
    pub state_db: PathBuf,
    pub jobs: usize,
    pub params: PipelineParams,
    pub args: Arguments,
}

impl RunConfig {
    pub fn stage_dir(&self, dir_name: &str) -> PathBuf {
        self.out_dir.join(dir_name)
    }
}
