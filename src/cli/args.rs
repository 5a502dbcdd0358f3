use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq)]
pub enum Module {
    /// Run (or resume) the preprocessing task graph.
    #[default]
    Preprocess,
    /// Merge per-sample tables level by level.
    MergeTables,
    /// Print the scheduling plan without executing anything.
    Show,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "shotgun-pipelines", version, about = "Checkpointed preprocessing and table merging for shotgun metagenomes")]
pub struct Arguments {

    #[arg(short, long, value_enum, default_value = "preprocess")]
    pub module: Module,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'c', long = "config", default_value = "pipeline.yml")]
    pub config: String,

    #[arg(short = 'i', long = "input-dir", help = "Directory holding <sample>.fastq.1.gz/.fastq.2.gz or <sample>.fastq.gz. Overrides input_dir from the config file; defaults to the working directory.")]
    pub input_dir: Option<String>,

    #[arg(short = 'o', long = "out", help = "Output directory for all stage directories. Defaults to the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(short = 'j', long = "jobs", help = "Maximum number of tasks in flight. Defaults to the number of physical cores.")]
    pub jobs: Option<usize>,

    #[arg(long, default_value_t = 64)]
    pub threads: usize,

    #[arg(long, help = "Treat every checkpoint as stale")]
    pub force: bool,

    #[arg(long = "force-stage", help = "Treat checkpoints of the named stage as stale (repeatable)")]
    pub force_stage: Vec<String>,

    #[arg(long = "state-db", help = "Checkpoint database location. Defaults to <out>/.pipeline_state.db")]
    pub state_db: Option<String>,

    #[arg(long, default_value_t = false)]
    pub skip_tool_check: bool,

    #[arg(long = "tables-dir", help = "merge_tables: directory of per-sample tables")]
    pub tables_dir: Option<String>,

    #[clap(
        long = "level",
        help = "merge_tables: NAME=SUFFIX; files ending in SUFFIX form level NAME (repeatable)"
    )]
    pub levels: Vec<String>,

    #[arg(long = "strip-suffix", help = "merge_tables: regex stripped from the end of each sample column header")]
    pub strip_suffix: Option<String>,

    #[arg(long = "drop-zero-rows", default_value_t = false)]
    pub drop_zero_rows: bool,
}
