//! Typed view of the `pipeline.yml` parameter file.
//!
//! Every field has a default so a minimal file only names what differs from the
//! stock HMP-style preprocessing. `validate` enforces the parameters that the
//! selected stages cannot run without.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::defs::{
    PipelineError, BBDUK_TAG, BMTAGGER_TAG, CDHIT_DUP_TAG, HISAT2_TAG, SORTMERNA_TAG,
    TRIMMOMATIC_TAG,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Metagenome,
    Metatranscriptome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostTool {
    #[default]
    Bmtagger,
    Hisat,
}

/// Settings shared by every external tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolParams {
    pub executable: Option<String>,
    pub options: String,
    pub threads: usize,
}

impl Default for ToolParams {
    fn default() -> Self {
        ToolParams {
            executable: None,
            options: String::new(),
            threads: 1,
        }
    }
}

impl ToolParams {
    pub fn program(&self, tag: &str) -> String {
        self.executable.clone().unwrap_or_else(|| tag.to_string())
    }

    pub fn option_args(&self) -> Vec<String> {
        self.options.split_whitespace().map(str::to_string).collect()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CdhitParams {
    #[serde(flatten)]
    pub tool: ToolParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrimmomaticParams {
    #[serde(flatten)]
    pub tool: ToolParams,
    pub adapters: Option<PathBuf>,
    pub seed_mismatches: u32,
    pub palindrome_clip_threshold: u32,
    pub simple_clip_threshold: u32,
    pub steps: String,
}

impl Default for TrimmomaticParams {
    fn default() -> Self {
        TrimmomaticParams {
            tool: ToolParams::default(),
            adapters: None,
            seed_mismatches: 2,
            palindrome_clip_threshold: 30,
            simple_clip_threshold: 10,
            steps: "LEADING:3 TRAILING:3 SLIDINGWINDOW:4:15 MINLEN:36".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SortmernaParams {
    #[serde(flatten)]
    pub tool: ToolParams,
    pub references: Vec<PathBuf>,
    pub index_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BmtaggerParams {
    #[serde(flatten)]
    pub tool: ToolParams,
    pub bitmasks: Vec<PathBuf>,
    pub srprism_indexes: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Hisat2Params {
    #[serde(flatten)]
    pub tool: ToolParams,
    pub index: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BbdukParams {
    #[serde(flatten)]
    pub tool: ToolParams,
    pub entropy: f64,
    pub entropy_window: u32,
    pub entropy_k: u32,
    /// Soft-mask low complexity regions instead of discarding reads.
    pub mask: bool,
}

impl Default for BbdukParams {
    fn default() -> Self {
        BbdukParams {
            tool: ToolParams::default(),
            entropy: 0.6,
            entropy_window: 50,
            entropy_k: 5,
            mask: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeParams {
    pub strip_suffix: String,
    pub drop_zero_rows: bool,
}

impl Default for MergeParams {
    fn default() -> Self {
        MergeParams {
            strip_suffix: "_otus".to_string(),
            drop_zero_rows: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineParams {
    pub input_dir: Option<PathBuf>,
    pub data_type: DataType,
    pub host_tool: HostTool,
    pub cdhit: CdhitParams,
    pub trimmomatic: TrimmomaticParams,
    pub sortmerna: SortmernaParams,
    pub bmtagger: BmtaggerParams,
    pub hisat2: Hisat2Params,
    pub bbduk: BbdukParams,
    pub merge: MergeParams,
}

impl PipelineParams {
    pub fn from_yaml_str(text: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(text)
            .map_err(|e| PipelineError::InvalidConfig(format!("Cannot parse parameters: {}", e)))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Checks the parameters the configured stages depend on.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.trimmomatic.adapters.is_none() {
            return Err(PipelineError::MissingParameter("trimmomatic.adapters".to_string()));
        }
        if self.data_type == DataType::Metatranscriptome && self.sortmerna.references.is_empty() {
            return Err(PipelineError::MissingParameter(
                "sortmerna.references (required for metatranscriptome data)".to_string(),
            ));
        }
        match self.host_tool {
            HostTool::Bmtagger => {
                if self.bmtagger.bitmasks.is_empty() {
                    return Err(PipelineError::MissingParameter("bmtagger.bitmasks".to_string()));
                }
                if self.bmtagger.bitmasks.len() != self.bmtagger.srprism_indexes.len() {
                    return Err(PipelineError::InvalidConfig(format!(
                        "bmtagger.bitmasks ({}) and bmtagger.srprism_indexes ({}) must pair up",
                        self.bmtagger.bitmasks.len(),
                        self.bmtagger.srprism_indexes.len()
                    )));
                }
            }
            HostTool::Hisat => {
                if self.hisat2.index.is_none() {
                    return Err(PipelineError::MissingParameter("hisat2.index".to_string()));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.bbduk.entropy) {
            return Err(PipelineError::InvalidConfig(format!(
                "bbduk.entropy must lie in [0, 1], got {}",
                self.bbduk.entropy
            )));
        }
        Ok(())
    }

    /// Executables the configured stage set will invoke.
    pub fn required_tools(&self) -> Vec<String> {
        let mut tools = vec![
            self.cdhit.tool.program(CDHIT_DUP_TAG),
            self.trimmomatic.tool.program(TRIMMOMATIC_TAG),
            self.bbduk.tool.program(BBDUK_TAG),
        ];
        if self.data_type == DataType::Metatranscriptome {
            tools.push(self.sortmerna.tool.program(SORTMERNA_TAG));
        }
        match self.host_tool {
            HostTool::Bmtagger => tools.push(self.bmtagger.tool.program(BMTAGGER_TAG)),
            HostTool::Hisat => tools.push(self.hisat2.tool.program(HISAT2_TAG)),
        }
        tools
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
data_type: metatranscriptome
host_tool: hisat
trimmomatic:
  adapters: /db/adapters.fa
  threads: 4
sortmerna:
  references: [/db/silva-bac-16s.fasta, /db/rfam-5s.fasta]
hisat2:
  index: /db/hg38
  options: "--very-sensitive"
"#;

    #[test]
    fn test_parse_and_validate() -> anyhow::Result<()> {
        let params = PipelineParams::from_yaml_str(MINIMAL)?;
        assert_eq!(params.data_type, DataType::Metatranscriptome);
        assert_eq!(params.host_tool, HostTool::Hisat);
        assert_eq!(params.trimmomatic.tool.threads, 4);
        assert_eq!(params.trimmomatic.seed_mismatches, 2);
        assert_eq!(params.hisat2.tool.option_args(), vec!["--very-sensitive"]);
        assert_eq!(params.bbduk.entropy, 0.6);
        params.validate()?;

        let tools = params.required_tools();
        assert!(tools.contains(&SORTMERNA_TAG.to_string()));
        assert!(tools.contains(&HISAT2_TAG.to_string()));
        assert!(!tools.contains(&BMTAGGER_TAG.to_string()));
        Ok(())
    }

    #[test]
    fn test_missing_sortmerna_references() -> anyhow::Result<()> {
        let params = PipelineParams::from_yaml_str(
            "data_type: metatranscriptome\ntrimmomatic:\n  adapters: a.fa\nhost_tool: hisat\nhisat2:\n  index: idx\n",
        )?;
        let err = params.validate().unwrap_err();
        assert!(matches!(err, PipelineError::MissingParameter(_)));
        assert!(err.is_configuration());
        Ok(())
    }

    #[test]
    fn test_unpaired_bmtagger_indexes() -> anyhow::Result<()> {
        let params = PipelineParams::from_yaml_str(
            "trimmomatic:\n  adapters: a.fa\nbmtagger:\n  bitmasks: [a.bitmask, b.bitmask]\n  srprism_indexes: [a.srprism]\n",
        )?;
        assert!(matches!(params.validate(), Err(PipelineError::InvalidConfig(_))));
        Ok(())
    }

    #[test]
    fn test_unknown_data_type_rejected() {
        let result = PipelineParams::from_yaml_str("data_type: amplicon\n");
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }
}
