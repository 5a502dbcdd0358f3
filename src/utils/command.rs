/// Functions and structs for building external tool command lines and running them

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, warn};
use tokio::process::Command;

use crate::config::defs::PipelineError;
use crate::pipelines::sample::ReadFiles;


pub mod cdhit {
    use crate::config::params::CdhitParams;
    use crate::pipelines::sample::ReadFiles;

    /// cd-hit-dup writes uncompressed FASTQ; `outputs` are plain paths.
    pub fn arg_generator(params: &CdhitParams, inputs: &ReadFiles, outputs: &ReadFiles) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        match (inputs, outputs) {
            (ReadFiles::Paired(in1, in2), ReadFiles::Paired(out1, out2)) => {
                args_vec.push("-i".to_string());
                args_vec.push(in1.to_string_lossy().to_string());
                args_vec.push("-i2".to_string());
                args_vec.push(in2.to_string_lossy().to_string());
                args_vec.push("-o".to_string());
                args_vec.push(out1.to_string_lossy().to_string());
                args_vec.push("-o2".to_string());
                args_vec.push(out2.to_string_lossy().to_string());
            }
            _ => {
                args_vec.push("-i".to_string());
                args_vec.push(inputs.first().to_string_lossy().to_string());
                args_vec.push("-o".to_string());
                args_vec.push(outputs.first().to_string_lossy().to_string());
            }
        }
        args_vec.extend(params.tool.option_args());
        args_vec
    }
}

pub mod trimmomatic {
    use std::path::PathBuf;
    use crate::config::params::TrimmomaticParams;
    use crate::pipelines::sample::ReadFiles;

    /// `unpaired` receives the orphaned mates for paired input and is ignored otherwise.
    pub fn arg_generator(
        params: &TrimmomaticParams,
        inputs: &ReadFiles,
        outputs: &ReadFiles,
        unpaired: (&PathBuf, &PathBuf),
    ) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        let mode = if inputs.is_paired() { "PE" } else { "SE" };
        args_vec.push(mode.to_string());
        args_vec.push("-threads".to_string());
        args_vec.push(params.tool.threads.to_string());
        args_vec.push("-phred33".to_string());
        match (inputs, outputs) {
            (ReadFiles::Paired(in1, in2), ReadFiles::Paired(out1, out2)) => {
                args_vec.push(in1.to_string_lossy().to_string());
                args_vec.push(in2.to_string_lossy().to_string());
                args_vec.push(out1.to_string_lossy().to_string());
                args_vec.push(unpaired.0.to_string_lossy().to_string());
                args_vec.push(out2.to_string_lossy().to_string());
                args_vec.push(unpaired.1.to_string_lossy().to_string());
            }
            _ => {
                args_vec.push(inputs.first().to_string_lossy().to_string());
                args_vec.push(outputs.first().to_string_lossy().to_string());
            }
        }
        if let Some(adapters) = &params.adapters {
            args_vec.push(format!(
                "ILLUMINACLIP:{}:{}:{}:{}",
                adapters.display(),
                params.seed_mismatches,
                params.palindrome_clip_threshold,
                params.simple_clip_threshold
            ));
        }
        args_vec.extend(params.steps.split_whitespace().map(str::to_string));
        args_vec.extend(params.tool.option_args());
        args_vec
    }
}

pub mod sortmerna {
    use std::path::Path;
    use crate::config::params::SortmernaParams;
    use crate::pipelines::sample::ReadFiles;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum SortmernaMode {
        /// Write non-rRNA reads to `<prefix>` (`_fwd`/`_rev` when paired).
        Filter,
        /// Write an OTU map of the rRNA reads into the aligned directory.
        OtuMap,
    }

    pub fn arg_generator(
        params: &SortmernaParams,
        inputs: &ReadFiles,
        workdir: &Path,
        prefix: &Path,
        mode: SortmernaMode,
    ) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        for reference in &params.references {
            args_vec.push("--ref".to_string());
            args_vec.push(reference.to_string_lossy().to_string());
        }
        for read_file in inputs.paths() {
            args_vec.push("--reads".to_string());
            args_vec.push(read_file.to_string_lossy().to_string());
        }
        args_vec.push("--workdir".to_string());
        args_vec.push(workdir.to_string_lossy().to_string());
        if let Some(index_dir) = &params.index_dir {
            args_vec.push("--idx-dir".to_string());
            args_vec.push(index_dir.to_string_lossy().to_string());
        }
        args_vec.push("--threads".to_string());
        args_vec.push(params.tool.threads.to_string());
        match mode {
            SortmernaMode::Filter => {
                args_vec.push("--fastx".to_string());
                args_vec.push("--aligned".to_string());
                args_vec.push(workdir.join("aligned").to_string_lossy().to_string());
                args_vec.push("--other".to_string());
                args_vec.push(prefix.to_string_lossy().to_string());
                if inputs.is_paired() {
                    args_vec.push("--paired_in".to_string());
                    args_vec.push("--out2".to_string());
                }
            }
            SortmernaMode::OtuMap => {
                args_vec.push("--otu_map".to_string());
                args_vec.push("--blast".to_string());
                args_vec.push("1".to_string());
                args_vec.push("--aligned".to_string());
                args_vec.push(prefix.to_string_lossy().to_string());
            }
        }
        args_vec.extend(params.tool.option_args());
        args_vec
    }
}

pub mod bmtagger {
    use std::path::Path;
    use crate::pipelines::sample::ReadFiles;
    use crate::config::params::BmtaggerParams;

    /// One invocation per host genome; non-host reads are extracted to `<out_prefix>_1.fastq`
    /// (and `_2.fastq` when paired), or `<out_prefix>.fastq` for single-end input.
    pub fn arg_generator(
        params: &BmtaggerParams,
        genome: usize,
        inputs: &ReadFiles,
        tmp_dir: &Path,
        out_prefix: &Path,
    ) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-b".to_string());
        args_vec.push(params.bitmasks[genome].to_string_lossy().to_string());
        args_vec.push("-x".to_string());
        args_vec.push(params.srprism_indexes[genome].to_string_lossy().to_string());
        args_vec.push("-T".to_string());
        args_vec.push(tmp_dir.to_string_lossy().to_string());
        args_vec.push("-q1".to_string());
        args_vec.push("-1".to_string());
        args_vec.push(inputs.first().to_string_lossy().to_string());
        if let ReadFiles::Paired(_, in2) = inputs {
            args_vec.push("-2".to_string());
            args_vec.push(in2.to_string_lossy().to_string());
        }
        args_vec.push("-o".to_string());
        args_vec.push(out_prefix.to_string_lossy().to_string());
        args_vec.push("-X".to_string());
        args_vec.extend(params.tool.option_args());
        args_vec
    }
}

pub mod hisat2 {
    use std::path::Path;
    use crate::config::params::Hisat2Params;
    use crate::pipelines::sample::ReadFiles;

    /// `unaligned` is the gzipped output template; for paired input hisat2 replaces `%`
    /// with the mate number.
    pub fn arg_generator(params: &Hisat2Params, inputs: &ReadFiles, unaligned: &str, summary: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-p".to_string());
        args_vec.push(params.tool.threads.to_string());
        args_vec.push("-x".to_string());
        if let Some(index) = &params.index {
            args_vec.push(index.to_string_lossy().to_string());
        }
        match inputs {
            ReadFiles::Paired(in1, in2) => {
                args_vec.push("-1".to_string());
                args_vec.push(in1.to_string_lossy().to_string());
                args_vec.push("-2".to_string());
                args_vec.push(in2.to_string_lossy().to_string());
                args_vec.push("--un-conc-gz".to_string());
            }
            ReadFiles::Single(in1) => {
                args_vec.push("-U".to_string());
                args_vec.push(in1.to_string_lossy().to_string());
                args_vec.push("--un-gz".to_string());
            }
        }
        args_vec.push(unaligned.to_string());
        args_vec.push("--summary-file".to_string());
        args_vec.push(summary.to_string_lossy().to_string());
        args_vec.push("-S".to_string());
        args_vec.push("/dev/null".to_string());
        args_vec.extend(params.tool.option_args());
        args_vec
    }
}

pub mod bbduk {
    use crate::config::params::BbdukParams;
    use crate::pipelines::sample::ReadFiles;

    pub fn arg_generator(params: &BbdukParams, inputs: &ReadFiles, outputs: &ReadFiles) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push(format!("in={}", inputs.first().display()));
        if let ReadFiles::Paired(_, in2) = inputs {
            args_vec.push(format!("in2={}", in2.display()));
        }
        args_vec.push(format!("out={}", outputs.first().display()));
        if let ReadFiles::Paired(_, out2) = outputs {
            args_vec.push(format!("out2={}", out2.display()));
        }
        args_vec.push(format!("entropy={}", params.entropy));
        args_vec.push(format!("entropywindow={}", params.entropy_window));
        args_vec.push(format!("entropyk={}", params.entropy_k));
        if params.mask {
            args_vec.push("entropymask=t".to_string());
        }
        args_vec.push(format!("threads={}", params.tool.threads));
        args_vec.extend(params.tool.option_args());
        args_vec
    }
}


/// Runs an external tool to completion, writing its stdout and stderr to `log_path`.
///
/// # Arguments
///
/// * `program` - Executable name or path.
/// * `args` - Arguments from one of the arg generators.
/// * `log_path` - Where the tool's console output is kept for the task.
///
/// # Returns
/// Ok on exit status zero, ToolExecution otherwise.
pub async fn run_tool(program: &str, args: &[String], log_path: &Path) -> Result<(), PipelineError> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PipelineError::ToolExecution {
            tool: program.to_string(),
            error: format!("Failed to spawn: {}. Is {} installed?", e, program),
        })?;

    let mut log_text = Vec::with_capacity(output.stdout.len() + output.stderr.len());
    log_text.extend_from_slice(&output.stdout);
    log_text.extend_from_slice(&output.stderr);
    if let Err(e) = tokio::fs::write(log_path, &log_text).await {
        warn!("Could not write tool log {}: {}", log_path.display(), e);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        return Err(PipelineError::ToolExecution {
            tool: program.to_string(),
            error: format!(
                "{} ({})",
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            ),
        });
    }
    Ok(())
}


/// True if `name` is an existing path or an executable found on PATH.
pub fn tool_exists(name: &str) -> bool {
    let direct = Path::new(name);
    if direct.components().count() > 1 {
        return direct.is_file();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| is_executable(&dir.join(name))))
        .unwrap_or(false)
}

fn is_executable(path: &PathBuf) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Checks every tool up front so a missing executable fails the run before any task starts.
pub fn check_tools(tools: &[String]) -> Result<(), PipelineError> {
    let missing: Vec<&str> = tools
        .iter()
        .filter(|tool| !tool_exists(tool))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::InvalidConfig(format!(
            "Required tools not found on PATH: {}",
            missing.join(", ")
        )))
    }
}

/// Expands a sortmerna/bmtagger output prefix into the file names the tool produces.
pub fn prefixed_reads(prefix: &Path, paired: bool, paired_tags: (&str, &str), ext: &str) -> ReadFiles {
    let base = prefix.to_string_lossy();
    if paired {
        ReadFiles::Paired(
            PathBuf::from(format!("{}{}{}", base, paired_tags.0, ext)),
            PathBuf::from(format!("{}{}{}", base, paired_tags.1, ext)),
        )
    } else {
        ReadFiles::Single(PathBuf::from(format!("{}{}", base, ext)))
    }
}
