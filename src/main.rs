use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{debug, error, info, warn, LevelFilter};

use shotgun_pipelines::cli::{parse, Arguments, Module};
use shotgun_pipelines::config::defs::{PipelineError, RunConfig, STATE_DB};
use shotgun_pipelines::config::params::PipelineParams;
use shotgun_pipelines::pipelines::merge::{merge_levels, MergeLevel, MergeOptions, SuffixPattern};
use shotgun_pipelines::pipelines::preprocess;
use shotgun_pipelines::utils::system::{compute_job_limit, detect_cores_and_load};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n Shotgun Pipelines\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let module = args.module;
    let outcome = match module {
        Module::Preprocess => preprocess_run(args, dir).await,
        Module::Show => show_run(args, dir).await,
        Module::MergeTables => merge_tables_run(args, dir).await,
    };

    if let Err(e) = outcome {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Parameters from `--config`; a missing file is only tolerated when `required` is false.
fn load_params(args: &Arguments, cwd: &Path, required: bool) -> Result<PipelineParams, PipelineError> {
    let path = resolve(cwd, &args.config);
    if !path.exists() && !required {
        debug!("No parameter file at {}; using defaults", path.display());
        return Ok(PipelineParams::default());
    }
    info!("Reading parameters from {}", path.display());
    PipelineParams::from_yaml_file(&path)
}

async fn build_run_config(args: Arguments, cwd: PathBuf) -> Result<Arc<RunConfig>, PipelineError> {
    let params = load_params(&args, &cwd, true)?;

    let input_dir = match (&args.input_dir, &params.input_dir) {
        (Some(arg), _) => resolve(&cwd, arg),
        (None, Some(param)) => cwd.join(param),
        (None, None) => cwd.clone(),
    };
    let out_dir = args.out_dir.as_deref().map(|o| resolve(&cwd, o)).unwrap_or_else(|| cwd.clone());
    let state_db = args
        .state_db
        .as_deref()
        .map(|s| resolve(&cwd, s))
        .unwrap_or_else(|| out_dir.join(STATE_DB));

    let (max_cores, cpu_load) = detect_cores_and_load(args.threads).await;
    let jobs = compute_job_limit(args.jobs, max_cores, cpu_load);
    debug!("Detected {} usable cores; CPU load {}%; {} concurrent tasks", max_cores, cpu_load, jobs);

    Ok(Arc::new(RunConfig {
        cwd,
        input_dir,
        out_dir,
        state_db,
        jobs,
        params,
        args,
    }))
}

async fn preprocess_run(args: Arguments, cwd: PathBuf) -> Result<(), PipelineError> {
    let run_config = build_run_config(args, cwd).await?;
    let result = preprocess::run(run_config).await?;
    if !result.failures.is_empty() {
        warn!(
            "{} of {} samples did not finish; rerun to resume once the cause is fixed",
            result.samples.values().filter(|s| s.failed > 0).count(),
            result.samples.len()
        );
    }
    Ok(())
}

async fn show_run(args: Arguments, cwd: PathBuf) -> Result<(), PipelineError> {
    let run_config = build_run_config(args, cwd).await?;
    preprocess::show(run_config).await?;
    Ok(())
}

async fn merge_tables_run(args: Arguments, cwd: PathBuf) -> Result<(), PipelineError> {
    let params = load_params(&args, &cwd, false)?;
    let tables_dir = args
        .tables_dir
        .as_deref()
        .map(|t| resolve(&cwd, t))
        .ok_or_else(|| PipelineError::MissingParameter("--tables-dir".to_string()))?;
    if args.levels.is_empty() {
        return Err(PipelineError::MissingParameter("--level NAME=SUFFIX".to_string()));
    }
    let levels = args
        .levels
        .iter()
        .map(|l| MergeLevel::parse(l).map_err(PipelineError::InvalidConfig))
        .collect::<Result<Vec<_>, _>>()?;

    let strip_suffix = args.strip_suffix.clone().unwrap_or(params.merge.strip_suffix.clone());
    let pattern = SuffixPattern::new(&strip_suffix)?;
    let options = MergeOptions {
        drop_zero_rows: args.drop_zero_rows || params.merge.drop_zero_rows,
    };
    let out_dir = args.out_dir.as_deref().map(|o| resolve(&cwd, o)).unwrap_or(cwd);
    fs::create_dir_all(&out_dir)?;

    for (level, outcome) in merge_levels(&levels, &tables_dir, &out_dir, &pattern, &options).await {
        match outcome {
            Ok(path) => info!("{}\tmerged\t{}", level, path.display()),
            Err(e) => error!("{}\tfailed\t{}", level, e),
        }
    }
    Ok(())
}
