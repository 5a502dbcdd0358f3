// src/utils/system.rs: System functions

use std::time::Duration;

use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Determines number of cores that can be used for concurrent tasks
///
/// # Arguments
///
/// * `args_threads` - Upper bound from the command line.
///
/// # Returns
///
/// (usize, f32) maximum cores, current cpu usage
pub async fn detect_cores_and_load(args_threads: usize) -> (usize, f32) {
    let refresh_kind = RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_cpu_usage());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_usage();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    sleep(Duration::from_millis(100)).await;
    system.refresh_cpu_usage();
    let cpu_load = system.global_cpu_usage();
    let max_cores = physical_cores.min(args_threads).max(1);
    (max_cores, cpu_load)
}


/// Number of tasks to keep in flight.
/// An explicit `--jobs` wins; otherwise one task per free core, never fewer than one.
pub fn compute_job_limit(requested: Option<usize>, max_cores: usize, cpu_load: f32) -> usize {
    match requested {
        Some(jobs) => jobs.max(1),
        None => {
            if cpu_load > 75.0 {
                (max_cores / 2).max(1)
            } else {
                max_cores.max(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_job_limit() {
        assert_eq!(compute_job_limit(Some(0), 16, 0.0), 1);
        assert_eq!(compute_job_limit(Some(3), 16, 99.0), 3);
        assert_eq!(compute_job_limit(None, 16, 10.0), 16);
        assert_eq!(compute_job_limit(None, 16, 90.0), 8);
        assert_eq!(compute_job_limit(None, 1, 90.0), 1);
    }

    #[tokio::test]
    async fn test_detect_cores_is_bounded() {
        let (cores, _) = detect_cores_and_load(2).await;
        assert!((1..=2).contains(&cores));
    }
}
