use crate::cancel::CancelToken;
use anyhow::{Context, Result};
use rayon::prelude::*;

/// Runs `work` over `jobs` on a dedicated pool of at most `workers` threads.
///
/// Jobs that have not started when `cancel` is tripped are skipped; jobs
/// already started run to completion. Results come back in job order, with
/// `None` for skipped jobs.
pub fn run_bounded<J, R, F>(
    jobs: &[J],
    workers: usize,
    cancel: &CancelToken,
    work: F,
) -> Result<Vec<Option<R>>>
where
    J: Sync,
    R: Send,
    F: Fn(&J) -> R + Send + Sync,
{
    let threads = workers.max(1).min(jobs.len().max(1));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("replab-worker-{}", i))
        .build()
        .context("failed to start worker pool")?;
    Ok(pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                if cancel.is_cancelled() {
                    None
                } else {
                    Some(work(job))
                }
            })
            .collect()
    }))
}
