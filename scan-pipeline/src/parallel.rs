use crate::error::Stage;
use anyhow::{Context, Error};
use log::debug;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Build a pool for one stage. `threads == 0` lets rayon pick the number of cores.
pub fn thread_pool(stage: Stage, threads: usize) -> Result<ThreadPool, Error> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{stage}-{i}"))
        .build()
        .with_context(|| format!("building {threads}-thread pool for {stage}"))
}

/// Run `f` inside a dedicated pool so that every rayon call it makes uses `threads` workers.
pub fn run_in_pool<T, F>(stage: Stage, threads: usize, f: F) -> Result<T, Error>
where
    T: Send,
    F: FnOnce() -> Result<T, Error> + Send,
{
    let pool = thread_pool(stage, threads)?;
    debug!("{}: running on {} threads", stage, pool.current_num_threads());
    pool.install(f)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pool_size() {
        let n = run_in_pool(Stage::Clustering, 3, || Ok(rayon::current_num_threads())).unwrap();
        assert_eq!(n, 3);
    }
}
