#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "parallel")]
use rayon::ThreadPool;
#[cfg(feature = "parallel")]
use std::sync::OnceLock;

/// Pool that runs independent segment loads, one SQL statement per thread at a time.
///
/// `None` when no pool could be built; batches then load one after another.
#[cfg(feature = "parallel")]
static BATCH_POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

/// Upper bound on concurrent segment statements unless `ROLAP_BATCH_THREADS` says otherwise.
#[cfg(feature = "parallel")]
const DEFAULT_MAX_BATCH_THREADS: usize = 8;

#[cfg(feature = "parallel")]
fn batch_threads() -> usize {
    std::env::var("ROLAP_BATCH_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map_or(1, |n| n.get())
                .min(DEFAULT_MAX_BATCH_THREADS)
        })
}

#[cfg(feature = "parallel")]
fn batch_pool() -> Option<&'static ThreadPool> {
    BATCH_POOL
        .get_or_init(|| {
            let threads = batch_threads();
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("rolap-batch-{i}"))
                .build()
                .map_err(|err| log::debug!("no {threads}-thread batch pool: {err}"))
                .ok()
        })
        .as_ref()
}

/// Map `f` over `items`, concurrently when allowed and possible.
///
/// Output order always matches input order, so callers merge results deterministically no
/// matter how the work was scheduled.
pub(crate) fn map_ordered<T, R, F>(items: &[T], concurrent: bool, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        if concurrent && items.len() > 1 {
            if let Some(pool) = batch_pool() {
                return pool.install(|| items.par_iter().map(&f).collect());
            }
            log::debug!("loading {} batches sequentially", items.len());
        }
    }
    #[cfg(not(feature = "parallel"))]
    let _ = concurrent;

    items.iter().map(f).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn preserves_input_order() {
        let items: Vec<u32> = (0..64).collect();
        let doubled = map_ordered(&items, true, |x| x * 2);
        assert_eq!(doubled, items.iter().map(|x| x * 2).collect::<Vec<_>>());
        assert_eq!(map_ordered(&items, false, |x| x + 1)[63], 64);
    }
}
