//! Bounded fan-out for independent jobs.
//!
//! With the `parallel` feature, work goes through rayon's pool (capped by a
//! local pool when `max_threads` is smaller than rayon's default). Without
//! it, items are split into at most `max_threads` contiguous segments and
//! run on scoped threads. Result order always matches input order.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Apply `f` to every item using at most `max_threads` workers.
pub fn map_bounded<T, R, F>(items: &[T], max_threads: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let threads = max_threads.max(1).min(items.len());
    if threads <= 1 {
        return items.iter().map(f).collect();
    }
    run(items, threads, &f)
}

#[cfg(feature = "parallel")]
fn run<T, R, F>(items: &[T], threads: usize, f: &F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(|| items.par_iter().map(f).collect()),
        // Could not spawn a dedicated pool; the global one is still bounded.
        Err(_) => items.par_iter().map(f).collect(),
    }
}

#[cfg(not(feature = "parallel"))]
fn run<T, R, F>(items: &[T], threads: usize, f: &F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let chunk = (items.len() + threads - 1) / threads;
    std::thread::scope(|scope| {
        let handles: Vec<_> = items
            .chunks(chunk)
            .map(|segment| scope.spawn(move || segment.iter().map(f).collect::<Vec<R>>()))
            .collect();

        let mut out = Vec::with_capacity(items.len());
        for handle in handles {
            match handle.join() {
                Ok(part) => out.extend(part),
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
        out
    })
}
