use std::num::NonZeroUsize;
use std::thread;

/// Runs `work` over every unit, spreading units round robin across scoped
/// worker threads when `parallel` is set. Each worker builds its own
/// scratch state with `init`. Returns the first error any worker hit.
pub fn run_batches<U, S, E, I, W>(units: Vec<U>, parallel: bool, init: I, work: W) -> Result<(), E>
where
    U: Send,
    E: Send,
    I: Fn() -> S + Sync,
    W: Fn(&mut S, U) -> Result<(), E> + Sync,
{
    let workers = if parallel {
        thread::available_parallelism()
            .map_or(1, NonZeroUsize::get)
            .min(units.len())
    } else {
        1
    };

    if workers <= 1 {
        let mut scratch = init();
        return units.into_iter().try_for_each(|unit| work(&mut scratch, unit));
    }

    let mut buckets: Vec<Vec<U>> = (0..workers).map(|_| Vec::new()).collect();
    for (index, unit) in units.into_iter().enumerate() {
        buckets[index % workers].push(unit);
    }

    let (init, work) = (&init, &work);
    thread::scope(|scope| {
        let handles: Vec<_> = buckets
            .into_iter()
            .map(|bucket| {
                scope.spawn(move || {
                    let mut scratch = init();
                    bucket.into_iter().try_for_each(|unit| work(&mut scratch, unit))
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}
