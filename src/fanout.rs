use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex};

/// Apply `f` to every item on at most `max_parallel` worker threads.
///
/// Outputs come back in input order. A panicking job is reported as an
/// error once every other job has finished.
pub fn fan_out<I, T, F>(max_parallel: usize, items: Vec<I>, f: F) -> Result<Vec<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> T + Send + Sync + 'static,
{
    if max_parallel == 0 {
        return Err(anyhow!("max_parallel must be >= 1"));
    }
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let expected = items.len();
    let workers = max_parallel.min(expected);
    let queue: Arc<Mutex<VecDeque<(usize, I)>>> =
        Arc::new(Mutex::new(items.into_iter().enumerate().collect()));
    let f = Arc::new(f);
    let (tx, rx) = mpsc::channel::<(usize, T)>();

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let f = Arc::clone(&f);
        let tx = tx.clone();
        handles.push(std::thread::spawn(move || loop {
            let next = match queue.lock() {
                Ok(mut q) => q.pop_front(),
                Err(poisoned) => poisoned.into_inner().pop_front(),
            };
            let Some((index, item)) = next else {
                break;
            };
            if tx.send((index, f(item))).is_err() {
                break;
            }
        }));
    }
    drop(tx);

    let mut out: Vec<(usize, T)> = rx.into_iter().collect();

    let mut panicked = false;
    for h in handles {
        panicked |= h.join().is_err();
    }
    if panicked || out.len() != expected {
        return Err(anyhow!(
            "fan-out worker panicked ({} of {expected} job(s) completed)",
            out.len()
        ));
    }

    out.sort_by_key(|(idx, _)| *idx);
    Ok(out.into_iter().map(|(_, v)| v).collect())
}
