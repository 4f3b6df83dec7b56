//! Scoped fan-out over a slice of jobs.
//!
//! Workers pull indices from a shared counter. The first failure is kept and
//! makes the remaining workers stop picking up new jobs; jobs already running
//! finish normally.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::unbounded;

pub const DEFAULT_WORKERS: usize = 8;

pub fn for_each<T, E, F>(items: &[T], workers: usize, job: F) -> Result<(), E>
where
    T: Sync,
    E: Send,
    F: Fn(&T) -> Result<(), E> + Sync,
{
    map(items, workers, job).map(|_| ())
}

/// Runs `job` over every item and returns the outputs in item order.
pub fn map<T, R, E, F>(items: &[T], workers: usize, job: F) -> Result<Vec<R>, E>
where
    T: Sync,
    R: Send,
    E: Send,
    F: Fn(&T) -> Result<R, E> + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    if workers <= 1 || items.len() == 1 {
        return items.iter().map(&job).collect();
    }

    let threads = workers.min(items.len());
    let next = AtomicUsize::new(0);
    let error: Mutex<Option<E>> = Mutex::new(None);
    let (done_tx, done_rx) = unbounded();

    thread::scope(|scope| {
        for _ in 0..threads {
            let done_tx = done_tx.clone();
            let next = &next;
            let error = &error;
            let job = &job;
            scope.spawn(move || loop {
                if let Ok(guard) = error.lock() {
                    if guard.is_some() {
                        break;
                    }
                }
                let index = next.fetch_add(1, Ordering::SeqCst);
                if index >= items.len() {
                    break;
                }
                match job(&items[index]) {
                    Ok(output) => {
                        let _ = done_tx.send((index, output));
                    }
                    Err(err) => {
                        if let Ok(mut guard) = error.lock() {
                            if guard.is_none() {
                                *guard = Some(err);
                            }
                        }
                        break;
                    }
                }
            });
        }
    });
    drop(done_tx);

    if let Some(err) = error.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()) {
        return Err(err);
    }
    let mut outputs: Vec<(usize, R)> = done_rx.into_iter().collect();
    outputs.sort_by_key(|(index, _)| *index);
    Ok(outputs.into_iter().map(|(_, output)| output).collect())
}
