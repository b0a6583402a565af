//! Bounded concurrent execution of blocking tasks.
//!
//! Tasks run on a fixed set of scoped OS threads pulling from a shared queue.
//! Results come back in input order. There is no fault isolation here: an
//! `Err` lands in its slot and a panic propagates to the caller once all
//! workers have stopped. Callers that need per-task isolation wrap tasks
//! first (see [`crate::stage_exec`]).

use std::sync::{Mutex, mpsc};
use std::thread;

use anyhow::{Result, anyhow};

/// A unit of work for [`run_all`].
pub type Task<'a, T> = Box<dyn FnOnce() -> Result<T> + Send + 'a>;

/// Run `tasks` with at most `max_parallelism` in flight.
pub fn run_all<'a, T: Send + 'a>(tasks: Vec<Task<'a, T>>, max_parallelism: usize) -> Vec<Result<T>> {
    run_all_with(tasks, max_parallelism, |_, _| {})
}

/// Like [`run_all`], calling `on_result` on the calling thread as each task finishes.
pub fn run_all_with<'a, T, F>(
    tasks: Vec<Task<'a, T>>,
    max_parallelism: usize,
    mut on_result: F,
) -> Vec<Result<T>>
where
    T: Send + 'a,
    F: FnMut(usize, &Result<T>),
{
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = max_parallelism.clamp(1, total);
    if workers == 1 {
        return tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| {
                let result = task();
                on_result(index, &result);
                result
            })
            .collect();
    }

    let queue = Mutex::new(tasks.into_iter().enumerate());
    let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
    let (tx, rx) = mpsc::channel();

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            scope.spawn(move || {
                loop {
                    let next = match queue.lock() {
                        Ok(mut pending) => pending.next(),
                        Err(_) => None,
                    };
                    let Some((index, task)) = next else {
                        break;
                    };
                    if tx.send((index, task())).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);
        for (index, result) in rx {
            on_result(index, &result);
            slots[index] = Some(result);
        }
    });

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| slot.unwrap_or_else(|| Err(anyhow!("task {index} produced no result"))))
        .collect()
}
