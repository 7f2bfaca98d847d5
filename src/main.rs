use bounded_pool::{Config, TaskPool};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

fn main() {
    let pool = match TaskPool::start(Config::cpu_bound()) {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("failed to start pool: {err}");
            std::process::exit(1);
        }
    };

    let now = Instant::now();
    let counter = Arc::new(AtomicUsize::new(0));
    for i in 0..1_000_000usize {
        let counter = counter.clone();
        if pool
            .submit_blocking(move || {
                counter.fetch_add(i & 1, Ordering::Relaxed);
            })
            .is_err()
        {
            break;
        }
    }

    if let Err(err) = pool.drain_all() {
        eprintln!("drain failed: {err}");
    }
    let metrics = pool.metrics();
    println!(
        "elapsed: {:?}, odd: {}, delayed: {}, peak queued: {}",
        now.elapsed(),
        counter.load(Ordering::Relaxed),
        metrics.delayed_tasks,
        metrics.peak_queued
    );
}
