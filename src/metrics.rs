//! Счётчики пула, наблюдатель событий и периодический мониторинг.

use super::model::{PoolEvent, PoolMetrics};
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
    thread::{self, JoinHandle},
    time::Duration,
};

/// Получает события пула, если установлен через
/// [`Config::observer`](crate::Config::observer).
///
/// Вызывается в потоке отправителя или воркера, поэтому должен быть быстрым.
/// На планирование задач не влияет.
pub trait PoolObserver: Send + Sync + 'static {
    fn on_event(&self, event: &PoolEvent);
}

impl<F> PoolObserver for F
where
    F: Fn(&PoolEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &PoolEvent) {
        (self)(event)
    }
}

/// Наблюдатель, сохраняющий все события в памяти.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<PoolEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }

    /// Забрать всё накопленное.
    pub fn take(&self) -> Vec<PoolEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn count(&self, pred: impl Fn(&PoolEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl PoolObserver for EventLog {
    fn on_event(&self, event: &PoolEvent) {
        self.events.lock().push(event.clone());
    }
}

#[derive(Debug, Default)]
pub(crate) struct Metrics {
    accepted: AtomicUsize,
    denied: AtomicUsize,
    delayed: AtomicUsize,
    completed: AtomicUsize,
    panicked: AtomicUsize,
    peak_queued: AtomicUsize,
}

impl Metrics {
    #[inline]
    pub(crate) fn accepted(&self, queued: usize) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.peak_queued.fetch_max(queued, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn delayed(&self) {
        self.delayed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        workers: usize,
        capacity: usize,
        queued: usize,
        in_flight: usize,
    ) -> PoolMetrics {
        PoolMetrics {
            workers,
            capacity,
            queued_tasks: queued,
            in_flight_tasks: in_flight,
            accepted_tasks: self.accepted.load(Ordering::Relaxed),
            denied_tasks: self.denied.load(Ordering::Relaxed),
            delayed_tasks: self.delayed.load(Ordering::Relaxed),
            completed_tasks: self.completed.load(Ordering::Relaxed),
            panicked_tasks: self.panicked.load(Ordering::Relaxed),
            peak_queued: self.peak_queued.load(Ordering::Relaxed),
        }
    }
}

/// Фоновый поток, отдающий метрики пула с заданным интервалом.
///
/// Создаётся через [`TaskPool::start_monitoring`](crate::TaskPool::start_monitoring),
/// останавливается через [`stop`](Monitor::stop) или drop.
pub struct Monitor {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Monitor {
    pub(crate) fn spawn<S, F>(interval: Duration, sample: S, callback: F) -> std::io::Result<Self>
    where
        S: Fn() -> PoolMetrics + Send + 'static,
        F: Fn(PoolMetrics) + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let ticker = channel::tick(interval);

        let thread = thread::Builder::new()
            .name("pool-monitor".into())
            .spawn(move || loop {
                channel::select! {
                    recv(ticker) -> _ => callback(sample()),
                    recv(stop_rx) -> _ => break,
                }
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // закрытие канала будит select
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("monitor callback panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("running", &self.thread.is_some())
            .finish()
    }
}
