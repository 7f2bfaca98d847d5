use super::{
    alloc::{SlotAllocator, SystemAllocator},
    errors::{panic_message, PoolError, SubmitError},
    handle::{Completion, Handle, Task},
    metrics::{Metrics, Monitor, PoolObserver},
    model::{PoolEvent, PoolMetrics, Priority},
    ring::Ring,
};
use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    cell::Cell,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Конфигурация пула потоков
#[derive(Clone)]
pub struct Config {
    pub num_threads: usize,
    /// Всего слотов очереди; один всегда свободен, задач помещается `queue_capacity - 1`.
    pub queue_capacity: usize,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
    pub observer: Option<Arc<dyn PoolObserver>>,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self::new(num_cpus, num_cpus * 20 + 1)
    }
}

impl Config {
    pub fn new(num_threads: usize, queue_capacity: usize) -> Self {
        Self {
            num_threads,
            queue_capacity,
            thread_name_prefix: "pool-worker-".into(),
            stack_size: None,
            observer: None,
        }
    }

    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self::new(num_cpus, num_cpus * 10 + 1)
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self::new(num_cpus * 2, num_cpus * 64 + 1)
    }

    pub fn name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.num_threads == 0 {
            return Err(PoolError::NoWorkers);
        }
        if self.queue_capacity < self.num_threads + 1 {
            return Err(PoolError::CapacityTooSmall {
                capacity: self.queue_capacity,
                workers: self.num_threads,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SOME: &str = "Some(_)";
        const NONE: &str = "None";

        f.debug_struct("Config")
            .field("num_threads", &self.num_threads)
            .field("queue_capacity", &self.queue_capacity)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("stack_size", &self.stack_size)
            .field("observer", if self.observer.is_some() { &SOME } else { &NONE })
            .finish()
    }
}

thread_local! {
    // адрес `Shared` пула, которому принадлежит текущий воркер; 0 в чужих потоках
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

type Observer = Option<Arc<dyn PoolObserver>>;

#[inline]
fn emit(observer: &Observer, event: impl FnOnce() -> PoolEvent) {
    if let Some(observer) = observer {
        observer.on_event(&event());
    }
}

/// Состояние под мьютексом пула.
struct QueueState<A: SlotAllocator> {
    ring: Option<Ring<A>>,
    accepting: bool,
    stopping: bool,
    observer: Observer,
}

struct Shared<A: SlotAllocator> {
    state: Mutex<QueueState<A>>,
    not_empty: Condvar,
    not_full: Condvar,
    drained: Condvar,
    // queued <= in_flight в любой наблюдаемый момент
    queued: CachePadded<AtomicUsize>,
    in_flight: CachePadded<AtomicUsize>,
    stopping: AtomicBool,
    workers: AtomicUsize,
    capacity: AtomicUsize,
    metrics: Metrics,
    alloc: Arc<A>,
}

impl<A: SlotAllocator> Shared<A> {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as *const () as usize
    }

    fn snapshot(&self) -> PoolMetrics {
        self.metrics.snapshot(
            self.workers.load(Ordering::Relaxed),
            self.capacity.load(Ordering::Relaxed),
            self.queued.load(Ordering::Acquire),
            self.in_flight.load(Ordering::Acquire),
        )
    }

    fn pop(&self, st: &mut QueueState<A>) -> Option<Task> {
        let task = st.ring.as_mut()?.pop_front()?;
        self.queued.fetch_sub(1, Ordering::AcqRel);
        Some(task)
    }

    /// Ждёт задачу. `None`, когда очередь пуста и пул останавливается.
    fn next_task(&self) -> Option<Task> {
        let backoff = Backoff::new();
        while self.queued.load(Ordering::Acquire) == 0
            && !self.stopping.load(Ordering::Acquire)
            && !backoff.is_completed()
        {
            backoff.snooze();
        }

        let mut st = self.state.lock();
        loop {
            st.ring.as_ref()?;
            if let Some(task) = self.pop(&mut st) {
                drop(st);
                self.not_full.notify_one();
                return Some(task);
            }
            if st.stopping {
                return None;
            }
            self.not_empty.wait(&mut st);
        }
    }

    /// Выполняет задачу, перехватывая панику, и снимает её со счётчика in_flight.
    fn run(&self, worker: usize, task: Task, observer: &Observer) {
        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(()) => {
                self.metrics.completed();
                emit(observer, || PoolEvent::Completed);
            }
            Err(payload) => {
                self.metrics.panicked();
                tracing::warn!(worker, panic = %panic_message(&*payload), "task panicked");
                emit(observer, || PoolEvent::Panicked);
            }
        }
        self.finish_one();
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _st = self.state.lock();
            self.drained.notify_all();
        }
    }

    /// Кладёт `task` в очередь, если пул её принимает. Возвращает новую длину очереди.
    fn try_commit(
        &self,
        st: &mut QueueState<A>,
        priority: Priority,
        completion: Option<&Completion>,
        task: &mut Option<Task>,
    ) -> Result<usize, SubmitError> {
        if !st.accepting || st.stopping {
            return Err(SubmitError::NotRunning);
        }
        let ring = st.ring.as_mut().ok_or(SubmitError::NotRunning)?;
        if ring.is_full() {
            return Err(SubmitError::QueueFull);
        }
        if let Some(completion) = completion {
            if !completion.arm() {
                return Err(SubmitError::HandleBusy);
            }
            completion.set_denied(false);
        }

        if let Some(task) = task.take() {
            match priority {
                Priority::Normal => ring.push_back(task),
                Priority::Urgent => ring.push_urgent(task),
            }
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(self.queued.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

fn worker_loop<A: SlotAllocator>(id: usize, shared: Arc<Shared<A>>, observer: Observer) {
    CURRENT_POOL.with(|pool| pool.set(shared.key()));
    tracing::trace!(worker = id, "worker started");

    while let Some(task) = shared.next_task() {
        shared.run(id, task, &observer);
    }

    CURRENT_POOL.with(|pool| pool.set(0));
    tracing::trace!(worker = id, "worker terminated");
}

/// Клонирует аргументы задачи; паника в `Clone` становится ошибкой сборки.
fn capture<T: Clone>(args: &T) -> Result<T, SubmitError> {
    panic::catch_unwind(AssertUnwindSafe(|| args.clone()))
        .map_err(|payload| SubmitError::Construction(panic_message(&*payload)))
}

/// Фиксированная группа воркеров над ограниченной кольцевой очередью задач.
///
/// Пул создаётся пустым: [`new_threads`](Self::new_threads) выделяет очередь и
/// запускает воркеры, [`delete_threads`](Self::delete_threads) (или drop)
/// дочищает очередь и джойнит их.
pub struct TaskPool<A: SlotAllocator = SystemAllocator> {
    shared: Arc<Shared<A>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool<SystemAllocator> {
    pub fn new() -> Self {
        Self::with_allocator(SystemAllocator)
    }

    /// Создать пул и сразу запустить воркеры.
    pub fn start(config: Config) -> Result<Self, PoolError> {
        let pool = Self::new();
        pool.new_threads_with(config)?;
        Ok(pool)
    }
}

impl Default for TaskPool<SystemAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: SlotAllocator> TaskPool<A> {
    pub fn with_allocator(alloc: A) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                ring: None,
                accepting: false,
                stopping: false,
                observer: None,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            drained: Condvar::new(),
            queued: CachePadded::new(AtomicUsize::new(0)),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            stopping: AtomicBool::new(false),
            workers: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            metrics: Metrics::default(),
            alloc: Arc::new(alloc),
        });

        Self {
            shared,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Запустить `workers` потоков над очередью из `capacity` слотов.
    pub fn new_threads(&self, workers: usize, capacity: usize) -> Result<(), PoolError> {
        self.new_threads_with(Config::new(workers, capacity))
    }

    pub fn new_threads_with(&self, config: Config) -> Result<(), PoolError> {
        if self.on_worker_thread() {
            return Err(PoolError::WorkerThread);
        }
        config.validate()?;

        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Err(PoolError::AlreadyRunning);
        }

        let ring = Ring::allocate(config.queue_capacity, self.shared.alloc.clone())?;
        {
            let mut st = self.shared.state.lock();
            st.ring = Some(ring);
            st.stopping = false;
            st.observer = config.observer.clone();
        }
        self.shared.stopping.store(false, Ordering::Release);

        for id in 0..config.num_threads {
            let shared = self.shared.clone();
            let observer = config.observer.clone();
            let mut builder =
                thread::Builder::new().name(format!("{}{}", config.thread_name_prefix, id));
            if let Some(size) = config.stack_size {
                builder = builder.stack_size(size);
            }

            match builder.spawn(move || worker_loop(id, shared, observer)) {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    tracing::warn!(worker = id, error = %err, "failed to spawn worker thread");
                    self.teardown(&mut threads);
                    return Err(PoolError::Spawn(err));
                }
            }
        }

        self.shared.workers.store(config.num_threads, Ordering::Relaxed);
        self.shared.capacity.store(config.queue_capacity, Ordering::Relaxed);
        self.shared.state.lock().accepting = true;

        tracing::debug!(
            workers = config.num_threads,
            capacity = config.queue_capacity,
            "worker threads started"
        );
        emit(&config.observer, || PoolEvent::Started {
            workers: config.num_threads,
            capacity: config.queue_capacity,
        });
        Ok(())
    }

    /// Перестать принимать задачи, дать воркерам дочистить очередь, дождаться
    /// их и освободить очередь. На пустом пуле ничего не делает.
    pub fn delete_threads(&self) -> Result<(), PoolError> {
        if self.on_worker_thread() {
            return Err(PoolError::WorkerThread);
        }

        let mut threads = self.threads.lock();
        if threads.is_empty() {
            return Ok(());
        }

        let observer = self.shared.state.lock().observer.clone();
        self.teardown(&mut threads);

        tracing::debug!("worker threads stopped");
        emit(&observer, || PoolEvent::Stopped);
        Ok(())
    }

    fn teardown(&self, threads: &mut Vec<JoinHandle<()>>) {
        {
            let mut st = self.shared.state.lock();
            st.accepting = false;
            st.stopping = true;
        }
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();

        let me = thread::current().id();
        let mut current = None;
        for (id, handle) in threads.drain(..).enumerate() {
            // воркер, отпустивший последнюю ссылку на пул, себя не ждёт
            if handle.thread().id() == me {
                current = Some(id);
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }

        // Остальные воркеры уже вышли: всё, что осталось в очереди,
        // выполняется здесь, до освобождения буфера.
        if let Some(id) = current {
            let observer = self.shared.state.lock().observer.clone();
            loop {
                let task = self.shared.pop(&mut self.shared.state.lock());
                let Some(task) = task else { break };
                self.shared.run(id, task, &observer);
            }
        }

        let ring = {
            let mut st = self.shared.state.lock();
            st.stopping = false;
            st.observer = None;
            st.ring.take()
        };
        drop(ring);

        self.shared.workers.store(0, Ordering::Relaxed);
        self.shared.capacity.store(0, Ordering::Relaxed);
    }

    fn on_worker_thread(&self) -> bool {
        CURRENT_POOL.with(|pool| pool.get()) == self.shared.key()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().accepting
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.load(Ordering::Relaxed)
    }

    /// Всего слотов очереди, `0` у пустого пула.
    pub fn capacity(&self) -> usize {
        self.shared.capacity.load(Ordering::Relaxed)
    }

    /// Задачи, ждущие в очереди.
    #[inline]
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Принятые и ещё не завершённые задачи: в очереди или выполняются.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        self.shared.snapshot()
    }

    /// Мониторинг метрик с callback каждые `interval`, пока возвращённый
    /// [`Monitor`] не остановлен или не дропнут.
    pub fn start_monitoring<F>(
        &self,
        interval: Duration,
        callback: F,
    ) -> Result<Monitor, PoolError>
    where
        F: Fn(PoolMetrics) + Send + 'static,
    {
        let shared = self.shared.clone();
        Ok(Monitor::spawn(interval, move || shared.snapshot(), callback)?)
    }

    /// Ждать завершения всех принятых задач.
    ///
    /// Из воркеров самого пула не вызывается: они ждали бы сами себя.
    pub fn drain_all(&self) -> Result<(), PoolError> {
        if self.on_worker_thread() {
            return Err(PoolError::WorkerThread);
        }

        let shared = &*self.shared;
        let mut st = shared.state.lock();
        while shared.in_flight.load(Ordering::Acquire) > 0 {
            shared.drained.wait(&mut st);
        }
        Ok(())
    }

    // ===== отправка задач =====

    pub fn try_submit<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Priority::Normal, None, false, Box::new(f))
    }

    pub fn try_submit_urgent<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Priority::Urgent, None, false, Box::new(f))
    }

    /// Ждёт места в очереди. Ошибка только если пул не запущен.
    pub fn submit_blocking<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Priority::Normal, None, true, Box::new(f))
    }

    pub fn submit_blocking_urgent<F>(&self, f: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Priority::Urgent, None, true, Box::new(f))
    }

    /// Отправка через `handle`, который сообщает о завершении (а у
    /// [`ResultHandle`](crate::ResultHandle) хранит результат).
    ///
    /// Отклоняется, пока предыдущая задача этого хэндла выполняется.
    pub fn try_submit_with<H, F>(&self, handle: &H, f: F) -> Result<(), SubmitError>
    where
        H: Handle,
        F: FnOnce() -> H::Output + Send + 'static,
    {
        self.enqueue(Priority::Normal, Some(handle.completion()), false, handle.bind(f))
    }

    pub fn try_submit_urgent_with<H, F>(&self, handle: &H, f: F) -> Result<(), SubmitError>
    where
        H: Handle,
        F: FnOnce() -> H::Output + Send + 'static,
    {
        self.enqueue(Priority::Urgent, Some(handle.completion()), false, handle.bind(f))
    }

    /// Ждёт, пока в очереди есть место и `handle` свободен.
    pub fn submit_blocking_with<H, F>(&self, handle: &H, f: F) -> Result<(), SubmitError>
    where
        H: Handle,
        F: FnOnce() -> H::Output + Send + 'static,
    {
        self.enqueue(Priority::Normal, Some(handle.completion()), true, handle.bind(f))
    }

    pub fn submit_blocking_urgent_with<H, F>(&self, handle: &H, f: F) -> Result<(), SubmitError>
    where
        H: Handle,
        F: FnOnce() -> H::Output + Send + 'static,
    {
        self.enqueue(Priority::Urgent, Some(handle.completion()), true, handle.bind(f))
    }

    // ===== с заранее захваченными аргументами =====
    //
    // `args` клонируются в момент отправки. Паника в `Clone` возвращается как
    // [`SubmitError::Construction`]; очередь и счётчики при этом не меняются.

    pub fn try_submit_cloned<T, F>(&self, args: &T, f: F) -> Result<(), SubmitError>
    where
        T: Clone + Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        self.submit_cloned(Priority::Normal, false, args, f)
    }

    pub fn try_submit_urgent_cloned<T, F>(&self, args: &T, f: F) -> Result<(), SubmitError>
    where
        T: Clone + Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        self.submit_cloned(Priority::Urgent, false, args, f)
    }

    pub fn submit_blocking_cloned<T, F>(&self, args: &T, f: F) -> Result<(), SubmitError>
    where
        T: Clone + Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        self.submit_cloned(Priority::Normal, true, args, f)
    }

    pub fn submit_blocking_urgent_cloned<T, F>(&self, args: &T, f: F) -> Result<(), SubmitError>
    where
        T: Clone + Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        self.submit_cloned(Priority::Urgent, true, args, f)
    }

    pub fn try_submit_cloned_with<H, T, F>(
        &self,
        handle: &H,
        args: &T,
        f: F,
    ) -> Result<(), SubmitError>
    where
        H: Handle,
        T: Clone + Send + 'static,
        F: FnOnce(T) -> H::Output + Send + 'static,
    {
        self.submit_cloned_with(Priority::Normal, false, handle, args, f)
    }

    pub fn try_submit_urgent_cloned_with<H, T, F>(
        &self,
        handle: &H,
        args: &T,
        f: F,
    ) -> Result<(), SubmitError>
    where
        H: Handle,
        T: Clone + Send + 'static,
        F: FnOnce(T) -> H::Output + Send + 'static,
    {
        self.submit_cloned_with(Priority::Urgent, false, handle, args, f)
    }

    pub fn submit_blocking_cloned_with<H, T, F>(
        &self,
        handle: &H,
        args: &T,
        f: F,
    ) -> Result<(), SubmitError>
    where
        H: Handle,
        T: Clone + Send + 'static,
        F: FnOnce(T) -> H::Output + Send + 'static,
    {
        self.submit_cloned_with(Priority::Normal, true, handle, args, f)
    }

    pub fn submit_blocking_urgent_cloned_with<H, T, F>(
        &self,
        handle: &H,
        args: &T,
        f: F,
    ) -> Result<(), SubmitError>
    where
        H: Handle,
        T: Clone + Send + 'static,
        F: FnOnce(T) -> H::Output + Send + 'static,
    {
        self.submit_cloned_with(Priority::Urgent, true, handle, args, f)
    }

    fn submit_cloned<T, F>(
        &self,
        priority: Priority,
        blocking: bool,
        args: &T,
        f: F,
    ) -> Result<(), SubmitError>
    where
        T: Clone + Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let args = capture(args).map_err(|err| self.deny(priority, None, err))?;
        self.enqueue(priority, None, blocking, Box::new(move || f(args)))
    }

    fn submit_cloned_with<H, T, F>(
        &self,
        priority: Priority,
        blocking: bool,
        handle: &H,
        args: &T,
        f: F,
    ) -> Result<(), SubmitError>
    where
        H: Handle,
        T: Clone + Send + 'static,
        F: FnOnce(T) -> H::Output + Send + 'static,
    {
        let completion = handle.completion();
        let args = capture(args).map_err(|err| self.deny(priority, Some(completion), err))?;
        self.enqueue(priority, Some(completion), blocking, handle.bind(move || f(args)))
    }

    fn enqueue(
        &self,
        priority: Priority,
        completion: Option<&Completion>,
        blocking: bool,
        task: Task,
    ) -> Result<(), SubmitError> {
        let shared = &*self.shared;
        let mut task = Some(task);
        let mut delayed = false;

        let mut st = shared.state.lock();
        let queued = loop {
            match shared.try_commit(&mut st, priority, completion, &mut task) {
                Ok(queued) => break queued,
                Err(reason) if blocking && reason.is_retryable() => {
                    if !delayed {
                        delayed = true;
                        shared.metrics.delayed();
                        let observer = st.observer.clone();
                        MutexGuard::unlocked(&mut st, || {
                            tracing::trace!(?priority, %reason, "submission delayed");
                            emit(&observer, || PoolEvent::Delayed { priority });
                        });
                        continue;
                    }
                    match (&reason, completion) {
                        (SubmitError::HandleBusy, Some(completion)) => {
                            MutexGuard::unlocked(&mut st, || completion.wait())
                        }
                        _ => shared.not_full.wait(&mut st),
                    }
                }
                Err(reason) => {
                    drop(st);
                    drop(task);
                    return Err(self.deny(priority, completion, reason));
                }
            }
        };
        let observer = st.observer.clone();
        drop(st);

        shared.not_empty.notify_one();
        shared.metrics.accepted(queued);
        tracing::trace!(?priority, queued, "task accepted");
        emit(&observer, || PoolEvent::Accepted { priority, queued });
        Ok(())
    }

    fn deny(
        &self,
        priority: Priority,
        completion: Option<&Completion>,
        reason: SubmitError,
    ) -> SubmitError {
        if let Some(completion) = completion {
            completion.set_denied(true);
        }
        self.shared.metrics.denied();
        tracing::trace!(?priority, %reason, "submission denied");

        let observer = self.shared.state.lock().observer.clone();
        emit(&observer, || PoolEvent::Denied {
            priority,
            reason: reason.clone(),
        });
        reason
    }
}

impl<A: SlotAllocator> Drop for TaskPool<A> {
    fn drop(&mut self) {
        let mut threads = std::mem::take(self.threads.get_mut());
        if !threads.is_empty() {
            self.teardown(&mut threads);
            tracing::debug!("worker threads stopped");
        }
    }
}

impl<A: SlotAllocator> fmt::Debug for TaskPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("workers", &self.worker_count())
            .field("capacity", &self.capacity())
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
