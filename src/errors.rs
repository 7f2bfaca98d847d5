use std::io;

/// Ошибки запуска и остановки пула.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("pool already owns worker threads")]
    AlreadyRunning,

    #[error("at least one worker thread is required")]
    NoWorkers,

    /// Один слот очереди всегда свободен, иначе полную не отличить от пустой.
    #[error("queue capacity {capacity} too small for {workers} workers, need {}", .workers + 1)]
    CapacityTooSmall { capacity: usize, workers: usize },

    #[error("slot allocator refused to reserve {bytes} bytes")]
    AllocationFailed { bytes: usize },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    /// Воркер ждал бы (или джойнил) сам себя.
    #[error("operation is not allowed from one of the pool's own worker threads")]
    WorkerThread,
}

/// Причины отказа в приёме задачи.
///
/// Отклонённая отправка не меняет ни очередь, ни счётчики.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("pool is not running")]
    NotRunning,

    #[error("task queue is full")]
    QueueFull,

    #[error("handle already has a task in flight")]
    HandleBusy,

    /// Паника при сборке задачи (например, при клонировании аргументов).
    #[error("task construction failed: {0}")]
    Construction(String),
}

impl SubmitError {
    /// Отказы, которые могут пройти сами, если подождать.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::QueueFull | SubmitError::HandleBusy)
    }
}

/// Ошибки чтения результата из [`ResultHandle`](crate::ResultHandle).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("last submission against this handle was denied")]
    Denied,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("handle holds no result")]
    Empty,
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
