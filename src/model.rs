use super::errors::SubmitError;

/// Куда в очереди попадает задача.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    /// В хвост очереди.
    #[default]
    Normal,
    /// Перед всеми обычными задачами, после ранее поставленных срочных.
    Urgent,
}

#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub workers: usize,
    pub capacity: usize,
    pub queued_tasks: usize,
    pub in_flight_tasks: usize,
    pub accepted_tasks: usize,
    pub denied_tasks: usize,
    pub delayed_tasks: usize,
    pub completed_tasks: usize,
    pub panicked_tasks: usize,
    pub peak_queued: usize,
}

impl PoolMetrics {
    /// Доля воркеров, занятых задачей.
    pub fn utilization(&self) -> f64 {
        if self.workers == 0 {
            return 0.0;
        }
        let executing = self.in_flight_tasks.saturating_sub(self.queued_tasks);
        executing.min(self.workers) as f64 / self.workers as f64
    }

    /// Доля занятых слотов очереди.
    pub fn queue_pressure(&self) -> f64 {
        let usable = self.capacity.saturating_sub(1);
        if usable == 0 {
            return 0.0;
        }
        self.queued_tasks as f64 / usable as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed_tasks + self.panicked_tasks;
        if total == 0 {
            return 1.0;
        }
        self.completed_tasks as f64 / total as f64
    }

    pub fn denial_rate(&self) -> f64 {
        let attempts = self.accepted_tasks + self.denied_tasks;
        if attempts == 0 {
            return 0.0;
        }
        self.denied_tasks as f64 / attempts as f64
    }
}

/// События для [`PoolObserver`](crate::PoolObserver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Started { workers: usize, capacity: usize },
    Accepted { priority: Priority, queued: usize },
    Denied { priority: Priority, reason: SubmitError },
    /// Блокирующая отправка не нашла места и ждёт.
    Delayed { priority: Priority },
    Completed,
    Panicked,
    Stopped,
}
