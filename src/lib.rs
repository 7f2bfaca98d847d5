//! Пул потоков с ограниченной кольцевой очередью задач: фиксированная группа
//! воркеров разбирает очередь заданной ёмкости.
//!
//! # Features
//! - Backpressure: при полной очереди задача отклоняется
//! - Два приоритета, обычный (в хвост) и срочный (в голову)
//! - Хэндлы завершения задач, в том числе с результатом
//! - Барьер `drain_all` и остановка с дочисткой очереди
//! - Подключаемый аллокатор буфера очереди
//! - Счётчики, наблюдатель событий и периодический мониторинг

pub mod alloc;
pub mod errors;
pub mod handle;
pub mod metrics;
pub mod model;
pub mod pool;
mod ring;

pub use alloc::{SlotAllocator, SystemAllocator};
pub use errors::{HandleError, PoolError, SubmitError};
pub use handle::{Completed, Handle, ResultHandle, Task, TaskHandle};
pub use metrics::{EventLog, Monitor, PoolObserver};
pub use model::{PoolEvent, PoolMetrics, Priority};
pub use pool::{Config, TaskPool};
