//! Кольцевой буфер задач фиксированной ёмкости.
//!
//! Один слот всегда свободен: `head == tail` - пусто, `tail + 1 == head`
//! (по модулю ёмкости) - полно. Все операции идут под мьютексом пула,
//! перед вставкой вызывающий проверяет [`Ring::is_full`].

use crate::{alloc::SlotAllocator, errors::PoolError, handle::Task};
use std::{alloc::Layout, mem, ptr::NonNull, sync::Arc};

type Slot = Option<Task>;

pub(crate) struct Ring<A: SlotAllocator> {
    slots: NonNull<Slot>,
    layout: Layout,
    capacity: usize,
    head: usize,
    tail: usize,
    // срочные задачи перед всеми обычными, старшие первыми
    urgent: usize,
    alloc: Arc<A>,
}

// SAFETY: в слотах лежат `Send`-задачи, доступ к ним только через `&mut self`.
unsafe impl<A: SlotAllocator> Send for Ring<A> {}

impl<A: SlotAllocator> Ring<A> {
    pub(crate) fn allocate(capacity: usize, alloc: Arc<A>) -> Result<Self, PoolError> {
        let layout = Layout::array::<Slot>(capacity).map_err(|_| PoolError::AllocationFailed {
            bytes: capacity.saturating_mul(mem::size_of::<Slot>()),
        })?;
        let raw = alloc
            .reserve(layout)
            .ok_or(PoolError::AllocationFailed { bytes: layout.size() })?;
        let slots = raw.cast::<Slot>();

        for i in 0..capacity {
            // SAFETY: `i < capacity`, а блок вмещает `capacity` слотов.
            unsafe { slots.as_ptr().add(i).write(None) };
        }

        Ok(Self {
            slots,
            layout,
            capacity,
            head: 0,
            tail: 0,
            urgent: 0,
            alloc,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        (self.tail + self.capacity - self.head) % self.capacity
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.advance(self.tail) == self.head
    }

    #[inline]
    fn advance(&self, idx: usize) -> usize {
        (idx + 1) % self.capacity
    }

    #[inline]
    fn retreat(&self, idx: usize) -> usize {
        (idx + self.capacity - 1) % self.capacity
    }

    #[inline]
    fn slot(&mut self, idx: usize) -> &mut Slot {
        debug_assert!(idx < self.capacity);
        // SAFETY: все индексы меньше `capacity` инициализированы в `allocate`.
        unsafe { &mut *self.slots.as_ptr().add(idx) }
    }

    /// Обычный приоритет: в хвост.
    pub(crate) fn push_back(&mut self, task: Task) {
        debug_assert!(!self.is_full());
        let tail = self.tail;
        *self.slot(tail) = Some(task);
        self.tail = self.advance(tail);
    }

    /// Срочный приоритет: за уже ждущими срочными задачами, перед всеми обычными.
    pub(crate) fn push_urgent(&mut self, task: Task) {
        debug_assert!(!self.is_full());
        self.head = self.retreat(self.head);

        let mut idx = self.head;
        for _ in 0..self.urgent {
            let next = self.advance(idx);
            let moved = self.slot(next).take();
            *self.slot(idx) = moved;
            idx = next;
        }

        *self.slot(idx) = Some(task);
        self.urgent += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<Task> {
        if self.is_empty() {
            return None;
        }

        let head = self.head;
        let task = self.slot(head).take();
        self.head = self.advance(head);
        self.urgent = self.urgent.saturating_sub(1);
        task
    }
}

impl<A: SlotAllocator> Drop for Ring<A> {
    fn drop(&mut self) {
        for i in 0..self.capacity {
            // SAFETY: все слоты инициализированы; оставшиеся задачи дропаются.
            unsafe { self.slots.as_ptr().add(i).drop_in_place() };
        }
        // SAFETY: блок получен из `reserve` с этим же layout.
        unsafe { self.alloc.release(self.slots.cast(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SystemAllocator;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ring(capacity: usize) -> Ring<SystemAllocator> {
        Ring::allocate(capacity, Arc::new(SystemAllocator)).unwrap()
    }

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, id: u32) -> Task {
        let log = log.clone();
        Box::new(move || log.lock().push(id))
    }

    fn drain(ring: &mut Ring<SystemAllocator>) {
        while let Some(task) = ring.pop_front() {
            task();
        }
    }

    #[test]
    fn keeps_one_slot_free() {
        let mut r = ring(4);
        assert!(r.is_empty());

        for _ in 0..3 {
            assert!(!r.is_full());
            r.push_back(Box::new(|| {}));
        }

        assert!(r.is_full());
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn wraps_around() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut r = ring(3);

        for round in 0..5u32 {
            r.push_back(recorder(&log, round * 2));
            r.push_back(recorder(&log, round * 2 + 1));
            assert!(r.is_full());
            drain(&mut r);
        }

        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn urgent_runs_before_normal_in_submission_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut r = ring(8);

        r.push_back(recorder(&log, 1));
        r.push_back(recorder(&log, 2));
        r.push_urgent(recorder(&log, 10));
        r.push_back(recorder(&log, 3));
        r.push_urgent(recorder(&log, 11));
        r.push_urgent(recorder(&log, 12));

        drain(&mut r);
        assert_eq!(*log.lock(), vec![10, 11, 12, 1, 2, 3]);
    }

    #[test]
    fn urgent_count_resets_as_front_is_consumed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut r = ring(5);

        r.push_urgent(recorder(&log, 10));
        r.push_back(recorder(&log, 1));
        r.pop_front().unwrap()();
        r.push_urgent(recorder(&log, 11));
        r.push_urgent(recorder(&log, 12));

        drain(&mut r);
        assert_eq!(*log.lock(), vec![10, 11, 12, 1]);
    }

    #[test]
    fn dropping_releases_queued_tasks() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        {
            let mut r = ring(4);
            for _ in 0..3 {
                let t = Tracked(dropped.clone());
                r.push_back(Box::new(move || drop(t)));
            }
        }
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }
}
