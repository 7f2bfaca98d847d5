use std::{alloc::Layout, ptr::NonNull};

/// Источник памяти для массива слотов очереди.
///
/// Пул резервирует один непрерывный блок при создании потоков и освобождает
/// его при их удалении. Подходит любой аллокатор с контрактом reserve/release.
pub trait SlotAllocator: Send + Sync + 'static {
    /// Зарезервировать `layout.size()` байт с выравниванием `layout.align()`.
    ///
    /// `None` означает, что создание потоков завершится ошибкой без побочных эффектов.
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Вернуть блок, полученный из [`reserve`](Self::reserve).
    ///
    /// # Safety
    /// `ptr` получен из `reserve` этого же аллокатора с тем же `layout`
    /// и после вызова больше не используется.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Аллокатор поверх глобальной кучи.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl SlotAllocator for SystemAllocator {
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: размер layout ненулевой.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

impl<A: SlotAllocator> SlotAllocator for std::sync::Arc<A> {
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).reserve(layout)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        (**self).release(ptr, layout)
    }
}
