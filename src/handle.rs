use super::errors::{panic_message, HandleError};
use futures::task::AtomicWaker;
use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use std::{
    any::Any,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

/// Задача со стёртым типом: попадает в очередь при отправке и забирается
/// оттуда воркером, который её выполняет.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Состояние завершения, общее для хэндла и отправленной через него задачи.
#[doc(hidden)]
pub struct Completion {
    running: AtomicBool,
    denied: AtomicBool,
    panicked: AtomicBool,
    panic_msg: Mutex<Option<String>>,
    lock: Mutex<()>,
    done: Condvar,
    waker: AtomicWaker,
}

impl Completion {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            denied: AtomicBool::new(false),
            panicked: AtomicBool::new(false),
            panic_msg: Mutex::new(None),
            lock: Mutex::new(()),
            done: Condvar::new(),
            waker: AtomicWaker::new(),
        }
    }

    /// Занять хэндл под новую отправку. `false`, если задача ещё выполняется.
    pub(crate) fn arm(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::Release);
        if !denied {
            self.panicked.store(false, Ordering::Release);
            *self.panic_msg.lock() = None;
        }
    }

    fn record_panic(&self, payload: &(dyn Any + Send)) {
        *self.panic_msg.lock() = Some(panic_message(payload));
        self.panicked.store(true, Ordering::Release);
    }

    fn finish(&self) {
        self.running.store(false, Ordering::Release);
        self.notify();
    }

    fn notify(&self) {
        {
            let _guard = self.lock.lock();
            self.done.notify_all();
        }
        self.waker.wake();
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn wait(&self) {
        if !self.is_running() {
            return;
        }
        let mut guard = self.lock.lock();
        while self.is_running() {
            self.done.wait(&mut guard);
        }
    }
}

/// Выполняет `f` и записывает панику в `completion` до того, как вернуть
/// payload: хэндл обновлён раньше, чем воркер увидит раскрутку стека.
fn run_guarded<T>(
    completion: &Completion,
    f: impl FnOnce() -> T,
) -> Result<T, Box<dyn Any + Send>> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .inspect_err(|payload| completion.record_panic(&**payload))
}

mod sealed {
    pub trait Sealed {}
}

/// Хэндлы, через которые можно отслеживать отправленную задачу.
///
/// `Output` - то, что возвращает задача: `()` для [`TaskHandle`], `T` для
/// [`ResultHandle<T>`].
pub trait Handle: sealed::Sealed {
    type Output: Send + 'static;

    #[doc(hidden)]
    fn completion(&self) -> &Completion;

    /// Обернуть `f` так, чтобы результат выполнения попал в этот хэндл.
    #[doc(hidden)]
    fn bind<F>(&self, f: F) -> Task
    where
        F: FnOnce() -> Self::Output + Send + 'static;
}

/// Хэндл вызывающей стороны, отслеживает по одной задаче за раз.
///
/// Drop или reset хэндла с выполняющейся задачей блокируется до её завершения.
pub struct TaskHandle {
    inner: Arc<Completion>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Completion::new()),
        }
    }

    /// `true` с момента успешной отправки и до возврата из задачи.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// `true`, если последняя отправка через этот хэндл была отклонена.
    #[inline]
    pub fn was_denied(&self) -> bool {
        self.inner.denied.load(Ordering::Acquire)
    }

    /// `true`, если последняя задача завершилась паникой.
    #[inline]
    pub fn has_panicked(&self) -> bool {
        self.inner.panicked.load(Ordering::Acquire)
    }

    /// Сообщение паники последней задачи.
    pub fn panic_message(&self) -> Option<String> {
        self.inner.panic_msg.lock().clone()
    }

    /// Ждать, пока задача хэндла не завершится.
    pub fn wait(&self) {
        self.inner.wait();
    }

    /// Future, который завершается вместе с задачей хэндла.
    pub fn completed(&self) -> Completed<'_> {
        Completed { inner: &self.inner }
    }

    /// Дождаться задачи и сбросить флаги отказа и паники.
    pub fn reset(&self) {
        self.inner.wait();
        self.inner.set_denied(false);
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.inner.wait();
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("running", &self.is_running())
            .field("denied", &self.was_denied())
            .field("panicked", &self.has_panicked())
            .finish()
    }
}

impl sealed::Sealed for TaskHandle {}

impl Handle for TaskHandle {
    type Output = ();

    fn completion(&self) -> &Completion {
        &self.inner
    }

    fn bind<F>(&self, f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        let completion = self.inner.clone();
        Box::new(move || {
            let outcome = run_guarded(&completion, f);
            completion.finish();
            if let Err(payload) = outcome {
                panic::resume_unwind(payload);
            }
        })
    }
}

/// [`TaskHandle`], который ещё и хранит результат задачи.
pub struct ResultHandle<T> {
    handle: TaskHandle,
    value: Arc<Mutex<Option<T>>>,
}

impl<T: Send + 'static> ResultHandle<T> {
    pub fn new() -> Self {
        Self {
            handle: TaskHandle::new(),
            value: Arc::new(Mutex::new(None)),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    #[inline]
    pub fn was_denied(&self) -> bool {
        self.handle.was_denied()
    }

    #[inline]
    pub fn has_panicked(&self) -> bool {
        self.handle.has_panicked()
    }

    pub fn wait(&self) {
        self.handle.wait();
    }

    pub fn completed(&self) -> Completed<'_> {
        self.handle.completed()
    }

    /// Дождаться задачи и взять ссылку на результат последней выполненной.
    ///
    /// Пока guard жив, воркер со следующим результатом ждёт.
    pub fn get(&self) -> Result<MappedMutexGuard<'_, T>, HandleError> {
        self.wait();
        self.check()?;
        MutexGuard::try_map(self.value.lock(), Option::as_mut).map_err(|_| self.missing())
    }

    /// Дождаться задачи и забрать результат из хэндла.
    pub fn take(&self) -> Result<T, HandleError> {
        self.wait();
        self.check()?;
        self.value.lock().take().ok_or_else(|| self.missing())
    }

    /// Дождаться задачи, очистить результат и флаги.
    pub fn reset(&self) {
        self.handle.reset();
        self.value.lock().take();
    }

    fn check(&self) -> Result<(), HandleError> {
        if self.handle.has_panicked() {
            let msg = self.handle.panic_message().unwrap_or_default();
            return Err(HandleError::Panicked(msg));
        }
        Ok(())
    }

    fn missing(&self) -> HandleError {
        if self.handle.was_denied() {
            HandleError::Denied
        } else {
            HandleError::Empty
        }
    }
}

impl<T: Send + 'static> Default for ResultHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle").field("handle", &self.handle).finish()
    }
}

impl<T> sealed::Sealed for ResultHandle<T> {}

impl<T: Send + 'static> Handle for ResultHandle<T> {
    type Output = T;

    fn completion(&self) -> &Completion {
        &self.handle.inner
    }

    fn bind<F>(&self, f: F) -> Task
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let completion = self.handle.inner.clone();
        let slot = self.value.clone();
        Box::new(move || {
            let outcome = run_guarded(&completion, f);
            let payload = match outcome {
                Ok(value) => {
                    *slot.lock() = Some(value);
                    None
                }
                Err(payload) => {
                    slot.lock().take();
                    Some(payload)
                }
            };
            completion.finish();
            if let Some(payload) = payload {
                panic::resume_unwind(payload);
            }
        })
    }
}

/// Future из [`TaskHandle::completed`].
pub struct Completed<'a> {
    inner: &'a Completion,
}

impl Future for Completed<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.inner.is_running() {
            return Poll::Ready(());
        }
        self.inner.waker.register(cx.waker());
        if self.inner.is_running() {
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}
