use alloc::sync::Arc;
use core::{
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
};

use futures::task::AtomicWaker;
use spin::Mutex;

/// Producer half of a one-shot completion slot. Consumed by `set_finished`.
pub(crate) struct Finished<C> {
    inner: Arc<FinishedData<C>>,
}

struct FinishedData<C> {
    finished: AtomicBool,
    waker: AtomicWaker,
    data: Mutex<Option<C>>,
}

impl<C> Finished<C> {
    pub fn new() -> (Self, TWaiter<C>) {
        let inner = Arc::new(FinishedData {
            finished: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            data: Mutex::new(None),
        });
        (
            Self {
                inner: inner.clone(),
            },
            TWaiter { finished: inner },
        )
    }

    pub fn set_finished(self, value: C) {
        *self.inner.data.lock() = Some(value);
        self.inner.finished.store(true, Ordering::Release);
        self.inner.waker.wake();
    }
}

/// Resolves once the matching [`Finished`] is set.
pub struct TWaiter<C> {
    finished: Arc<FinishedData<C>>,
}

impl<C> TWaiter<C> {
    pub fn is_finished(&self) -> bool {
        self.finished.finished.load(Ordering::Acquire)
    }

    fn get_finished(&self) -> Option<C> {
        if !self.is_finished() {
            return None;
        }
        self.finished.data.lock().take()
    }
}

impl<C> Future for TWaiter<C> {
    type Output = C;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(res) = this.get_finished() {
            return Poll::Ready(res);
        }
        this.finished.waker.register(cx.waker());
        // 注册之后再查一次，避免丢掉并发的 wake
        match this.get_finished() {
            Some(res) => Poll::Ready(res),
            None => Poll::Pending,
        }
    }
}
