use alloc::sync::Arc;
use core::cell::UnsafeCell;

use spin::Mutex;

/// Masks the controller's interrupt line while the engine lock is held, so an
/// interrupt handler on the same CPU never spins on a lock its own context owns.
pub trait IrqMask: Send + Sync {
    /// Disables the interrupt and returns whether it was enabled.
    fn disable(&self) -> bool;
    fn restore(&self, was_enabled: bool);
}

pub(crate) struct IrqLock<T> {
    inner: Mutex<()>,
    mask: Option<Arc<dyn IrqMask>>,
    data: UnsafeCell<T>,
}

unsafe impl<T> Sync for IrqLock<T> where T: Send {}
unsafe impl<T> Send for IrqLock<T> where T: Send {}

impl<T> IrqLock<T> {
    pub fn new(data: T, mask: Option<Arc<dyn IrqMask>>) -> Self {
        Self {
            inner: Mutex::new(()),
            mask,
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let _disable_guard = DisableIrqGuard::new(self.mask.as_deref());
        let guard = self.inner.lock();
        IrqLockGuard {
            _guard: guard,
            data: unsafe { &mut *self.data.get() },
            _disable_guard,
        }
    }

    /// Lock without touching the interrupt mask. For callers already running
    /// in the interrupt handler.
    pub fn lock_irq(&self) -> IrqLockGuard<'_, T> {
        let guard = self.inner.lock();
        IrqLockGuard {
            _guard: guard,
            data: unsafe { &mut *self.data.get() },
            _disable_guard: DisableIrqGuard::new(None),
        }
    }
}

struct DisableIrqGuard<'a> {
    mask: Option<&'a dyn IrqMask>,
    enable: bool,
}

impl<'a> DisableIrqGuard<'a> {
    fn new(mask: Option<&'a dyn IrqMask>) -> Self {
        let enable = mask.map(|m| m.disable()).unwrap_or(false);
        Self { mask, enable }
    }
}

impl Drop for DisableIrqGuard<'_> {
    fn drop(&mut self) {
        if let Some(mask) = self.mask {
            mask.restore(self.enable);
        }
    }
}

pub(crate) struct IrqLockGuard<'a, T> {
    _guard: spin::MutexGuard<'a, ()>,
    data: &'a mut T,
    _disable_guard: DisableIrqGuard<'a>,
}

impl<T> core::ops::Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> core::ops::DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}
