//! Critical-section lock.
//!
//! Masks interrupts through the port before acquiring the inner spin flag
//! and restores the saved interrupt state when the guard drops. Early
//! returns and `?` inside a kernel operation therefore always leave the
//! critical section.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use super::loom_compat::{AtomicBool, AtomicU32, Ordering, spin_loop};
use crate::port::Port;

/// A spin lock that holds a port critical section while locked.
pub struct KernelLock<T> {
    locked: AtomicBool,
    depth: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: Access to `data` is serialized by `locked`; the guard is the only
// path to the data and exists at most once at a time.
unsafe impl<T: Send> Send for KernelLock<T> {}
// SAFETY: See above.
unsafe impl<T: Send> Sync for KernelLock<T> {}

impl<T> KernelLock<T> {
    /// Creates a new unlocked `KernelLock`.
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            depth: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Enters a critical section on `port`, then acquires the lock.
    pub fn lock<'a, P: Port + ?Sized>(&'a self, port: &'a P) -> KernelLockGuard<'a, T, P> {
        let saved = port.enter_critical();

        // TTAS spin to acquire.
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.depth.fetch_add(1, Ordering::Relaxed);
                return KernelLockGuard {
                    lock: self,
                    port,
                    saved,
                    _not_send: PhantomData,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock<'a, P: Port + ?Sized>(
        &'a self,
        port: &'a P,
    ) -> Option<KernelLockGuard<'a, T, P>> {
        let saved = port.enter_critical();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.depth.fetch_add(1, Ordering::Relaxed);
            Some(KernelLockGuard {
                lock: self,
                port,
                saved,
                _not_send: PhantomData,
            })
        } else {
            port.leave_critical(saved);
            None
        }
    }

    /// Number of live guards (0 or 1).
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }
}

/// RAII guard that releases the lock and the critical section on drop.
pub struct KernelLockGuard<'a, T, P: Port + ?Sized> {
    lock: &'a KernelLock<T>,
    port: &'a P,
    saved: u64,
    /// Interrupt state is per-CPU; the guard must stay on this thread.
    _not_send: PhantomData<*mut ()>,
}

impl<T, P: Port + ?Sized> Deref for KernelLockGuard<'_, T, P> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, P: Port + ?Sized> DerefMut for KernelLockGuard<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The lock is held, so we have exclusive access to the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, P: Port + ?Sized> Drop for KernelLockGuard<'_, T, P> {
    fn drop(&mut self) {
        self.lock.depth.fetch_sub(1, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        self.port.leave_critical(self.saved);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::port::host::HostPort;

    #[test]
    fn guard_masks_and_restores() {
        let port = HostPort::new();
        let lock = KernelLock::new(5u32);
        {
            let mut guard = lock.lock(&port);
            *guard += 1;
            assert_eq!(port.critical_nesting(), 1);
            assert_eq!(lock.depth(), 1);
        }
        assert_eq!(port.critical_nesting(), 0);
        assert_eq!(lock.depth(), 0);
        assert_eq!(*lock.lock(&port), 6);
    }

    #[test]
    fn try_lock_fails_while_held_and_restores() {
        let port = HostPort::new();
        let lock = KernelLock::new(());
        let guard = lock.lock(&port);
        assert!(lock.try_lock(&port).is_none());
        assert_eq!(port.critical_nesting(), 1);
        drop(guard);
        assert!(lock.try_lock(&port).is_some());
        assert_eq!(port.critical_nesting(), 0);
    }

    #[test]
    fn early_return_releases() {
        fn fails(lock: &KernelLock<u32>, port: &HostPort) -> Result<(), ()> {
            let guard = lock.lock(port);
            if *guard == 0 {
                return Err(());
            }
            Ok(())
        }

        let port = HostPort::new();
        let lock = KernelLock::new(0);
        assert_eq!(fails(&lock, &port), Err(()));
        assert_eq!(port.critical_nesting(), 0);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn contended_increments_are_serialized() {
        use std::sync::Arc;

        let port = Arc::new(HostPort::new());
        let lock = Arc::new(KernelLock::new(0u64));
        let handles: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let port = Arc::clone(&port);
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock(&*port) += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(&*port), 4000);
        assert_eq!(lock.depth(), 0);
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::sync::atomic::AtomicU32 as LoomU32;

    struct LoomPort {
        nesting: LoomU32,
    }

    impl Port for LoomPort {
        fn enter_critical(&self) -> u64 {
            u64::from(self.nesting.fetch_add(1, Ordering::AcqRel))
        }

        fn leave_critical(&self, _saved: u64) {
            self.nesting.fetch_sub(1, Ordering::AcqRel);
        }

        fn is_interrupt_context(&self) -> bool {
            false
        }

        fn switch_context(&self, _from: Option<crate::TaskId>, _to: Option<crate::TaskId>) {}
    }

    #[test]
    fn lock_is_exclusive_and_released() {
        loom::model(|| {
            let port = Arc::new(LoomPort {
                nesting: LoomU32::new(0),
            });
            let lock = Arc::new(KernelLock::new(0u32));

            let handles: std::vec::Vec<_> = (0..2)
                .map(|_| {
                    let port = Arc::clone(&port);
                    let lock = Arc::clone(&lock);
                    loom::thread::spawn(move || {
                        *lock.lock(&*port) += 1;
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(*lock.lock(&*port), 2);
            assert_eq!(lock.depth(), 0);
            assert_eq!(port.nesting.load(Ordering::Acquire), 0);
        });
    }
}
