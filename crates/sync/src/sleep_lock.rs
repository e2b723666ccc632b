//! 睡眠锁
//!
//! 提供可能阻塞的互斥锁。与 [`crate::SpinLock`] 不同，睡眠锁在竞争时
//! 通过 [`crate::ArchOps::yield_now`] 让出 CPU，而不是关中断忙等，
//! 因此持有者可以执行较长的临界区（例如遍历反向映射链表）。
//!
//! # 使用约束
//!
//! - 不允许在中断上下文中获取睡眠锁。
//! - 不允许在持有自旋锁（中断已关闭）时获取睡眠锁，否则 yield 会把
//!   关中断状态带进调度器。
//! - 不可重入。

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch_ops;

/// 可睡眠的互斥锁。
///
/// 在调度器尚未启动的早期阶段，`yield_now` 的实现会退化为自旋提示，
/// 此时睡眠锁的行为等价于一把不关中断的自旋锁。
#[derive(Debug)]
pub struct SleepLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> SleepLock<T> {
    /// 创建一个新的 SleepLock 实例。
    pub const fn new(data: T) -> Self {
        SleepLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// 获取睡眠锁，竞争时让出 CPU 直到成功。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            arch_ops().yield_now();
        }

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 尝试获取睡眠锁，失败时立即返回 None。
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SleepLockGuard {
                lock: self,
                data: unsafe { &mut *self.data.get() },
            })
        } else {
            None
        }
    }

    /// 仅释放锁标志。
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// SleepLock 的 RAII 保护器，离开作用域时自动释放锁。
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<T> core::ops::Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl<T> core::ops::DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

// SAFETY: 锁标志保证了对内部数据的互斥访问。
unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::register_mocks;

    #[test]
    fn test_sleep_lock_round_trip() {
        register_mocks();
        let lock = SleepLock::new(0usize);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn test_try_lock_contention() {
        register_mocks();
        let lock = SleepLock::new(());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }
}
