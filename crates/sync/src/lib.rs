//! 同步原语
//!
//! 向其它内核模块提供基本的锁原语：
//! 自旋锁（关中断、不可睡眠）与睡眠锁（竞争时让出 CPU、可睡眠）。
//!
//! # 架构依赖
//!
//! 此 crate 通过 [`ArchOps`] trait 抽象架构相关操作（中断开关、CPU 拓扑、
//! 让出执行权）。使用前必须调用 [`register_arch_ops`] 注册实现。

#![no_std]

#[cfg(test)]
extern crate std;

mod intr_guard;
mod raw_spin_lock;
mod sleep_lock;
mod spin_lock;

#[cfg(test)]
mod test_util;

pub use intr_guard::*;
pub use raw_spin_lock::*;
pub use sleep_lock::*;
pub use spin_lock::*;

use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关操作的 trait
///
/// 由内核的架构层实现并注册，提供中断控制和 CPU 信息。
pub trait ArchOps: Send + Sync {
    /// 读取并禁用本地中断，返回之前的标志位
    ///
    /// # Safety
    /// 调用者必须确保在适当的上下文中调用
    unsafe fn read_and_disable_interrupts(&self) -> usize;

    /// 恢复中断状态
    ///
    /// # Safety
    /// `flags` 必须是之前 `read_and_disable_interrupts` 返回的值
    unsafe fn restore_interrupts(&self, flags: usize);

    /// 中断使能位在标志寄存器中的掩码
    fn interrupt_flag_mask(&self) -> usize;

    /// 获取当前 CPU ID
    fn cpu_id(&self) -> usize;

    /// 获取最大 CPU 数量
    fn max_cpu_count(&self) -> usize;

    /// 让出当前 CPU 的执行权（睡眠锁的竞争路径使用）
    ///
    /// 在调度器尚不可用的早期启动阶段，实现可以退化为自旋提示。
    fn yield_now(&self);
}

/// 全局架构操作实例（存储 fat pointer 的两个部分）
static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_arch_ops(ops: &'static dyn ArchOps) {
    let ptr = ops as *const dyn ArchOps;
    // SAFETY: fat pointer 的布局是 (data, vtable)，拆分存储后可无锁读取
    let (data, vtable) = unsafe { core::mem::transmute::<*const dyn ArchOps, (usize, usize)>(ptr) };
    ARCH_OPS_DATA.store(data, Ordering::Release);
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
}

/// 获取架构操作实例
#[inline]
pub(crate) fn arch_ops() -> &'static dyn ArchOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("sync: ArchOps not registered, call register_arch_ops first");
    }
    // SAFETY: data 和 vtable 是通过 register_arch_ops 设置的有效指针
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchOps>((data, vtable)) }
}
