//! 架构相关内存管理操作 trait 定义和注册

use core::sync::atomic::{AtomicUsize, Ordering};

/// 架构相关内存管理操作
///
/// 此 trait 抽象了架构特定的内存操作，包括线性映射的地址转换和 TLB 管理。
/// 内核的架构层需要实现此 trait 并注册；宿主机测试注册恒等映射的 Mock。
pub trait ArchMmOps: Send + Sync {
    /// 将物理地址转换为线性映射区域中的虚拟地址
    fn paddr_to_vaddr(&self, paddr: usize) -> usize;

    /// 将线性映射区域中的虚拟地址转换为物理地址
    ///
    /// # Safety
    /// 调用者必须确保虚拟地址位于线性映射区域内
    unsafe fn vaddr_to_paddr(&self, vaddr: usize) -> usize;

    /// 刷新本地 CPU 的全部 TLB 条目
    fn tlb_flush_local(&self);

    /// 向所有其它 CPU 广播 TLB flush IPI
    ///
    /// 收到 IPI 的 CPU 在完成本地刷新后必须调用
    /// [`crate::tlb::acknowledge`]，否则发起方会一直等待。
    fn send_tlb_flush_ipi_all(&self);

    /// 获取 CPU 数量（用于 TLB shootdown 的应答计数）
    fn num_cpus(&self) -> usize;
}

static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_arch_ops(ops: &'static dyn ArchMmOps) {
    let ptr = ops as *const dyn ArchMmOps;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn ArchMmOps, (usize, usize)>(ptr) };
    ARCH_OPS_DATA.store(data, Ordering::Release);
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
}

/// 获取已注册的架构操作实现
///
/// # Panics
/// 如果尚未调用 [`register_arch_ops`] 注册实现，则 panic
#[inline]
pub fn arch_ops() -> &'static dyn ArchMmOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("mm: ArchMmOps not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchMmOps>((data, vtable)) }
}
