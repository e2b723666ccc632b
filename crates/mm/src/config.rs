//! 内存布局常量与配置 trait
//!
//! 页大小与页表形状是本子系统的编译期常量：两种页（4KB 小页、2MB 大页），
//! 4 级页表，每级 512 项。依赖内核映像链接方式的布局参数（线性映射偏移、
//! MMIO 窗口、DMA 边界）则通过 [`MmConfig`] 在启动时注册。

use core::sync::atomic::{AtomicUsize, Ordering};

/// 4KB 页的位移
pub const PAGE_4K_SHIFT: usize = 12;
/// 2MB 页的位移
pub const PAGE_2M_SHIFT: usize = 21;
/// 1GB 页的位移（仅用于伙伴分配器的块大小上限）
pub const PAGE_1G_SHIFT: usize = 30;
/// 顶级页表项覆盖范围的位移（512GB）
pub const PAGE_L4_SHIFT: usize = 39;

/// 4KB 页大小
pub const PAGE_4K_SIZE: usize = 1 << PAGE_4K_SHIFT;
/// 2MB 页大小
pub const PAGE_2M_SIZE: usize = 1 << PAGE_2M_SHIFT;
/// 1GB 块大小
pub const PAGE_1G_SIZE: usize = 1 << PAGE_1G_SHIFT;

/// 屏蔽 4KB 页内偏移的掩码
pub const PAGE_4K_MASK: usize = !(PAGE_4K_SIZE - 1);
/// 屏蔽 2MB 页内偏移的掩码
pub const PAGE_2M_MASK: usize = !(PAGE_2M_SIZE - 1);

/// 每个页表的项数（64 位下每表 4KB，每项 8B）
pub const ENTRIES_PER_TABLE: usize = 512;
/// 页表级数
pub const TABLE_LEVELS: usize = 4;

/// 内存布局配置
///
/// 此 trait 提供依赖链接布局 / 固件的内存管理参数。
/// 内核的平台层需要实现此 trait 并注册。
pub trait MmConfig: Send + Sync {
    /// 内核线性映射的虚拟基址（物理地址 0 对应的虚拟地址）
    fn linear_offset(&self) -> usize;

    /// 线性映射覆盖的物理地址上限；超过此界的帧归入
    /// [`crate::ZoneKind::Unmapped`] 区域
    fn linear_map_limit(&self) -> usize;

    /// DMA 区域的物理地址上界（低于此界的帧归入 DMA 区域）
    fn dma_limit(&self) -> usize;

    /// MMIO 虚拟地址窗口的起始地址
    fn mmio_base(&self) -> usize;

    /// MMIO 虚拟地址窗口的结束地址（不包含）
    fn mmio_top(&self) -> usize;

    /// 用户态可用的最大线性地址（不包含）
    fn user_max_vaddr(&self) -> usize;
}

static CONFIG_DATA: AtomicUsize = AtomicUsize::new(0);
static CONFIG_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册配置实现
///
/// # Safety
/// 必须在单线程环境下调用，且只能调用一次
pub unsafe fn register_config(config: &'static dyn MmConfig) {
    let ptr = config as *const dyn MmConfig;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn MmConfig, (usize, usize)>(ptr) };
    CONFIG_DATA.store(data, Ordering::Release);
    CONFIG_VTABLE.store(vtable, Ordering::Release);
}

/// 获取已注册的配置实现
///
/// # Panics
/// 如果尚未调用 [`register_config`] 注册实现，则 panic
#[inline]
pub fn mm_config() -> &'static dyn MmConfig {
    let data = CONFIG_DATA.load(Ordering::Acquire);
    let vtable = CONFIG_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("mm: MmConfig not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn MmConfig>((data, vtable)) }
}
