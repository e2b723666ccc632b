//! 内存管理相关操作的 Mock 实现
//!
//! 注意：这里不直接依赖 `mm` crate（避免循环依赖）。
//! `mm` crate 在 `cfg(test)` 下为这些类型桥接其 trait
//! （例如 `ArchMmOps` / `MmConfig`）。

/// Mock 的内存管理架构操作
///
/// 默认实现采用"恒等映射"（vaddr == paddr），这样测试可以把宿主机堆上
/// 分配的、按 2MB 对齐的内存区域当作"物理内存"交给帧分配器管理，
/// 页表遍历器也能直接通过宿主机指针访问页表节点。
pub struct MockMmOps;

impl MockMmOps {
    pub const fn new() -> Self {
        Self
    }

    /// 将物理地址转换为虚拟地址（测试默认：恒等映射）
    pub fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        paddr
    }

    /// 将虚拟地址转换为物理地址（测试默认：恒等映射）
    ///
    /// # Safety
    /// 仅用于测试环境的可控输入。
    pub unsafe fn vaddr_to_paddr(&self, vaddr: usize) -> usize {
        vaddr
    }

    /// 刷新本地 TLB（测试默认：no-op）
    pub fn tlb_flush_local(&self) {}

    /// 发送 TLB flush IPI（测试默认：no-op）
    pub fn send_tlb_flush_ipi_all(&self) {}

    /// CPU 数量（测试默认：1，使 TLB shootdown 协议短路）
    pub fn num_cpus(&self) -> usize {
        1
    }
}

impl Default for MockMmOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_MM_OPS: MockMmOps = MockMmOps::new();

/// Mock 的内存布局配置
///
/// 线性映射偏移为 0（配合恒等映射），MMIO 窗口取一段不会与宿主机地址
/// 冲突的高位虚拟区间（1GB，便于伙伴分配器测试覆盖完整的分裂/合并链）。
pub struct MockMmConfig;

/// Mock MMIO 窗口起始地址
pub const MOCK_MMIO_BASE: usize = 0xffff_a100_0000_0000;
/// Mock MMIO 窗口大小（1GB）
pub const MOCK_MMIO_SIZE: usize = 0x4000_0000;

impl MockMmConfig {
    pub const fn new() -> Self {
        Self
    }

    /// 线性映射偏移（测试默认：0）
    pub fn linear_offset(&self) -> usize {
        0
    }

    /// 线性映射覆盖的物理地址上限（测试默认：全部物理地址）
    pub fn linear_map_limit(&self) -> usize {
        usize::MAX
    }

    /// DMA 区域物理上界（16MB）
    pub fn dma_limit(&self) -> usize {
        16 << 20
    }

    /// MMIO 虚拟窗口起始
    pub fn mmio_base(&self) -> usize {
        MOCK_MMIO_BASE
    }

    /// MMIO 虚拟窗口结束
    pub fn mmio_top(&self) -> usize {
        MOCK_MMIO_BASE + MOCK_MMIO_SIZE
    }

    /// 用户态最大线性地址
    pub fn user_max_vaddr(&self) -> usize {
        0x0000_7fff_ffff_f000
    }
}

impl Default for MockMmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_MM_CONFIG: MockMmConfig = MockMmConfig::new();
