//! 内存管理子系统
//!
//! 本 crate 把一段平坦的物理内存变成地址空间、按需映射和通用内核堆：
//!
//! - [`frame_allocator`]：按 2MB 帧粒度、分区（zone）管理物理内存的位图分配器
//! - [`page_table`]：4 级页表（每级 512 项）的建立 / 拆除 / 翻译
//! - [`memory_space`]：地址空间（有序区域表）与反向映射（匿名映射记录）
//! - [`slab`]：建立在帧分配器之上的固定尺寸类内核堆
//! - [`mmio_buddy`]：设备寄存器虚拟地址窗口的伙伴分配器
//! - [`manager`]：把以上组件装配为一个显式构造的 [`manager::MemoryManager`]
//!
//! # 架构解耦
//!
//! 通过 trait 抽象与架构特定组件解耦：
//! - [`ArchMmOps`]：线性映射地址转换、TLB 操作、CPU 拓扑
//! - [`MmConfig`]：内存布局常量（线性映射偏移、MMIO 窗口、DMA 边界）
//!
//! 使用前必须调用 [`register_arch_ops`] 和 [`register_config`] 注册实现。
//! 宿主机测试通过 test-support 提供的恒等映射 Mock 完成注册。

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod arch_ops;
mod config;
mod error;

pub mod address;
pub mod frame_allocator;
pub mod manager;
pub mod memory_space;
pub mod mmio_buddy;
pub mod page_table;
pub mod slab;
pub mod tlb;

#[cfg(test)]
pub(crate) mod test_util;

pub use arch_ops::{ArchMmOps, arch_ops, register_arch_ops};
pub use config::{
    ENTRIES_PER_TABLE, MmConfig, PAGE_1G_SHIFT, PAGE_1G_SIZE, PAGE_2M_MASK, PAGE_2M_SHIFT,
    PAGE_2M_SIZE, PAGE_4K_MASK, PAGE_4K_SHIFT, PAGE_4K_SIZE, PAGE_L4_SHIFT, TABLE_LEVELS,
    mm_config, register_config,
};
pub use error::{MmError, MmResult};

// Re-export 常用类型
pub use address::{FrameNum, FrameRange, Paddr, UsizeConvert, Vaddr};
pub use frame_allocator::{
    FrameTable, MemoryDescriptor, MemoryKind, PageAttr, ZoneKind, ZonePolicy, ZoneSelect,
};
pub use manager::{BootInfo, KernelAllocator, MemoryManager, MemoryStat};
pub use memory_space::{AddressSpace, InsertOutcome, Region, RegionId, RegionOps, SegmentLayout, VmFlags};
pub use mmio_buddy::MmioPool;
pub use page_table::{EntryFlags, MapRequest, PageTable, TableAlloc};
pub use slab::KernelHeap;
