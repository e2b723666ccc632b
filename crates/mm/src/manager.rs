//! 内存管理器：子系统的装配与对外接口
//!
//! [`MemoryManager`] 把帧分配器、内核堆、MMIO 伙伴池和内核地址空间
//! 装配成一个显式构造的上下文。初始化顺序：
//!
//! 1. 堆自举（此后内核把全局分配器指向本堆，容器类型可用）；
//! 2. 由启动内存图构造帧分配器，预留第 0 帧、内核映像与自举堆；
//! 3. 堆与帧分配器挂接（堆获得扩容能力）；
//! 4. 采用启动页表根，把所有已线性映射区域的帧以内核大页重新映射
//!    进线性空间，然后整体刷新 TLB；
//! 5. 装配内核地址空间的段布局标记；
//! 6. 建立 MMIO 伙伴池。
//!
//! 内核全局实例通过 [`MemoryManager::install_global`] 安装一次；
//! 单元测试用合成内存图构造私有实例。

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, null_mut};
use log::{info, warn};
use once_cell::race::OnceBox;
use sync::SleepLock;

use crate::address::{Paddr, UsizeConvert, Vaddr};
use crate::arch_ops;
use crate::config::{PAGE_2M_SIZE, mm_config};
use crate::error::MmResult;
use crate::frame_allocator::{
    FrameTable, MemoryDescriptor, PageAttr, ZoneKind, ZonePolicy,
};
use crate::memory_space::{AddressSpace, SegmentLayout, VmFlags};
use crate::mmio_buddy::MmioPool;
use crate::page_table::{EntryFlags, MapRequest};
use crate::slab::KernelHeap;
use crate::tlb;

/// 启动层交给内存管理器的初始化信息
pub struct BootInfo<'a> {
    /// 物理内存描述符列表（按基址升序）
    pub memory_map: &'a [MemoryDescriptor],
    /// 内核映像占用的物理跨度
    pub kernel_image: (Paddr, usize),
    /// 自举堆区（线性映射的虚拟地址与长度）
    pub bootstrap_heap: (Vaddr, usize),
    /// 启动页表根的物理地址
    pub page_table_root: Paddr,
    /// 内核各段的地址标记
    pub layout: SegmentLayout,
}

/// 系统内存信息（单位：字节）
#[derive(Debug, Clone, Copy)]
pub struct MemoryStat {
    /// 可用物理内存总量
    pub total: usize,
    /// 已使用的物理内存
    pub used: usize,
    /// 空闲物理内存
    pub free: usize,
    /// 共享帧占用的内存
    pub shared: usize,
    /// 堆缓存中已使用的字节数
    pub cache_used: usize,
    /// 堆缓存中空闲的字节数
    pub cache_free: usize,
    /// 系统总空闲内存（空闲物理内存 + 可回收的堆缓存）
    pub available: usize,
}

/// 内存管理器
pub struct MemoryManager {
    frames: Arc<FrameTable>,
    heap: KernelHeap,
    mmio: MmioPool,
    kernel_space: SleepLock<AddressSpace>,
}

static MEMORY_MANAGER: OnceBox<MemoryManager> = OnceBox::new();

impl MemoryManager {
    /// 按启动信息完成整个子系统的初始化
    pub fn init(boot: &BootInfo) -> MmResult<Self> {
        info!("Initializing memory management unit...");

        // 1. 堆自举
        let heap = KernelHeap::new();
        // SAFETY: 启动层保证自举堆区可写、线性映射且独占
        unsafe { heap.bootstrap(boot.bootstrap_heap.0, boot.bootstrap_heap.1)? };

        // 2. 帧分配器
        let policy = ZonePolicy::from_config();
        let frames = Arc::new(FrameTable::new(boot.memory_map, &policy)?);

        // 3. 预留第 0 帧、内核映像与自举堆占用的帧
        let reserved_attr = PageAttr::MAPPED | PageAttr::KERNEL | PageAttr::KERNEL_INIT;
        frames.mark_reserved(Paddr::from_usize(0), PAGE_2M_SIZE, reserved_attr);
        frames.mark_reserved(boot.kernel_image.0, boot.kernel_image.1, reserved_attr);
        // SAFETY: 自举堆区位于线性映射内
        let heap_paddr = unsafe { arch_ops().vaddr_to_paddr(boot.bootstrap_heap.0.as_usize()) };
        frames.mark_reserved(
            Paddr::from_usize(heap_paddr),
            boot.bootstrap_heap.1,
            reserved_attr,
        );

        // 4. 堆获得扩容能力
        heap.attach_frames(frames.clone());

        // 5. 重建线性映射
        let cfg = mm_config();
        let mut kernel_space = AddressSpace::from_root(boot.page_table_root);
        let mut affected = 0usize;
        for zone in frames.zones() {
            if zone.kind() == ZoneKind::Unmapped {
                continue;
            }
            let start = zone.frames().start().start_addr();
            let req = MapRequest {
                vaddr: Vaddr::from_usize(cfg.linear_offset() + start.as_usize()),
                paddr: start,
                length: zone.frames().len() * PAGE_2M_SIZE,
                flags: EntryFlags::empty(),
                user: false,
                flush: false,
                use_4k: false,
            };
            kernel_space.table_mut().map(&heap, &req)?;
            affected += zone.frames().len();
        }
        tlb::flush_all();
        info!("page table re-initialized, affects {affected} frames");

        *kernel_space.layout_mut() = boot.layout;

        // 6. MMIO 伙伴池
        let mmio = MmioPool::new(
            Vaddr::from_usize(cfg.mmio_base()),
            cfg.mmio_top() - cfg.mmio_base(),
        )?;

        info!("Memory management unit initialize complete");
        Ok(MemoryManager {
            frames,
            heap,
            mmio,
            kernel_space: SleepLock::new(kernel_space),
        })
    }

    /// 安装为内核全局实例（只生效一次）
    pub fn install_global(self) -> &'static MemoryManager {
        if MEMORY_MANAGER.set(Box::new(self)).is_err() {
            warn!("install_global: memory manager already installed");
        }
        MEMORY_MANAGER.get().expect("memory manager installed above")
    }

    /// 取内核全局实例（未安装时为 None）
    pub fn global() -> Option<&'static MemoryManager> {
        MEMORY_MANAGER.get()
    }

    /// 帧分配器
    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    /// 内核堆
    pub fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    /// MMIO 伙伴池
    pub fn mmio(&self) -> &MmioPool {
        &self.mmio
    }

    /// 内核地址空间
    pub fn kernel_space(&self) -> &SleepLock<AddressSpace> {
        &self.kernel_space
    }

    // ==== 进程管理接口 ====

    /// 为新进程创建地址空间（内核高半区共享）
    pub fn create_address_space(&self) -> MmResult<AddressSpace> {
        let kernel = self.kernel_space.lock();
        AddressSpace::new_user(&self.heap, &kernel)
    }

    /// 销毁进程地址空间：解除全部区域映射并释放用户半区页表
    pub fn destroy_address_space(&self, space: AddressSpace) -> MmResult<()> {
        space.destroy(&self.frames, &self.heap)
    }

    /// 扩展进程堆（2MB 步长），返回新的堆结束地址
    pub fn grow_heap(&self, space: &mut AddressSpace, delta: usize) -> MmResult<Vaddr> {
        space.grow_heap(&self.frames, &self.heap, delta)
    }

    /// 收缩进程堆，返回新的堆结束地址
    pub fn shrink_heap(&self, space: &mut AddressSpace, delta: usize) -> MmResult<Vaddr> {
        space.shrink_heap(&self.frames, &self.heap, delta)
    }

    // ==== 通用堆接口 ====

    /// 通用内存分配（`zero` 为真时清零）
    pub fn allocate(&self, size: usize, zero: bool) -> MmResult<NonNull<u8>> {
        self.heap.allocate(size, zero)
    }

    /// 通用内存释放
    pub fn free(&self, ptr: NonNull<u8>) -> MmResult<()> {
        self.heap.free(ptr)
    }

    // ==== 设备驱动接口 ====

    /// 申请一段 MMIO 虚拟地址区间并在内核地址空间中建立区域。
    ///
    /// 区域带上 `IO | DONTCOPY` 标志；映射由驱动随后通过
    /// [`AddressSpace::map_region`] 按设备物理地址建立。
    pub fn mmio_create(&self, size: usize, flags: VmFlags) -> MmResult<(Vaddr, usize)> {
        let (vaddr, actual) = self.mmio.reserve(size)?;
        let mut kernel = self.kernel_space.lock();
        match kernel.create_region(
            vaddr,
            actual,
            flags | VmFlags::IO | VmFlags::DONTCOPY,
            None,
        ) {
            Ok(_) => Ok((vaddr, actual)),
            Err(err) => {
                let _ = self.mmio.release(vaddr, actual.trailing_zeros());
                Err(err)
            }
        }
    }

    /// 释放一段 MMIO 区间：解除映射、销毁区域并把块还给伙伴池
    pub fn mmio_release(&self, vaddr: Vaddr, size: usize) -> MmResult<()> {
        let exp = self.mmio.size_to_exp(size)?;
        {
            let mut kernel = self.kernel_space.lock();
            kernel.unmap(&self.frames, &self.heap, vaddr, 1usize << exp, true)?;
        }
        self.mmio.release(vaddr, exp)
    }

    // ==== 诊断接口 ====

    /// 系统内存信息快照（无长持锁，数值为近似值）
    pub fn memory_stat(&self) -> MemoryStat {
        let total = self.frames.total_bytes();
        let used = self.frames.used_frames() * PAGE_2M_SIZE;
        let free = total - used;
        let cache_used = self.heap.cache_used_bytes();
        let cache_free = self.heap.cache_free_bytes();
        MemoryStat {
            total,
            used,
            free,
            shared: self.frames.shared_frames() * PAGE_2M_SIZE,
            cache_used,
            cache_free,
            available: free + cache_free,
        }
    }
}

/// 面向 `#[global_allocator]` 的适配器
///
/// 内核二进制声明 `#[global_allocator] static A: KernelAllocator;`
/// 后，`alloc` 容器的分配全部走全局内存管理器的堆。全局实例安装
/// 之前的分配请求一律失败（返回空指针）。
pub struct KernelAllocator;

// SAFETY: 委托给 KernelHeap，后者对槽位的互斥访问由池锁保证；
// 对齐要求通过把请求大小抬升到对齐值满足（槽位对齐等于尺寸类）。
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match MemoryManager::global() {
            Some(mm) => {
                let size = layout.size().max(layout.align());
                mm.heap
                    .allocate(size, false)
                    .map(|p| p.as_ptr())
                    .unwrap_or(null_mut())
            }
            None => null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        match MemoryManager::global() {
            Some(mm) => {
                let size = layout.size().max(layout.align());
                mm.heap
                    .allocate(size, true)
                    .map(|p| p.as_ptr())
                    .unwrap_or(null_mut())
            }
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let (Some(mm), Some(ptr)) = (MemoryManager::global(), NonNull::new(ptr)) {
            if mm.heap.free(ptr).is_err() {
                warn!("dealloc: pointer {ptr:?} not owned by the kernel heap");
            }
        }
    }
}
