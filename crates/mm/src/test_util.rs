//! 单元测试辅助：Mock 桥接、宿主机页表节点分配器和测试内存池。
//!
//! test-support 不直接依赖 mm / sync（避免循环依赖），trait 的桥接
//! 实现放在这里的 `cfg(test)` 代码中完成。宿主机测试采用恒等映射，
//! 以便把宿主机堆上按 2MB 对齐的内存当作"物理内存"管理。

use core::cell::{Cell, RefCell};
use std::alloc::Layout;
use std::sync::Once;
use std::vec::Vec;

use test_support::mock::mm::{MockMmConfig, MockMmOps};

use crate::address::{Paddr, UsizeConvert, Vaddr};
use crate::arch_ops::ArchMmOps;
use crate::config::{MmConfig, PAGE_2M_MASK, PAGE_2M_SIZE, PAGE_4K_SIZE};
use crate::error::{MmError, MmResult};
use crate::frame_allocator::{MemoryDescriptor, MemoryKind};
use crate::page_table::TableAlloc;

impl ArchMmOps for MockMmOps {
    fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        MockMmOps::paddr_to_vaddr(self, paddr)
    }

    unsafe fn vaddr_to_paddr(&self, vaddr: usize) -> usize {
        unsafe { MockMmOps::vaddr_to_paddr(self, vaddr) }
    }

    fn tlb_flush_local(&self) {
        MockMmOps::tlb_flush_local(self)
    }

    fn send_tlb_flush_ipi_all(&self) {
        MockMmOps::send_tlb_flush_ipi_all(self)
    }

    fn num_cpus(&self) -> usize {
        MockMmOps::num_cpus(self)
    }
}

impl MmConfig for MockMmConfig {
    fn linear_offset(&self) -> usize {
        MockMmConfig::linear_offset(self)
    }

    fn linear_map_limit(&self) -> usize {
        MockMmConfig::linear_map_limit(self)
    }

    fn dma_limit(&self) -> usize {
        MockMmConfig::dma_limit(self)
    }

    fn mmio_base(&self) -> usize {
        MockMmConfig::mmio_base(self)
    }

    fn mmio_top(&self) -> usize {
        MockMmConfig::mmio_top(self)
    }

    fn user_max_vaddr(&self) -> usize {
        MockMmConfig::user_max_vaddr(self)
    }
}

/// sync crate 的 ArchOps 桥接（orphan 规则不允许直接为 Mock 实现）
struct SyncOpsBridge;

impl sync::ArchOps for SyncOpsBridge {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        unsafe {
            test_support::mock::arch::MOCK_ARCH_OPS.read_and_disable_interrupts()
        }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        unsafe { test_support::mock::arch::MOCK_ARCH_OPS.restore_interrupts(flags) }
    }

    fn interrupt_flag_mask(&self) -> usize {
        test_support::mock::arch::MOCK_ARCH_OPS.interrupt_flag_mask()
    }

    fn cpu_id(&self) -> usize {
        test_support::mock::arch::MOCK_ARCH_OPS.cpu_id()
    }

    fn max_cpu_count(&self) -> usize {
        test_support::mock::arch::MOCK_ARCH_OPS.max_cpu_count()
    }

    fn yield_now(&self) {
        test_support::mock::arch::MOCK_ARCH_OPS.yield_now()
    }
}

static SYNC_OPS_BRIDGE: SyncOpsBridge = SyncOpsBridge;
static INIT: Once = Once::new();

/// 注册全部 Mock（整个测试进程只注册一次）
pub(crate) fn register_mocks() {
    INIT.call_once(|| unsafe {
        sync::register_arch_ops(&SYNC_OPS_BRIDGE);
        crate::arch_ops::register_arch_ops(&test_support::mock::mm::MOCK_MM_OPS);
        crate::config::register_config(&test_support::mock::mm::MOCK_MM_CONFIG);
    });
}

/// 宿主机页表节点分配器。
///
/// 每个节点是一个 4KB 对齐的堆分配；记账用于验证
/// "unmap 释放了所有清空的中间页表"之类的性质。
pub(crate) struct HostTableAlloc {
    pub(crate) live: RefCell<Vec<usize>>,
    pub(crate) total: Cell<usize>,
    pub(crate) fail_after: Cell<Option<usize>>,
    pub(crate) released: RefCell<Vec<usize>>,
}

impl HostTableAlloc {
    pub(crate) fn new() -> Self {
        HostTableAlloc {
            live: RefCell::new(Vec::new()),
            total: Cell::new(0),
            fail_after: Cell::new(None),
            released: RefCell::new(Vec::new()),
        }
    }

    fn layout() -> Layout {
        Layout::from_size_align(PAGE_4K_SIZE, PAGE_4K_SIZE).unwrap()
    }

    /// 当前存活的页表节点数
    pub(crate) fn live_tables(&self) -> usize {
        self.live.borrow().len()
    }

    /// 让后续所有节点分配失败
    pub(crate) fn fail_all(&self) {
        self.fail_after.set(Some(0));
    }

    /// 恢复节点分配
    pub(crate) fn unfail(&self) {
        self.fail_after.set(None);
    }
}

impl TableAlloc for HostTableAlloc {
    fn alloc_table(&self) -> MmResult<Paddr> {
        if let Some(n) = self.fail_after.get() {
            if self.total.get() >= n {
                return Err(MmError::OutOfMemory);
            }
        }
        let ptr = unsafe { std::alloc::alloc_zeroed(Self::layout()) };
        assert!(!ptr.is_null());
        self.total.set(self.total.get() + 1);
        self.live.borrow_mut().push(ptr as usize);
        Ok(Paddr::from_usize(ptr as usize))
    }

    fn free_table(&self, table: Paddr) {
        let mut live = self.live.borrow_mut();
        let pos = live
            .iter()
            .position(|&a| a == table.as_usize())
            .expect("freeing a table that was never allocated");
        live.swap_remove(pos);
        unsafe { std::alloc::dealloc(table.as_usize() as *mut u8, Self::layout()) };
    }

    fn release_frame(&self, frame: Paddr) {
        self.released.borrow_mut().push(frame.as_usize());
    }
}

/// 宿主机测试内存池：一段按 2MB 对齐的堆内存，恒等映射下
/// 既是"物理内存"又可直接读写。
pub(crate) struct TestArena {
    _buf: Vec<u8>,
    base: usize,
    frames: usize,
}

impl TestArena {
    pub(crate) fn new(frames: usize) -> Self {
        let len = frames * PAGE_2M_SIZE;
        let buf = std::vec![0u8; len + PAGE_2M_SIZE];
        let base = (buf.as_ptr() as usize + PAGE_2M_SIZE - 1) & PAGE_2M_MASK;
        TestArena {
            _buf: buf,
            base,
            frames,
        }
    }

    /// 对齐后的起始地址（物理 == 虚拟）
    pub(crate) fn base(&self) -> usize {
        self.base
    }

    /// 池内的字节数
    pub(crate) fn len(&self) -> usize {
        self.frames * PAGE_2M_SIZE
    }

    /// 把整个池描述为一段可用物理内存
    pub(crate) fn descriptor(&self) -> MemoryDescriptor {
        MemoryDescriptor {
            base: Paddr::from_usize(self.base),
            length: self.len(),
            kind: MemoryKind::Usable,
        }
    }

    /// 池内指定帧的起始虚拟地址
    #[allow(dead_code)]
    pub(crate) fn frame_vaddr(&self, index: usize) -> Vaddr {
        Vaddr::from_usize(self.base + index * PAGE_2M_SIZE)
    }
}
