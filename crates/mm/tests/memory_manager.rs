//! Integration tests for the assembled memory manager.
//!
//! 用一段按 2MB 对齐的宿主机内存充当物理内存（恒等映射），
//! 走完整个启动序列：堆自举 → 帧分配器 → 线性映射重建 → MMIO 池，
//! 然后驱动进程堆、MMIO 与诊断接口。

use std::alloc::Layout;
use std::sync::Once;

use mm::{
    ArchMmOps, BootInfo, MemoryDescriptor, MemoryKind, MemoryManager, MmConfig, PAGE_2M_MASK,
    PAGE_2M_SIZE, PAGE_4K_SIZE, Paddr, SegmentLayout, UsizeConvert, Vaddr, VmFlags,
};

const MMIO_BASE: usize = 0xffff_a100_0000_0000;
const MMIO_SIZE: usize = 0x4000_0000;

struct ItMmOps;

impl ArchMmOps for ItMmOps {
    fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        paddr
    }

    unsafe fn vaddr_to_paddr(&self, vaddr: usize) -> usize {
        vaddr
    }

    fn tlb_flush_local(&self) {}

    fn send_tlb_flush_ipi_all(&self) {}

    fn num_cpus(&self) -> usize {
        1
    }
}

struct ItMmConfig;

impl MmConfig for ItMmConfig {
    fn linear_offset(&self) -> usize {
        0
    }

    fn linear_map_limit(&self) -> usize {
        usize::MAX
    }

    fn dma_limit(&self) -> usize {
        16 << 20
    }

    fn mmio_base(&self) -> usize {
        MMIO_BASE
    }

    fn mmio_top(&self) -> usize {
        MMIO_BASE + MMIO_SIZE
    }

    fn user_max_vaddr(&self) -> usize {
        0x0000_7fff_ffff_f000
    }
}

struct ItSyncOps;

impl sync::ArchOps for ItSyncOps {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        0x200
    }

    unsafe fn restore_interrupts(&self, _flags: usize) {}

    fn interrupt_flag_mask(&self) -> usize {
        0x200
    }

    fn cpu_id(&self) -> usize {
        0
    }

    fn max_cpu_count(&self) -> usize {
        1
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

static IT_MM_OPS: ItMmOps = ItMmOps;
static IT_MM_CONFIG: ItMmConfig = ItMmConfig;
static IT_SYNC_OPS: ItSyncOps = ItSyncOps;
static INIT: Once = Once::new();

fn register_mocks() {
    INIT.call_once(|| unsafe {
        sync::register_arch_ops(&IT_SYNC_OPS);
        mm::register_arch_ops(&IT_MM_OPS);
        mm::register_config(&IT_MM_CONFIG);
    });
}

/// 一段按 2MB 对齐的宿主机内存，恒等映射下充当物理内存
struct Arena {
    _buf: Vec<u8>,
    base: usize,
    frames: usize,
}

impl Arena {
    fn new(frames: usize) -> Self {
        let len = frames * PAGE_2M_SIZE;
        let buf = vec![0u8; len + PAGE_2M_SIZE];
        let base = (buf.as_ptr() as usize + PAGE_2M_SIZE - 1) & PAGE_2M_MASK;
        Arena {
            _buf: buf,
            base,
            frames,
        }
    }

    fn len(&self) -> usize {
        self.frames * PAGE_2M_SIZE
    }

    fn frame_paddr(&self, index: usize) -> Paddr {
        Paddr::from_usize(self.base + index * PAGE_2M_SIZE)
    }
}

/// 走完整个启动序列。16 帧给堆自举，1 帧假扮内核映像。
fn boot_manager(arena: &Arena) -> MemoryManager {
    register_mocks();
    assert!(arena.frames > 17);

    let map = [MemoryDescriptor {
        base: Paddr::from_usize(arena.base),
        length: arena.len(),
        kind: MemoryKind::Usable,
    }];

    // 启动页表根：一个 4KB 对齐的常驻节点
    let root = unsafe {
        std::alloc::alloc_zeroed(Layout::from_size_align(PAGE_4K_SIZE, PAGE_4K_SIZE).unwrap())
    };
    assert!(!root.is_null());

    let mut layout = SegmentLayout::default();
    layout.brk_start = Vaddr::from_usize(0x5000_0000);
    layout.brk_end = Vaddr::from_usize(0x5000_0000);

    let boot = BootInfo {
        memory_map: &map,
        kernel_image: (arena.frame_paddr(16), PAGE_2M_SIZE),
        bootstrap_heap: (Vaddr::from_usize(arena.base), 16 * PAGE_2M_SIZE),
        page_table_root: Paddr::from_usize(root as usize),
        layout,
    };

    MemoryManager::init(&boot).unwrap()
}

#[test]
fn test_boot_sequence_and_stat() {
    let arena = Arena::new(24);
    let mm = boot_manager(&arena);

    // 自举堆 16 帧 + 内核映像 1 帧
    let stat = mm.memory_stat();
    assert_eq!(stat.total, 24 * PAGE_2M_SIZE);
    assert_eq!(stat.used, 17 * PAGE_2M_SIZE);
    assert_eq!(stat.free, stat.total - stat.used);
    assert_eq!(stat.available, stat.free + stat.cache_free);
    assert!(stat.cache_free > 0);

    // 线性映射重建：每个帧都能按恒等关系翻译
    let kernel = mm.kernel_space().lock();
    assert_eq!(
        kernel.table().translate(Vaddr::from_usize(arena.base)),
        Some(Paddr::from_usize(arena.base))
    );
    let last = arena.base + arena.len() - 1;
    assert_eq!(
        kernel.table().translate(Vaddr::from_usize(last)),
        Some(Paddr::from_usize(last))
    );
}

#[test]
fn test_process_heap_round_trip() {
    let arena = Arena::new(24);
    let mm = boot_manager(&arena);
    let used_at_boot = mm.frames().used_frames();

    let mut space = mm.create_address_space().unwrap();
    let brk = Vaddr::from_usize(0x5000_0000);

    let new_end = mm.grow_heap(&mut space, PAGE_2M_SIZE).unwrap();
    assert_eq!(new_end, brk + PAGE_2M_SIZE);
    assert_eq!(mm.frames().used_frames(), used_at_boot + 1);

    // 堆页必须翻译到一个受管的物理帧
    let paddr = space.table().translate(brk).unwrap();
    assert!(mm.frames().frame_by_paddr(paddr).is_ok());
    assert_eq!(
        space.table().translate(brk + PAGE_2M_SIZE - 1),
        Some(paddr + (PAGE_2M_SIZE - 1))
    );
    // 内核地址空间不受进程映射影响
    assert_eq!(mm.kernel_space().lock().table().translate(brk), None);

    let back = mm.shrink_heap(&mut space, PAGE_2M_SIZE).unwrap();
    assert_eq!(back, brk);
    assert_eq!(space.table().translate(brk), None);
    assert_eq!(mm.frames().used_frames(), used_at_boot);

    mm.destroy_address_space(space).unwrap();
}

#[test]
fn test_mmio_create_map_release() {
    let arena = Arena::new(24);
    let mm = boot_manager(&arena);
    let free_before = mm.mmio().free_bytes();

    let (vaddr, size) = mm.mmio_create(0x3000, VmFlags::READ | VmFlags::WRITE).unwrap();
    assert_eq!(size, 0x4000);
    assert_eq!(vaddr.as_usize() % size, 0);
    assert!(vaddr.as_usize() >= MMIO_BASE && vaddr.as_usize() < MMIO_BASE + MMIO_SIZE);

    // 区域先于任何映射存在，并带 IO | DONTCOPY 标志
    let id = {
        let kernel = mm.kernel_space().lock();
        let region = kernel.find_region(vaddr).unwrap();
        assert!(region.flags().contains(VmFlags::IO | VmFlags::DONTCOPY));
        assert!(region.anon().is_none());
        region.id()
    };

    // 驱动把设备寄存器绑定到区域（设备物理地址不属于帧分配器）
    let device_paddr = Paddr::from_usize(0xfee0_0000);
    {
        let mut kernel = mm.kernel_space().lock();
        kernel
            .map_region(mm.frames(), mm.heap(), id, device_paddr, 0, size)
            .unwrap();
        assert_eq!(kernel.table().translate(vaddr), Some(device_paddr));
        assert_eq!(
            kernel.table().translate(vaddr + 0x2fff),
            Some(device_paddr + 0x2fff)
        );
    }

    mm.mmio_release(vaddr, size).unwrap();
    {
        let kernel = mm.kernel_space().lock();
        assert!(kernel.find_region(vaddr).is_none());
        assert_eq!(kernel.table().translate(vaddr), None);
    }
    // 归还后伙伴池不缩水，同样大小的申请再次成功
    assert_eq!(mm.mmio().free_bytes(), free_before);
    let (again, size2) = mm.mmio_create(0x3000, VmFlags::READ).unwrap();
    assert_eq!(size2, 0x4000);
    mm.mmio_release(again, size2).unwrap();
}

#[test]
fn test_general_purpose_heap_interface() {
    let arena = Arena::new(24);
    let mm = boot_manager(&arena);

    let cache_used_before = mm.memory_stat().cache_used;
    let p = mm.allocate(300, true).unwrap();
    // 清零分配返回的内存必须可读写
    let slice = unsafe { core::slice::from_raw_parts_mut(p.as_ptr(), 300) };
    assert!(slice.iter().all(|&b| b == 0));
    slice[299] = 0x42;

    let stat = mm.memory_stat();
    assert_eq!(stat.cache_used, cache_used_before + 512);

    mm.free(p).unwrap();
    assert_eq!(mm.memory_stat().cache_used, cache_used_before);
}
