//! 页表遍历与映射
//!
//! [`PageTable`] 封装一个页表根（物理地址），在其上实现：
//!
//! - [`PageTable::map`]：装配一段连续映射。逐级下降计算表项下标，
//!   缺失的中间页表从内核堆分配并以最小权限位安装；叶级写入 2MB
//!   大页项，或在 `use_4k` 时继续下降一级写入 4KB 页项。
//! - [`PageTable::unmap`]：拆除映射并释放扫描判空后的中间页表。
//! - [`PageTable::translate`]：只读地址翻译（两种页大小均可）。
//!
//! 多步装配中途失败时，本次调用已装配的跨度会先回滚再返回错误；
//! 中间页表分配失败同样作为 [`MmError::OutOfMemory`] 向上传播。
//!
//! 页表内存通过注册的线性映射访问；对**同一地址空间**的并发结构性
//! 修改由调用者（进程层的锁）串行化，本模块不在内部加锁。

use log::{error, warn};

use super::entry::{EntryFlags, PageEntry};
use crate::address::{Paddr, UsizeConvert, Vaddr};
use crate::arch_ops;
use crate::config::{
    ENTRIES_PER_TABLE, PAGE_1G_SHIFT, PAGE_2M_SHIFT, PAGE_2M_SIZE, PAGE_4K_SHIFT, PAGE_4K_SIZE,
    PAGE_L4_SHIFT,
};
use crate::error::{MmError, MmResult};
use crate::tlb;

/// 内核空间在顶级页表中的起始下标（高半区）
pub(crate) const KERNEL_HALF_START: usize = ENTRIES_PER_TABLE / 2;

/// 页表节点分配接口
///
/// 中间页表是 4KB 节点，由内核堆提供；测试可以用宿主机实现替换。
pub trait TableAlloc {
    /// 分配一个清零的 4KB 页表节点，返回其物理地址
    fn alloc_table(&self) -> MmResult<Paddr>;

    /// 释放一个页表节点
    fn free_table(&self, table: Paddr);

    /// 归还一个被替换掉的 2MB 物理帧（用户态大页冲突的解决路径）
    fn release_frame(&self, frame: Paddr);
}

/// 一次映射请求
#[derive(Debug, Clone)]
pub struct MapRequest {
    /// 起始虚拟地址（按页大小对齐）
    pub vaddr: Vaddr,
    /// 起始物理地址（按页大小对齐）
    pub paddr: Paddr,
    /// 映射长度（字节，向上取整到页大小）
    pub length: usize,
    /// 附加表项标志（权限、缓存属性等；PRESENT / HUGE 由映射器补充）
    pub flags: EntryFlags,
    /// 是否用户态可访问（若 `flags` 已带 USER 位则自动校正为 true）
    pub user: bool,
    /// 完成后是否刷新 TLB
    pub flush: bool,
    /// 是否使用 4KB 小页（否则使用 2MB 大页）
    pub use_4k: bool,
}

/// 页表
///
/// 只持有根节点的物理地址；可以包装当前活动的页表，也可以包装
/// 另一个地址空间的页表（进程创建时需要）。
#[derive(Debug)]
pub struct PageTable {
    root: Paddr,
}

impl PageTable {
    /// 新建页表：分配一个清零的根节点
    pub fn new(alloc: &dyn TableAlloc) -> MmResult<Self> {
        Ok(PageTable {
            root: alloc.alloc_table()?,
        })
    }

    /// 包装一个已存在的页表根（例如启动层建立的页表）
    pub fn from_root(root: Paddr) -> Self {
        PageTable { root }
    }

    /// 根节点的物理地址
    pub fn root(&self) -> Paddr {
        self.root
    }

    /// 装配一段连续映射。
    ///
    /// 冲突规则：
    /// - 4KB 请求撞上已存在的 2MB 大页叶 → [`MmError::AlreadyMapped`]；
    /// - 已存在的 4KB 页表项 → 告警后跳过（保留原映射）；
    /// - 2MB 请求撞上已存在的表项：内核态报 [`MmError::AlreadyMapped`]；
    ///   用户态且对方也是大页叶时，释放旧帧并替换（写时复制的解决路径）。
    pub fn map(&mut self, alloc: &dyn TableAlloc, req: &MapRequest) -> MmResult<()> {
        let step = if req.use_4k { PAGE_4K_SIZE } else { PAGE_2M_SIZE };
        if req.length == 0
            || req.vaddr.as_usize() & (step - 1) != 0
            || req.paddr.as_usize() & (step - 1) != 0
        {
            return Err(MmError::InvalidArgument);
        }
        let length = req.length.next_multiple_of(step);

        // 对 user 标志进行校正
        let user = req.user || req.flags.contains(EntryFlags::USER);

        let mut mapped = 0usize;
        if let Err(err) = self.map_span(alloc, req, user, length, &mut mapped) {
            // 回滚本次调用已装配的跨度
            if mapped > 0 {
                let _ = self.unmap(alloc, req.vaddr, mapped, false);
            }
            error!(
                "map failed: vaddr={:?} paddr={:?} use_4k={} err={:?}",
                req.vaddr, req.paddr, req.use_4k, err
            );
            return Err(err);
        }

        if req.flush {
            tlb::flush_all();
        }
        Ok(())
    }

    fn map_span(
        &mut self,
        alloc: &dyn TableAlloc,
        req: &MapRequest,
        user: bool,
        length: usize,
        mapped: &mut usize,
    ) -> MmResult<()> {
        let table_flags = if user {
            EntryFlags::user_table()
        } else {
            EntryFlags::kernel_table()
        };

        while *mapped < length {
            let va = req.vaddr.as_usize() + *mapped;
            let pa = req.paddr.as_usize() + *mapped;

            // 顶级 → 三级
            let l3_pa = {
                // SAFETY: root 是有效页表节点，经线性映射访问
                let l4 = unsafe { table_mut(self.root) };
                let l4e = &mut l4[l4_index(va)];
                if l4e.is_unused() {
                    l4e.set(alloc.alloc_table()?, table_flags);
                }
                l4e.addr()
            };

            // 三级 → 二级
            let l2_pa = {
                // SAFETY: 表项中的地址指向有效页表节点
                let l3 = unsafe { table_mut(l3_pa) };
                let l3e = &mut l3[l3_index(va)];
                if l3e.is_unused() {
                    l3e.set(alloc.alloc_table()?, table_flags);
                }
                l3e.addr()
            };

            // SAFETY: 同上
            let l2 = unsafe { table_mut(l2_pa) };
            let l2e = &mut l2[l2_index(va)];

            if req.use_4k {
                if l2e.is_unused() {
                    l2e.set(alloc.alloc_table()?, table_flags);
                } else if l2e.flags().contains(EntryFlags::HUGE) {
                    // 当前表项已映射 2MB 大页，与 4K 请求冲突
                    return Err(MmError::AlreadyMapped);
                }
                // SAFETY: 表项中的地址指向有效的 4 级页表节点
                let l1 = unsafe { table_mut(l2e.addr()) };
                let l1e = &mut l1[l1_index(va)];
                if !l1e.is_unused() {
                    warn!("map: pte already exists at {va:#x}");
                } else {
                    let leaf = req.flags
                        | if user {
                            EntryFlags::user_page_4k()
                        } else {
                            EntryFlags::kernel_page_4k()
                        };
                    l1e.set(Paddr::from_usize(pa), leaf);
                }
                *mapped += PAGE_4K_SIZE;
            } else {
                if !l2e.is_unused() {
                    if user && l2e.flags().contains(EntryFlags::HUGE) {
                        // 用户态重映射撞上现有大页：释放旧帧并替换
                        alloc.release_frame(l2e.addr());
                    } else {
                        return Err(MmError::AlreadyMapped);
                    }
                }
                let leaf = req.flags
                    | if user {
                        EntryFlags::user_page_2m()
                    } else {
                        EntryFlags::kernel_page_2m()
                    };
                l2e.set(Paddr::from_usize(pa), leaf);
                *mapped += PAGE_2M_SIZE;
            }
        }
        Ok(())
    }

    /// 拆除一段映射。
    ///
    /// 逐级清除叶项（两种页大小均可），随后扫描中间页表：512 项全空的
    /// 页表被释放，其上级表项一并清除。未映射的跨度被静默跳过。
    pub fn unmap(
        &mut self,
        alloc: &dyn TableAlloc,
        vaddr: Vaddr,
        length: usize,
        flush: bool,
    ) -> MmResult<()> {
        if length == 0 || !vaddr.is_4k_aligned() {
            return Err(MmError::InvalidArgument);
        }
        let length = length.next_multiple_of(PAGE_4K_SIZE);
        let end = vaddr.as_usize() + length;
        let mut va = vaddr.as_usize();

        while va < end {
            let cur = va;

            let l4i = l4_index(cur);
            let l3_pa = {
                // SAFETY: root 是有效页表节点
                let l4 = unsafe { table_ref(self.root) };
                let e = l4[l4i];
                if e.is_unused() {
                    va = next_boundary(cur, PAGE_L4_SHIFT, end);
                    continue;
                }
                e.addr()
            };

            let l3i = l3_index(cur);
            let l2_pa = {
                // SAFETY: 表项中的地址指向有效页表节点
                let l3 = unsafe { table_ref(l3_pa) };
                let e = l3[l3i];
                if e.is_unused() {
                    va = next_boundary(cur, PAGE_1G_SHIFT, end);
                    continue;
                }
                e.addr()
            };

            let l2i = l2_index(cur);
            {
                // SAFETY: 同上
                let l2 = unsafe { table_mut(l2_pa) };
                let l2e = &mut l2[l2i];
                if l2e.is_unused() {
                    va = next_boundary(cur, PAGE_2M_SHIFT, end);
                } else if l2e.flags().contains(EntryFlags::HUGE) {
                    l2e.clear();
                    va = next_boundary(cur, PAGE_2M_SHIFT, end);
                } else {
                    // 存在 4 级页表
                    let l1_pa = l2e.addr();
                    // SAFETY: 表项中的地址指向有效页表节点
                    let l1 = unsafe { table_mut(l1_pa) };
                    let mut idx = l1_index(cur);
                    while idx < ENTRIES_PER_TABLE && va < end {
                        l1[idx].clear();
                        idx += 1;
                        va += PAGE_4K_SIZE;
                    }
                    // 4 级页表已经空了，释放页表
                    if table_is_empty(l1) {
                        l2e.clear();
                        alloc.free_table(l1_pa);
                    }
                }
            }

            // 3 级页表已经空了，释放页表
            // SAFETY: l2_pa 仍指向有效页表节点
            if table_is_empty(unsafe { table_ref(l2_pa) }) {
                {
                    let l3 = unsafe { table_mut(l3_pa) };
                    l3[l3i].clear();
                }
                alloc.free_table(l2_pa);

                // 2 级页表已经空了，释放页表
                // SAFETY: l3_pa 仍指向有效页表节点
                if table_is_empty(unsafe { table_ref(l3_pa) }) {
                    {
                        let l4 = unsafe { table_mut(self.root) };
                        l4[l4i].clear();
                    }
                    alloc.free_table(l3_pa);
                }
            }
        }

        if flush {
            tlb::flush_all();
        }
        Ok(())
    }

    /// 翻译虚拟地址到物理地址（只读，不修改页表）
    pub fn translate(&self, vaddr: Vaddr) -> Option<Paddr> {
        let va = vaddr.as_usize();
        // SAFETY: root 与各级表项中的地址都指向有效页表节点
        let l4e = unsafe { table_ref(self.root) }[l4_index(va)];
        if l4e.is_unused() {
            return None;
        }
        let l3e = unsafe { table_ref(l4e.addr()) }[l3_index(va)];
        if l3e.is_unused() {
            return None;
        }
        let l2e = unsafe { table_ref(l3e.addr()) }[l2_index(va)];
        if l2e.is_unused() {
            return None;
        }
        if l2e.flags().contains(EntryFlags::HUGE) {
            return Some(l2e.addr() + (va & (PAGE_2M_SIZE - 1)));
        }
        let l1e = unsafe { table_ref(l2e.addr()) }[l1_index(va)];
        if l1e.is_unused() {
            return None;
        }
        Some(l1e.addr() + (va & (PAGE_4K_SIZE - 1)))
    }

    /// 把内核高半区的顶级表项从另一个页表复制过来。
    ///
    /// 进程创建时使用：新地址空间与内核共享高半区的下级页表。
    pub fn copy_kernel_half(&mut self, from: &PageTable) {
        // SAFETY: 两个根都是有效页表节点，且互不重叠
        let dst = unsafe { table_mut(self.root) };
        let src = unsafe { table_ref(from.root) };
        dst[KERNEL_HALF_START..ENTRIES_PER_TABLE]
            .copy_from_slice(&src[KERNEL_HALF_START..ENTRIES_PER_TABLE]);
    }

    /// 释放用户半区的全部中间页表和根节点。
    ///
    /// 叶帧不在这里释放（它们归区域与反向映射管理）；
    /// 内核高半区的下级页表是共享的，保持不动。
    pub fn destroy_user_half(&mut self, alloc: &dyn TableAlloc) {
        for l4i in 0..KERNEL_HALF_START {
            // SAFETY: root 是有效页表节点
            let l4e = unsafe { table_ref(self.root) }[l4i];
            if l4e.is_unused() {
                continue;
            }
            let l3_pa = l4e.addr();
            for l3i in 0..ENTRIES_PER_TABLE {
                // SAFETY: 表项中的地址指向有效页表节点
                let l3e = unsafe { table_ref(l3_pa) }[l3i];
                if l3e.is_unused() {
                    continue;
                }
                let l2_pa = l3e.addr();
                for l2i in 0..ENTRIES_PER_TABLE {
                    // SAFETY: 同上
                    let l2e = unsafe { table_ref(l2_pa) }[l2i];
                    if !l2e.is_unused() && !l2e.flags().contains(EntryFlags::HUGE) {
                        alloc.free_table(l2e.addr());
                    }
                }
                alloc.free_table(l2_pa);
            }
            alloc.free_table(l3_pa);
        }
        alloc.free_table(self.root);
    }
}

#[inline]
fn l4_index(va: usize) -> usize {
    (va >> PAGE_L4_SHIFT) & (ENTRIES_PER_TABLE - 1)
}

#[inline]
fn l3_index(va: usize) -> usize {
    (va >> PAGE_1G_SHIFT) & (ENTRIES_PER_TABLE - 1)
}

#[inline]
fn l2_index(va: usize) -> usize {
    (va >> PAGE_2M_SHIFT) & (ENTRIES_PER_TABLE - 1)
}

#[inline]
fn l1_index(va: usize) -> usize {
    (va >> PAGE_4K_SHIFT) & (ENTRIES_PER_TABLE - 1)
}

/// 当前地址所在的 `1 << shift` 对齐块的下一个边界（封顶到 `end`）
#[inline]
fn next_boundary(va: usize, shift: usize, end: usize) -> usize {
    let next = (va & !((1usize << shift) - 1)).wrapping_add(1 << shift);
    if next == 0 || next > end { end } else { next }
}

/// 检查页表是否存在不为 0 的页表项
fn table_is_empty(table: &[PageEntry; ENTRIES_PER_TABLE]) -> bool {
    table.iter().all(|e| e.is_unused())
}

/// 通过线性映射把页表节点的物理地址变成可写引用
///
/// # Safety
/// `paddr` 必须指向一个有效的、独占访问的页表节点。
unsafe fn table_mut<'a>(paddr: Paddr) -> &'a mut [PageEntry; ENTRIES_PER_TABLE] {
    let va = arch_ops().paddr_to_vaddr(paddr.as_usize());
    // SAFETY: 由调用者保证节点有效且无别名写入
    unsafe { &mut *(va as *mut [PageEntry; ENTRIES_PER_TABLE]) }
}

/// 通过线性映射把页表节点的物理地址变成只读引用
///
/// # Safety
/// `paddr` 必须指向一个有效的页表节点。
unsafe fn table_ref<'a>(paddr: Paddr) -> &'a [PageEntry; ENTRIES_PER_TABLE] {
    let va = arch_ops().paddr_to_vaddr(paddr.as_usize());
    // SAFETY: 由调用者保证节点有效
    unsafe { &*(va as *const [PageEntry; ENTRIES_PER_TABLE]) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{HostTableAlloc, register_mocks};

    fn kernel_2m_request(vaddr: usize, paddr: usize, length: usize) -> MapRequest {
        MapRequest {
            vaddr: Vaddr::from_usize(vaddr),
            paddr: Paddr::from_usize(paddr),
            length,
            flags: EntryFlags::empty(),
            user: false,
            flush: false,
            use_4k: false,
        }
    }

    fn user_4k_request(vaddr: usize, paddr: usize, length: usize) -> MapRequest {
        MapRequest {
            vaddr: Vaddr::from_usize(vaddr),
            paddr: Paddr::from_usize(paddr),
            length,
            flags: EntryFlags::empty(),
            user: true,
            flush: false,
            use_4k: true,
        }
    }

    #[test]
    fn test_map_translate_unmap_2m() {
        register_mocks();
        let alloc = HostTableAlloc::new();
        let mut pt = PageTable::new(&alloc).unwrap();

        pt.map(&alloc, &kernel_2m_request(0x4000_0000, 0x20_0000, PAGE_2M_SIZE))
            .unwrap();
        assert_eq!(
            pt.translate(Vaddr::from_usize(0x4000_0000)),
            Some(Paddr::from_usize(0x20_0000))
        );
        assert_eq!(
            pt.translate(Vaddr::from_usize(0x4000_0000 + PAGE_2M_SIZE - 1)),
            Some(Paddr::from_usize(0x20_0000 + PAGE_2M_SIZE - 1))
        );

        pt.unmap(&alloc, Vaddr::from_usize(0x4000_0000), PAGE_2M_SIZE, false)
            .unwrap();
        assert_eq!(pt.translate(Vaddr::from_usize(0x4000_0000)), None);
        // 只剩根节点：所有清空的中间页表都被释放
        assert_eq!(alloc.live_tables(), 1);
    }

    #[test]
    fn test_map_translate_unmap_4k() {
        register_mocks();
        let alloc = HostTableAlloc::new();
        let mut pt = PageTable::new(&alloc).unwrap();

        pt.map(&alloc, &user_4k_request(0x1000, 0x80_0000, 4 * PAGE_4K_SIZE))
            .unwrap();
        assert_eq!(
            pt.translate(Vaddr::from_usize(0x2000)),
            Some(Paddr::from_usize(0x80_1000))
        );
        // 用户位必须一路传播到中间表项
        let l4e = unsafe { table_ref(pt.root()) }[l4_index(0x1000)];
        assert!(l4e.flags().contains(EntryFlags::USER));

        pt.unmap(&alloc, Vaddr::from_usize(0x1000), 4 * PAGE_4K_SIZE, false)
            .unwrap();
        assert_eq!(pt.translate(Vaddr::from_usize(0x2000)), None);
        assert_eq!(alloc.live_tables(), 1);
    }

    #[test]
    fn test_partial_unmap_keeps_shared_tables() {
        register_mocks();
        let alloc = HostTableAlloc::new();
        let mut pt = PageTable::new(&alloc).unwrap();

        // 同一张 2 级页表下：一个 4K 跨度和一个 2M 大页
        pt.map(&alloc, &user_4k_request(0x0, 0x40_0000, 2 * PAGE_4K_SIZE))
            .unwrap();
        pt.map(&alloc, &kernel_2m_request(PAGE_2M_SIZE, 0x20_0000, PAGE_2M_SIZE))
            .unwrap();

        pt.unmap(&alloc, Vaddr::from_usize(0x0), 2 * PAGE_4K_SIZE, false)
            .unwrap();
        // 4K 页表被释放，但 2 级页表因大页叶仍在使用而保留
        assert_eq!(pt.translate(Vaddr::from_usize(0x0)), None);
        assert_eq!(
            pt.translate(Vaddr::from_usize(PAGE_2M_SIZE)),
            Some(Paddr::from_usize(0x20_0000))
        );

        pt.unmap(&alloc, Vaddr::from_usize(PAGE_2M_SIZE), PAGE_2M_SIZE, false)
            .unwrap();
        assert_eq!(alloc.live_tables(), 1);
    }

    #[test]
    fn test_kernel_2m_conflict_fails() {
        register_mocks();
        let alloc = HostTableAlloc::new();
        let mut pt = PageTable::new(&alloc).unwrap();

        pt.map(&alloc, &kernel_2m_request(0x4000_0000, 0x20_0000, PAGE_2M_SIZE))
            .unwrap();
        assert_eq!(
            pt.map(&alloc, &kernel_2m_request(0x4000_0000, 0x40_0000, PAGE_2M_SIZE)),
            Err(MmError::AlreadyMapped)
        );
        // 原映射保持不变
        assert_eq!(
            pt.translate(Vaddr::from_usize(0x4000_0000)),
            Some(Paddr::from_usize(0x20_0000))
        );
    }

    #[test]
    fn test_4k_request_conflicts_with_huge_leaf() {
        register_mocks();
        let alloc = HostTableAlloc::new();
        let mut pt = PageTable::new(&alloc).unwrap();

        pt.map(&alloc, &kernel_2m_request(0x4000_0000, 0x20_0000, PAGE_2M_SIZE))
            .unwrap();
        let mut req = user_4k_request(0x4000_0000, 0x80_0000, PAGE_4K_SIZE);
        req.user = false;
        assert_eq!(pt.map(&alloc, &req), Err(MmError::AlreadyMapped));
    }

    #[test]
    fn test_user_2m_collision_replaces_existing_frame() {
        register_mocks();
        let alloc = HostTableAlloc::new();
        let mut pt = PageTable::new(&alloc).unwrap();

        let mut first = kernel_2m_request(0x2000_0000, 0x20_0000, PAGE_2M_SIZE);
        first.user = true;
        pt.map(&alloc, &first).unwrap();

        let mut second = kernel_2m_request(0x2000_0000, 0x60_0000, PAGE_2M_SIZE);
        second.user = true;
        pt.map(&alloc, &second).unwrap();

        // 旧帧被归还，新映射生效
        assert_eq!(*alloc.released.borrow(), std::vec![0x20_0000usize]);
        assert_eq!(
            pt.translate(Vaddr::from_usize(0x2000_0000)),
            Some(Paddr::from_usize(0x60_0000))
        );
    }

    #[test]
    fn test_failed_map_rolls_back_installed_spans() {
        register_mocks();
        let alloc = HostTableAlloc::new();
        let mut pt = PageTable::new(&alloc).unwrap();

        // 跨 4K 页表边界的 8K 映射：第二页需要新的 4 级页表。
        // 配额恰好允许第一页的三个中间表，之后的分配失败。
        alloc.fail_after.set(Some(4));
        let req = user_4k_request(PAGE_2M_SIZE - PAGE_4K_SIZE, 0x80_0000, 2 * PAGE_4K_SIZE);
        assert_eq!(pt.map(&alloc, &req), Err(MmError::OutOfMemory));

        // 已装配的第一页被回滚，所有中间页表都被释放
        assert_eq!(
            pt.translate(Vaddr::from_usize(PAGE_2M_SIZE - PAGE_4K_SIZE)),
            None
        );
        assert_eq!(alloc.live_tables(), 1);
    }

    #[test]
    fn test_misaligned_request_rejected() {
        register_mocks();
        let alloc = HostTableAlloc::new();
        let mut pt = PageTable::new(&alloc).unwrap();
        let req = kernel_2m_request(0x1000, 0x20_0000, PAGE_2M_SIZE);
        assert_eq!(pt.map(&alloc, &req), Err(MmError::InvalidArgument));
    }

    #[test]
    fn test_destroy_user_half_frees_all_tables() {
        register_mocks();
        let alloc = HostTableAlloc::new();
        let mut pt = PageTable::new(&alloc).unwrap();

        pt.map(&alloc, &user_4k_request(0x1000, 0x80_0000, PAGE_4K_SIZE))
            .unwrap();
        pt.map(&alloc, &kernel_2m_request(0x4000_0000, 0x20_0000, PAGE_2M_SIZE))
            .unwrap();

        pt.destroy_user_half(&alloc);
        assert_eq!(alloc.live_tables(), 0);
    }
}
