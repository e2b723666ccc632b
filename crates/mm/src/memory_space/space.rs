//! 地址空间核心实现
//!
//! [`AddressSpace`] = 页表根 + 按地址排序的区域表 + 段布局标记。
//! 一个进程一个实例；内核自身持有一个静态实例。区域表的结构性修改
//! 由调用者（进程层的锁）串行化。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::{max, min};
use log::warn;

use crate::address::{FrameRange, Paddr, UsizeConvert, Vaddr};
use crate::config::{PAGE_2M_SIZE, mm_config};
use crate::error::{MmError, MmResult};
use crate::frame_allocator::{FrameTable, PageAttr, ZoneSelect};
use crate::memory_space::anon::{AnonBacking, AnonRecord};
use crate::memory_space::region::{InsertOutcome, Region, RegionId, RegionOps, VmFlags};
use crate::page_table::{MapRequest, PageTable, TableAlloc};
use crate::tlb;

/// 内核映像各段与堆 / 栈的地址标记
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentLayout {
    /// 代码段起始
    pub code_start: Vaddr,
    /// 代码段结束
    pub code_end: Vaddr,
    /// 数据段起始
    pub data_start: Vaddr,
    /// 数据段结束
    pub data_end: Vaddr,
    /// 只读数据段起始
    pub rodata_start: Vaddr,
    /// 只读数据段结束
    pub rodata_end: Vaddr,
    /// BSS 段起始
    pub bss_start: Vaddr,
    /// BSS 段结束
    pub bss_end: Vaddr,
    /// 堆起始
    pub brk_start: Vaddr,
    /// 堆当前结束（2MB 对齐）
    pub brk_end: Vaddr,
    /// 栈起始
    pub stack_start: Vaddr,
}

/// 地址空间
pub struct AddressSpace {
    table: PageTable,
    /// 按起始地址升序排列的区域表
    regions: Vec<Region>,
    layout: SegmentLayout,
}

impl AddressSpace {
    /// 新建空地址空间（分配新的页表根）
    pub fn new(alloc: &dyn TableAlloc) -> MmResult<Self> {
        Ok(AddressSpace {
            table: PageTable::new(alloc)?,
            regions: Vec::new(),
            layout: SegmentLayout::default(),
        })
    }

    /// 包装一个已存在的页表根（内核启动页表）
    pub fn from_root(root: Paddr) -> Self {
        AddressSpace {
            table: PageTable::from_root(root),
            regions: Vec::new(),
            layout: SegmentLayout::default(),
        }
    }

    /// 为新进程创建地址空间：新的根节点，内核高半区从内核空间复制
    pub fn new_user(alloc: &dyn TableAlloc, kernel: &AddressSpace) -> MmResult<Self> {
        let mut space = Self::new(alloc)?;
        space.table.copy_kernel_half(&kernel.table);
        Ok(space)
    }

    /// 页表
    pub fn table(&self) -> &PageTable {
        &self.table
    }

    /// 页表（可变）
    pub fn table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    /// 段布局标记
    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    /// 段布局标记（可变）
    pub fn layout_mut(&mut self) -> &mut SegmentLayout {
        &mut self.layout
    }

    /// 区域表（按地址升序）
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// 查找包含给定地址的区域
    pub fn find_region(&self, vaddr: Vaddr) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(vaddr))
    }

    /// 按 id 查找区域
    pub fn region_by_id(&self, id: RegionId) -> Option<&Region> {
        self.regions.iter().find(|r| r.id() == id)
    }

    fn region_index_by_id(&self, id: RegionId) -> Option<usize> {
        self.regions.iter().position(|r| r.id() == id)
    }

    /// 创建一个区域并插入区域表。
    ///
    /// 地址必须按 4KB 对齐；长度向上取整到 4KB。返回区域 id 与插入
    /// 结果：现有区域完全覆盖新区间时返回其 id 和
    /// [`InsertOutcome::Exists`]；与邻居落在同一个 2MB 对齐跨度内时
    /// 就地合并并返回幸存区域的 id。
    pub fn create_region(
        &mut self,
        vaddr: Vaddr,
        length: usize,
        flags: VmFlags,
        ops: Option<&'static dyn RegionOps>,
    ) -> MmResult<(RegionId, InsertOutcome)> {
        if !vaddr.is_4k_aligned() || length == 0 {
            return Err(MmError::InvalidArgument);
        }
        let length = Vaddr::from_usize(length).align_up_4k().as_usize();
        if flags.contains(VmFlags::USER)
            && vaddr.as_usize() + length > mm_config().user_max_vaddr()
        {
            return Err(MmError::InvalidArgument);
        }

        self.insert(Region::new(vaddr, length, flags, ops))
    }

    /// 把区域按地址序插入区域表，处理覆盖 / 合并 / 冲突。
    fn insert(&mut self, region: Region) -> MmResult<(RegionId, InsertOutcome)> {
        let start = region.start();
        let end = region.end();

        // 找到第一个结束地址超过新区域起点的现有区域
        let pos = self.regions.iter().position(|r| r.end() > start);
        if let Some(i) = pos {
            let existing = &self.regions[i];
            // 现有区域完全覆盖新区间：已存在
            if existing.start() <= start && existing.end() >= end {
                return Ok((existing.id(), InsertOutcome::Exists));
            }

            // 与该区域相交
            if start < existing.end() && existing.start() < end {
                let union_start = min(existing.start(), start);
                let union_end = max(existing.end(), end);
                // 两端落在同一个 2MB 对齐跨度内：就地合并
                if same_2m_span(union_start, union_end) {
                    let id = existing.id();
                    self.regions[i].set_range(union_start, union_end);
                    return Ok((id, InsertOutcome::Merged));
                }
                // 跨越 2MB 边界的真重叠无法表达
                return Err(MmError::RegionExists);
            }

            // 与后继恰好相接
            let (succ_id, succ_start, succ_end) = (existing.id(), existing.start(), existing.end());
            if succ_start == end && same_2m_span(start, succ_end) {
                self.regions[i].set_range(start, succ_end);
                return Ok((succ_id, InsertOutcome::Merged));
            }
        }

        // 与前驱恰好相接
        let insert_at = pos.unwrap_or(self.regions.len());
        if insert_at > 0 {
            let (prev_id, prev_start, prev_end) = {
                let prev = &self.regions[insert_at - 1];
                (prev.id(), prev.start(), prev.end())
            };
            if prev_end == start && same_2m_span(prev_start, end) {
                self.regions[insert_at - 1].set_range(prev_start, end);
                return Ok((prev_id, InsertOutcome::Merged));
            }
        }

        let id = region.id();
        if let Some(ops) = region.ops() {
            ops.open(&region);
        }
        self.regions.insert(insert_at, region);
        Ok((id, InsertOutcome::Inserted))
    }

    /// 把物理内存绑定到区域并装配页表映射。
    ///
    /// 流程：取得（或惰性创建）目标帧的匿名映射记录并附着本区域，
    /// 然后至多调用三次页表映射器：先用 4K 小页补齐到 2MB 边界的
    /// 前导跨度，再映射最大的整 2MB 连续段，最后用 4K 小页补齐尾部，
    /// 以减少触碰的页表级数。任何一段失败都会回滚已装配的跨度并
    /// 解除附着。成功后统一刷新一次 TLB。
    pub fn map_region(
        &mut self,
        frames: &FrameTable,
        alloc: &dyn TableAlloc,
        id: RegionId,
        paddr: Paddr,
        offset: usize,
        length: usize,
    ) -> MmResult<()> {
        let idx = self.region_index_by_id(id).ok_or(MmError::NotFound)?;
        let (r_start, r_end, r_flags, r_anon) = {
            let r = &self.regions[idx];
            (r.start(), r.end(), r.flags(), r.anon().cloned())
        };

        if offset & (crate::config::PAGE_4K_SIZE - 1) != 0 || length == 0 {
            return Err(MmError::InvalidArgument);
        }
        let length = Vaddr::from_usize(length).align_up_4k().as_usize();
        let map_base = r_start + offset;
        if map_base.as_usize() + length > r_end.as_usize() {
            return Err(MmError::InvalidArgument);
        }

        let device = r_flags.contains(VmFlags::IO);
        let user = r_flags.contains(VmFlags::USER);
        let extra = {
            let r = &self.regions[idx];
            r.entry_flags()
        };

        // 取得记录并附着；与并发退役竞争时重试
        let (record, guard) = loop {
            let record = if device {
                match &r_anon {
                    Some(r) if !r.is_dying() => r.clone(),
                    // 对 MMIO 内存，创建独立的设备记录（不挂在帧表上）
                    _ => AnonRecord::new(AnonBacking::Device(paddr)),
                }
            } else {
                let frame = frames.frame_by_paddr(paddr)?;
                let mut slot = frame.anon_guard();
                match &*slot {
                    Some(r) if !r.is_dying() => r.clone(),
                    _ => {
                        let r = AnonRecord::new(AnonBacking::Ram(frame.frame_num()));
                        *slot = Some(r.clone());
                        r
                    }
                }
            };
            if let Some(guard) = AnonRecord::attach(&record, id) {
                break (record, guard);
            }
            // 记录恰好在退役：重新获取
        };

        // ==== 三段映射 ====
        let misalign = map_base.as_usize() & (PAGE_2M_SIZE - 1);
        let lead = if misalign != 0 {
            min(length, PAGE_2M_SIZE - misalign)
        } else {
            0
        };
        let mid = (length - lead) & !(PAGE_2M_SIZE - 1);
        let tail = length - lead - mid;

        let mut done = 0usize;
        let phases = [(lead, true), (mid, false), (tail, true)];
        for (phase_len, use_4k) in phases {
            if phase_len == 0 {
                continue;
            }
            let req = MapRequest {
                vaddr: map_base + done,
                paddr: paddr + done,
                length: phase_len,
                flags: extra,
                user,
                flush: false,
                use_4k,
            };
            if let Err(err) = self.table.map(alloc, &req) {
                // 回滚之前已装配的段（map 内部已回滚失败段自身）
                if done > 0 {
                    let _ = self.table.unmap(alloc, map_base, done, false);
                }
                drop(guard);
                discard_if_unreferenced(frames, &record, device);
                warn!("map_region: failed to map region {id}: {err:?}");
                return Err(err);
            }
            done += phase_len;
        }

        let record = guard.commit();
        self.regions[idx].set_anon(record);
        tlb::flush_all();
        Ok(())
    }

    /// 解除区域的映射。
    ///
    /// 持有记录的睡眠锁完成页表清理与解除附着；附着计数归零时退役
    /// 记录并归还背后的物理帧（设备内存只销毁记录）。
    /// 返回区域起点此前翻译到的物理地址。
    pub fn unmap_region(
        &mut self,
        frames: &FrameTable,
        alloc: &dyn TableAlloc,
        id: RegionId,
    ) -> MmResult<Option<Paddr>> {
        let idx = self.region_index_by_id(id).ok_or(MmError::NotFound)?;
        let (start, len) = {
            let r = &self.regions[idx];
            (r.start(), r.len())
        };
        let paddr = self.table.translate(start);

        match self.regions[idx].take_anon() {
            None => {
                warn!("unmap_region: region {id} has no anon record");
                self.table.unmap(alloc, start, len, true)?;
            }
            Some(record) => {
                let now_empty = {
                    let mut attach = record.lock();
                    self.table.unmap(alloc, start, len, false)?;
                    attach.detach(id)
                };
                tlb::flush_all();
                if now_empty {
                    retire_record(frames, &record);
                }
            }
        }
        Ok(paddr)
    }

    /// 解除一段虚拟地址的映射（这些地址必须被区域覆盖且与区域边界
    /// 对齐），`destroy` 为真时同时销毁区域对象。
    pub fn unmap(
        &mut self,
        frames: &FrameTable,
        alloc: &dyn TableAlloc,
        vaddr: Vaddr,
        length: usize,
        destroy: bool,
    ) -> MmResult<()> {
        let mut unmapped = 0usize;
        while unmapped < length {
            let cur = vaddr + unmapped;
            let idx = self
                .regions
                .iter()
                .position(|r| r.contains(cur))
                .ok_or(MmError::NotFound)?;
            if self.regions[idx].start() != cur {
                warn!("unmap: address {cur:?} is not a region start");
                return Err(MmError::InvalidArgument);
            }
            let id = self.regions[idx].id();
            let len = self.regions[idx].len();
            if self.regions[idx].anon().is_some() {
                self.unmap_region(frames, alloc, id)?;
            }
            unmapped += len;

            if destroy {
                // idx 在 unmap_region 之后仍然有效：该调用不增删区域
                let region = self.regions.remove(idx);
                if let Some(ops) = region.ops() {
                    ops.close(&region);
                }
            }
        }
        Ok(())
    }

    /// 在已有区域之上映射一段虚拟地址（地址必须被区域覆盖）。
    ///
    /// 跨越多个区域时逐个调用 [`AddressSpace::map_region`]。
    pub fn map_at(
        &mut self,
        frames: &FrameTable,
        alloc: &dyn TableAlloc,
        vaddr: Vaddr,
        length: usize,
        paddr: Paddr,
    ) -> MmResult<()> {
        let mut mapped = 0usize;
        while mapped < length {
            let cur = vaddr + mapped;
            let (id, r_start, r_end) = {
                let r = self.find_region(cur).ok_or(MmError::NotFound)?;
                (r.id(), r.start(), r.end())
            };
            let offset = cur - r_start;
            let m_len = min(r_end - cur, length - mapped);
            self.map_region(frames, alloc, id, paddr + mapped, offset, m_len)?;
            mapped += m_len;
        }
        Ok(())
    }

    /// 扩展堆：以 2MB 为步长创建区域、分配物理帧并映射。
    ///
    /// 返回新的堆结束地址。中途失败时已完成的步长保留，
    /// `brk_end` 推进到失败点。
    pub fn grow_heap(
        &mut self,
        frames: &FrameTable,
        alloc: &dyn TableAlloc,
        delta: usize,
    ) -> MmResult<Vaddr> {
        let old_end = self.layout.brk_end;
        let new_end = (old_end + delta).align_up_2m();

        let mut cur = old_end;
        while cur < new_end {
            let (id, _) = match self.create_region(
                cur,
                PAGE_2M_SIZE,
                VmFlags::USER | VmFlags::ACCESS,
                None,
            ) {
                Ok(v) => v,
                Err(err) => {
                    self.layout.brk_end = cur;
                    return Err(err);
                }
            };
            let range = match frames.allocate(ZoneSelect::Normal, 1, PageAttr::empty()) {
                Ok(range) => range,
                Err(err) => {
                    self.layout.brk_end = cur;
                    return Err(err);
                }
            };
            if let Err(err) =
                self.map_region(frames, alloc, id, range.start().start_addr(), 0, PAGE_2M_SIZE)
            {
                let _ = frames.page_clean(range.start());
                let _ = frames.free(range);
                self.layout.brk_end = cur;
                return Err(err);
            }
            cur = cur + PAGE_2M_SIZE;
        }
        self.layout.brk_end = new_end;
        Ok(new_end)
    }

    /// 收缩堆：解除映射并销毁多出的 2MB 步长区域，背后的物理帧
    /// 经由匿名映射记录的退役流程归还分配器。
    pub fn shrink_heap(
        &mut self,
        frames: &FrameTable,
        alloc: &dyn TableAlloc,
        delta: usize,
    ) -> MmResult<Vaddr> {
        let old_end = self.layout.brk_end;
        let new_end = max(
            self.layout.brk_start,
            Vaddr::from_usize(old_end.as_usize().saturating_sub(delta)).align_up_2m(),
        );
        if new_end < old_end {
            self.unmap(frames, alloc, new_end, old_end - new_end, true)?;
            self.layout.brk_end = new_end;
        }
        Ok(self.layout.brk_end)
    }

    /// 销毁地址空间：解除全部区域的映射，随后释放用户半区的页表。
    pub fn destroy(mut self, frames: &FrameTable, alloc: &dyn TableAlloc) -> MmResult<()> {
        while !self.regions.is_empty() {
            let (id, mapped) = {
                let region = self.regions.last().unwrap();
                (region.id(), region.anon().is_some())
            };
            if mapped {
                self.unmap_region(frames, alloc, id)?;
            }
            let region = self.regions.pop().unwrap();
            if let Some(ops) = region.ops() {
                ops.close(&region);
            }
        }
        self.table.destroy_user_half(alloc);
        Ok(())
    }
}

/// 两个地址是否落在同一个 2MB 对齐跨度内（`end` 不包含）
fn same_2m_span(start: Vaddr, end: Vaddr) -> bool {
    start.align_down_2m() == (end - 1usize).align_down_2m()
}

/// 退役一条附着计数已归零的记录：清除帧上的反向引用、递减帧引用
/// 计数并把帧还给分配器；设备内存只销毁记录。
fn retire_record(frames: &FrameTable, record: &Arc<AnonRecord>) {
    match record.backing() {
        AnonBacking::Ram(f) => {
            if let Ok(frame) = frames.frame(f) {
                let mut slot = frame.anon_guard();
                if slot.as_ref().is_some_and(|r| Arc::ptr_eq(r, record)) {
                    *slot = None;
                }
                drop(slot);
                if frames.page_clean(f).is_err() {
                    warn!("retire: page_clean failed for frame {f:?}");
                }
                if frames.free(FrameRange::from_start_len(f, 1)).is_err() {
                    warn!("retire: frame {f:?} double free");
                }
            }
        }
        AnonBacking::Device(_) => {
            // 设备内存页不归还帧分配器，记录随引用消失
        }
    }
}

/// 映射失败的回退路径：记录若已无附着者，仅清除帧上的反向引用，
/// 帧本身仍归调用者所有。
fn discard_if_unreferenced(frames: &FrameTable, record: &Arc<AnonRecord>, device: bool) {
    if device || !record.is_dying() {
        return;
    }
    if let AnonBacking::Ram(f) = record.backing() {
        if let Ok(frame) = frames.frame(f) {
            let mut slot = frame.anon_guard();
            if slot.as_ref().is_some_and(|r| Arc::ptr_eq(r, record)) {
                *slot = None;
            }
        }
    }
}
