//! 虚拟内存区域

use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::address::Vaddr;
use crate::memory_space::anon::AnonRecord;
use crate::page_table::EntryFlags;

bitflags! {
    /// 区域标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u64 {
        /// 可读
        const READ = 1 << 0;
        /// 可写
        const WRITE = 1 << 1;
        /// 可执行
        const EXEC = 1 << 2;
        /// 共享区域
        const SHARED = 1 << 3;
        /// MMIO 的内存区域
        const IO = 1 << 4;
        /// 该区域可被共享
        const MAYSHARE = 1 << 6;
        /// 该区域可被用户态访问
        const USER = 1 << 7;
        /// fork 时不拷贝该区域
        const DONTCOPY = 1 << 8;

        /// 基本访问权限
        const ACCESS = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// 区域标识符
///
/// 区域在有序表内的位置会因合并 / 删除而变动，跨模块引用
/// （尤其是匿名映射记录的附着表）一律使用稳定的 id。
pub type RegionId = u64;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// 区域的操作回调表
///
/// 外部子系统（驱动、文件层）可以挂接区域插入 / 移除时的回调。
pub trait RegionOps: Send + Sync {
    /// 区域被插入地址空间时调用
    fn open(&self, _region: &Region) {}
    /// 区域将要被移除时调用
    fn close(&self, _region: &Region) {}
}

/// 虚拟内存区域：一段访问属性一致的连续虚拟地址区间 `[start, end)`
pub struct Region {
    id: RegionId,
    start: Vaddr,
    end: Vaddr,
    flags: VmFlags,
    /// 区域起点相对所在 2MB 跨度起点的偏移（区域不从大页边界开始时非零）
    page_offset: usize,
    ops: Option<&'static dyn RegionOps>,
    anon: Option<Arc<AnonRecord>>,
}

impl Region {
    pub(crate) fn new(
        start: Vaddr,
        length: usize,
        flags: VmFlags,
        ops: Option<&'static dyn RegionOps>,
    ) -> Self {
        Region {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            start,
            end: start + length,
            flags,
            page_offset: start - start.align_down_2m(),
            ops,
            anon: None,
        }
    }

    /// 区域标识符
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// 起始地址
    pub fn start(&self) -> Vaddr {
        self.start
    }

    /// 结束地址（不包含）
    pub fn end(&self) -> Vaddr {
        self.end
    }

    /// 区域长度（字节）
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// 区域是否为空
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// 区域标志
    pub fn flags(&self) -> VmFlags {
        self.flags
    }

    /// 起点相对 2MB 跨度起点的偏移
    pub fn page_offset(&self) -> usize {
        self.page_offset
    }

    /// 操作回调表
    pub fn ops(&self) -> Option<&'static dyn RegionOps> {
        self.ops
    }

    /// 匿名映射记录（如果区域已映射）
    pub fn anon(&self) -> Option<&Arc<AnonRecord>> {
        self.anon.as_ref()
    }

    /// 地址是否落在区域内
    pub fn contains(&self, vaddr: Vaddr) -> bool {
        vaddr >= self.start && vaddr < self.end
    }

    /// 由区域标志推导页表项的权限位
    pub fn entry_flags(&self) -> EntryFlags {
        let mut flags = EntryFlags::empty();
        if self.flags.contains(VmFlags::WRITE) {
            flags |= EntryFlags::WRITABLE;
        }
        if !self.flags.contains(VmFlags::EXEC) {
            flags |= EntryFlags::NO_EXECUTE;
        }
        if self.flags.contains(VmFlags::IO) {
            flags |= EntryFlags::device();
        }
        flags
    }

    pub(crate) fn set_range(&mut self, start: Vaddr, end: Vaddr) {
        self.start = start;
        self.end = end;
        self.page_offset = start - start.align_down_2m();
    }

    pub(crate) fn set_anon(&mut self, record: Arc<AnonRecord>) {
        self.anon = Some(record);
    }

    pub(crate) fn take_anon(&mut self) -> Option<Arc<AnonRecord>> {
        self.anon.take()
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("flags", &self.flags)
            .field("anon", &self.anon.is_some())
            .finish()
    }
}

/// 区域插入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 按地址序插入了新区域
    Inserted,
    /// 与现有区域就地合并（两者落在同一个 2MB 对齐跨度内）
    Merged,
    /// 已存在完全覆盖新区间的区域，列表未变
    Exists,
}
