//! 物理帧分配器
//!
//! 本模块以 **2MB 大页** 为粒度跟踪全部物理内存。
//!
//! ## 数据结构
//!
//! - **内存区域（Zone）**：启动内存图中的每段可用内存按物理地址切分为
//!   DMA / Normal / Unmapped 三类区域，各自维护空闲、已用帧计数。
//! - **帧记录（[`PageFrame`]）**：每个受管帧一条，含属性位、引用计数、
//!   年龄和匿名映射记录的反向引用；在初始化时一次性建立，只复用不销毁。
//! - **位图**：全局单张位图，每 bit 对应一帧（1=已分配）。空洞和不可用
//!   内存在初始化时预先置位。
//!
//! ## 分配策略
//!
//! 连续帧分配在目标区域的帧号区间内从低地址开始线性扫描位图，按 u64
//! 字为单位检查，用双字窗口处理跨字边界的连续空闲序列；命中后置位、
//! 更新计数并初始化各帧的属性与引用计数（首次分配或共享页时递增
//! 引用计数）。
//!
//! ## 锁
//!
//! 位图与分配计数由**一把**分配器级自旋锁保护；区域计数器和帧记录的
//! 属性 / 引用计数使用原子量；每帧自带一把小自旋锁，仅用于匿名映射
//! 记录的惰性创建与清除。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use log::{info, warn};
use sync::{SpinLock, SpinLockGuard};

use crate::address::{FrameNum, FrameRange, Paddr, UsizeConvert};
use crate::config::{PAGE_2M_SIZE, mm_config};
use crate::error::{MmError, MmResult};
use crate::memory_space::anon::AnonRecord;

/// 单次连续分配允许的最大帧数（不包含）
pub const MAX_CONTIG_FRAMES: usize = 64;

bitflags! {
    /// 物理帧属性位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttr: u64 {
        /// 帧已映射进页表
        const MAPPED = 1 << 0;
        /// 内核初始化阶段占用的帧
        const KERNEL_INIT = 1 << 1;
        /// 设备 MMIO 映射的内存（而非物理内存帧）
        const DEVICE = 1 << 2;
        /// 内核占用的帧
        const KERNEL = 1 << 3;
        /// 共享帧
        const SHARED = 1 << 4;
    }
}

/// 启动内存图中一段物理内存的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// 可用内存
    Usable,
    /// 固件保留
    Reserved,
    /// ACPI 可回收
    AcpiReclaimable,
    /// ACPI NVS
    AcpiNvs,
    /// 损坏内存
    Defective,
}

/// 启动层交给帧分配器的物理内存描述符
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
    /// 段基址
    pub base: Paddr,
    /// 段长度（字节）
    pub length: usize,
    /// 段类型
    pub kind: MemoryKind,
}

/// 内存区域的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    /// DMA 可达区域（低物理地址）
    Dma,
    /// 已建立线性映射的普通区域
    Normal,
    /// 超出线性映射范围、不在页表中的区域
    Unmapped,
}

/// 分配时选择的目标区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneSelect {
    /// 从 DMA 区域分配
    Dma,
    /// 从普通区域分配
    Normal,
    /// 从未线性映射区域分配
    Unmapped,
}

impl ZoneSelect {
    fn kind(self) -> ZoneKind {
        match self {
            ZoneSelect::Dma => ZoneKind::Dma,
            ZoneSelect::Normal => ZoneKind::Normal,
            ZoneSelect::Unmapped => ZoneKind::Unmapped,
        }
    }
}

/// 区域划分策略：物理地址低于 `dma_limit` 的帧归入 DMA 区域，
/// 超过 `linear_limit` 的帧归入 Unmapped 区域
#[derive(Debug, Clone, Copy)]
pub struct ZonePolicy {
    /// DMA 区域物理上界
    pub dma_limit: Paddr,
    /// 线性映射覆盖的物理上界
    pub linear_limit: Paddr,
}

impl ZonePolicy {
    /// 从已注册的 [`crate::MmConfig`] 构造
    pub fn from_config() -> Self {
        let cfg = mm_config();
        ZonePolicy {
            dma_limit: Paddr::from_usize(cfg.dma_limit()),
            linear_limit: Paddr::from_usize(cfg.linear_map_limit()),
        }
    }
}

/// 内存区域
#[derive(Debug)]
pub struct Zone {
    kind: ZoneKind,
    frames: FrameRange,
    count_free: AtomicUsize,
    count_using: AtomicUsize,
    /// 区域内全部帧的引用计数之和
    total_links: AtomicUsize,
}

impl Zone {
    /// 区域类型
    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    /// 区域覆盖的帧号范围
    pub fn frames(&self) -> FrameRange {
        self.frames
    }

    /// 空闲帧数
    pub fn free_frames(&self) -> usize {
        self.count_free.load(Ordering::Relaxed)
    }

    /// 已用帧数
    pub fn used_frames(&self) -> usize {
        self.count_using.load(Ordering::Relaxed)
    }
}

/// 物理帧记录
///
/// 每个受管帧一条；分配 / 释放 / 映射操作只修改其属性和计数，
/// 记录本身永不销毁。
#[derive(Debug)]
pub struct PageFrame {
    /// 所属区域在区域表中的下标（空洞帧为 `u32::MAX`）
    zone: u32,
    /// 帧起始物理地址
    paddr: Paddr,
    /// 属性位（[`PageAttr`]）
    attr: AtomicU64,
    /// 引用计数
    ref_counts: AtomicUsize,
    /// 年龄（回收策略预留，本子系统只清零）
    age: AtomicUsize,
    /// 匿名映射记录的反向引用；由本帧的小自旋锁保护
    anon: SpinLock<Option<Arc<AnonRecord>>>,
}

impl PageFrame {
    /// 帧起始物理地址
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    /// 帧号
    pub fn frame_num(&self) -> FrameNum {
        FrameNum::from_addr_floor(self.paddr)
    }

    /// 当前属性位
    pub fn attr(&self) -> PageAttr {
        PageAttr::from_bits_truncate(self.attr.load(Ordering::Acquire))
    }

    /// 当前引用计数
    pub fn ref_count(&self) -> usize {
        self.ref_counts.load(Ordering::Acquire)
    }

    /// 帧年龄
    pub fn age(&self) -> usize {
        self.age.load(Ordering::Relaxed)
    }

    /// 复制匿名映射记录的引用（如果存在）
    pub fn anon(&self) -> Option<Arc<AnonRecord>> {
        self.anon.lock().clone()
    }

    /// 锁住本帧的匿名映射记录槽位，返回保护器
    ///
    /// 匿名映射记录的惰性创建必须在持有此锁的情况下完成，
    /// 以避免两个并发映射者各自建一条记录。
    pub fn anon_guard(&self) -> SpinLockGuard<'_, Option<Arc<AnonRecord>>> {
        self.anon.lock()
    }
}

/// 位图与分配计数（由分配器级自旋锁保护的部分）
struct BitmapInner {
    /// 每 bit 一帧，1=已分配；下标相对 `FrameTable::base`
    words: Vec<u64>,
    /// 已分配的可用帧数
    allocated: usize,
}

/// 帧分配器上下文
///
/// 显式构造、按引用传递；内核全局实例由 [`crate::manager`] 持有。
pub struct FrameTable {
    /// 最低受管帧
    base: FrameNum,
    /// 最高受管帧（不包含）
    end: FrameNum,
    /// 可用帧总数（不含空洞）
    total_usable: usize,
    zones: Box<[Zone]>,
    frames: Box<[PageFrame]>,
    bitmap: SpinLock<BitmapInner>,
}

impl FrameTable {
    /// 从启动内存图构造帧分配器。
    ///
    /// 每段可用内存按 2MB 对齐收缩后、再按 `policy` 的地址边界切分为
    /// 若干区域；位图先整体置位，再为各区域复位。描述符必须按基址
    /// 升序排列。
    pub fn new(descriptors: &[MemoryDescriptor], policy: &ZonePolicy) -> MmResult<Self> {
        let mut zones: Vec<Zone> = Vec::new();
        let mut total_bytes = 0usize;

        for desc in descriptors {
            if desc.kind != MemoryKind::Usable || desc.length == 0 {
                continue;
            }
            total_bytes += desc.length;

            // 起始地址向上、结束地址向下对齐到 2MB
            let seg_start = desc.base.align_up_2m();
            let seg_end = (desc.base + desc.length).align_down_2m();
            if seg_end <= seg_start {
                continue;
            }

            // 按策略边界切分
            let mut cuts = [seg_start, seg_end, seg_end, seg_end];
            if policy.dma_limit > seg_start && policy.dma_limit < seg_end {
                cuts[1] = policy.dma_limit.align_down_2m();
            } else if policy.dma_limit <= seg_start {
                cuts[1] = seg_start;
            }
            if policy.linear_limit > seg_start && policy.linear_limit < seg_end {
                cuts[2] = policy.linear_limit.align_down_2m();
            } else if policy.linear_limit <= seg_start {
                cuts[2] = seg_start;
            }

            for piece in 0..3 {
                let (lo, hi) = (cuts[piece], cuts[piece + 1]);
                if hi <= lo {
                    continue;
                }
                let kind = match piece {
                    0 => ZoneKind::Dma,
                    1 => ZoneKind::Normal,
                    _ => ZoneKind::Unmapped,
                };
                let range = FrameRange::new(
                    FrameNum::from_addr_floor(lo),
                    FrameNum::from_addr_floor(hi),
                );
                zones.push(Zone {
                    kind,
                    frames: range,
                    count_free: AtomicUsize::new(range.len()),
                    count_using: AtomicUsize::new(0),
                    total_links: AtomicUsize::new(0),
                });
            }
        }

        if zones.is_empty() {
            return Err(MmError::InvalidArgument);
        }

        let base = zones.first().map(|z| z.frames.start()).unwrap();
        let end = zones.last().map(|z| z.frames.end()).unwrap();
        let frame_count = end - base;
        let total_usable: usize = zones.iter().map(|z| z.frames.len()).sum();

        // 位图先全部置位，再为各区域的可用帧复位
        let mut words = alloc::vec![u64::MAX; frame_count.div_ceil(64)];
        for zone in &zones {
            for f in zone.frames {
                let idx = f - base;
                words[idx >> 6] &= !(1u64 << (idx & 63));
            }
        }

        // 建立帧记录；空洞帧的区域下标记为 u32::MAX
        let mut frames = Vec::with_capacity(frame_count);
        let mut zi = 0usize;
        for idx in 0..frame_count {
            let f = base + idx;
            while zi < zones.len() && f >= zones[zi].frames.end() {
                zi += 1;
            }
            let zone = if zi < zones.len() && zones[zi].frames.contains(f) {
                zi as u32
            } else {
                u32::MAX
            };
            frames.push(PageFrame {
                zone,
                paddr: f.start_addr(),
                attr: AtomicU64::new(0),
                ref_counts: AtomicUsize::new(0),
                age: AtomicUsize::new(0),
                anon: SpinLock::new(None),
            });
        }

        info!(
            "frame allocator: {} usable 2M frames in {} zones ({} bytes of RAM)",
            total_usable,
            zones.len(),
            total_bytes
        );

        Ok(FrameTable {
            base,
            end,
            total_usable,
            zones: zones.into_boxed_slice(),
            frames: frames.into_boxed_slice(),
            bitmap: SpinLock::new(BitmapInner {
                words,
                allocated: 0,
            }),
        })
    }

    /// 最低受管帧号
    pub fn base(&self) -> FrameNum {
        self.base
    }

    /// 最高受管帧号（不包含）
    pub fn end_frame(&self) -> FrameNum {
        self.end
    }

    /// 区域列表
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// 取帧记录；帧号越界返回 [`MmError::Unsupported`]
    pub fn frame(&self, f: FrameNum) -> MmResult<&PageFrame> {
        if f < self.base || f >= self.end {
            return Err(MmError::Unsupported);
        }
        Ok(&self.frames[f - self.base])
    }

    /// 按物理地址取帧记录
    pub fn frame_by_paddr(&self, paddr: Paddr) -> MmResult<&PageFrame> {
        self.frame(FrameNum::from_addr_floor(paddr))
    }

    /// 帧当前是否处于已分配状态
    pub fn is_allocated(&self, f: FrameNum) -> MmResult<bool> {
        if f < self.base || f >= self.end {
            return Err(MmError::Unsupported);
        }
        let idx = f - self.base;
        let inner = self.bitmap.lock();
        Ok(inner.words[idx >> 6] & (1u64 << (idx & 63)) != 0)
    }

    /// 在目标区域中分配 `count` 个连续帧。
    ///
    /// `count` 必须满足 `0 < count < 64`。从低地址开始首次适应扫描；
    /// 成功后每帧都会按 `attr` 初始化（DMA / Normal 隐含
    /// [`PageAttr::MAPPED`]，Unmapped 区域忽略传入属性）。
    /// 找不到连续空闲序列时返回 [`MmError::OutOfMemory`]，
    /// 调用者必须显式处理。
    pub fn allocate(
        &self,
        select: ZoneSelect,
        count: usize,
        attr: PageAttr,
    ) -> MmResult<FrameRange> {
        if count == 0 || count >= MAX_CONTIG_FRAMES {
            return Err(MmError::InvalidArgument);
        }

        let attr = match select {
            ZoneSelect::Dma | ZoneSelect::Normal => attr | PageAttr::MAPPED,
            ZoneSelect::Unmapped => PageAttr::empty(),
        };

        let kind = select.kind();
        let start = {
            let mut inner = self.bitmap.lock();
            let mut found = None;
            for (zi, zone) in self.zones.iter().enumerate() {
                if zone.kind != kind || zone.free_frames() < count {
                    continue;
                }
                let lo = zone.frames.start() - self.base;
                let hi = zone.frames.end() - self.base;
                if let Some(idx) = scan_free_run(&inner.words, lo, hi, count) {
                    for i in 0..count {
                        let bit = idx + i;
                        inner.words[bit >> 6] |= 1u64 << (bit & 63);
                    }
                    inner.allocated += count;
                    zone.count_free.fetch_sub(count, Ordering::Relaxed);
                    zone.count_using.fetch_add(count, Ordering::Relaxed);
                    found = Some((idx, zi));
                    break;
                }
            }
            match found {
                Some((idx, _)) => self.base + idx,
                None => return Err(MmError::OutOfMemory),
            }
        };

        // 属性与引用计数在锁外初始化（均为原子量 / 帧内小锁）
        let range = FrameRange::from_start_len(start, count);
        for f in range {
            self.init_frame(f - self.base, attr);
        }
        Ok(range)
    }

    /// 释放一段连续帧。
    ///
    /// 复位位图、更新计数并把各帧属性清零；引用计数不在这里处理
    /// （归 [`FrameTable::page_clean`] 管）。
    pub fn free(&self, range: FrameRange) -> MmResult<()> {
        if range.is_empty() || range.len() >= MAX_CONTIG_FRAMES {
            return Err(MmError::InvalidArgument);
        }
        if range.start() < self.base || range.end() > self.end {
            return Err(MmError::Unsupported);
        }

        let mut inner = self.bitmap.lock();
        // 先整体校验，避免半途发现重复释放时状态已被破坏
        for f in range {
            let idx = f - self.base;
            if inner.words[idx >> 6] & (1u64 << (idx & 63)) == 0 {
                warn!("free: double free of frame {:?}", f);
                return Err(MmError::InvalidArgument);
            }
        }
        for f in range {
            let idx = f - self.base;
            inner.words[idx >> 6] &= !(1u64 << (idx & 63));
            let frame = &self.frames[idx];
            frame.attr.store(0, Ordering::Release);
            if let Some(zone) = self.zone_of(frame) {
                zone.count_free.fetch_add(1, Ordering::Relaxed);
                zone.count_using.fetch_sub(1, Ordering::Relaxed);
            }
        }
        inner.allocated -= range.len();
        Ok(())
    }

    /// 把一段物理地址范围标记为已占用（内核映像、启动堆、第 0 帧等）。
    ///
    /// 超出受管范围的部分被忽略；返回实际标记的帧数。
    pub fn mark_reserved(&self, start: Paddr, length: usize, attr: PageAttr) -> usize {
        let lo = FrameNum::from_addr_floor(start).max(self.base);
        let hi = FrameNum::from_addr_ceil(start + length).min(self.end);
        if hi <= lo {
            return 0;
        }

        let mut newly_marked = Vec::new();
        {
            let mut inner = self.bitmap.lock();
            for f in FrameRange::new(lo, hi) {
                let idx = f - self.base;
                if inner.words[idx >> 6] & (1u64 << (idx & 63)) != 0 {
                    continue; // 空洞或已被占用
                }
                inner.words[idx >> 6] |= 1u64 << (idx & 63);
                inner.allocated += 1;
                let frame = &self.frames[idx];
                if let Some(zone) = self.zone_of(frame) {
                    zone.count_free.fetch_sub(1, Ordering::Relaxed);
                    zone.count_using.fetch_add(1, Ordering::Relaxed);
                }
                newly_marked.push(idx);
            }
        }

        for &idx in &newly_marked {
            self.init_frame(idx, attr);
        }
        newly_marked.len()
    }

    /// 递减帧的引用计数；计数归零时清空除 MAPPED 以外的所有属性。
    pub fn page_clean(&self, f: FrameNum) -> MmResult<()> {
        let frame = self.frame(f)?;
        let prev = frame.ref_counts.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "page_clean: ref count underflow");
        if let Some(zone) = self.zone_of(frame) {
            zone.total_links.fetch_sub(1, Ordering::Relaxed);
        }
        if prev == 1 {
            let kept = frame.attr.load(Ordering::Acquire) & PageAttr::MAPPED.bits();
            frame.attr.store(kept, Ordering::Release);
        }
        Ok(())
    }

    /// 可用帧总数
    pub fn total_frames(&self) -> usize {
        self.total_usable
    }

    /// 已分配帧数
    pub fn used_frames(&self) -> usize {
        self.bitmap.lock().allocated
    }

    /// 空闲帧数
    pub fn free_frames(&self) -> usize {
        self.total_usable - self.used_frames()
    }

    /// 带共享属性的帧数
    pub fn shared_frames(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| f.attr().contains(PageAttr::SHARED))
            .count()
    }

    /// 可用内存总量（字节）
    pub fn total_bytes(&self) -> usize {
        self.total_usable * PAGE_2M_SIZE
    }

    fn zone_of(&self, frame: &PageFrame) -> Option<&Zone> {
        self.zones.get(frame.zone as usize)
    }

    /// 初始化帧的属性与引用计数（允许重复初始化同一帧）。
    ///
    /// 引用计数仅在原计数为零或帧为共享页时递增；位图置位和区域计数
    /// 由分配路径负责。
    fn init_frame(&self, idx: usize, attr: PageAttr) {
        let frame = &self.frames[idx];
        let prev = frame.attr.fetch_or(attr.bits(), Ordering::AcqRel);
        let merged = PageAttr::from_bits_truncate(prev) | attr;
        if frame.ref_counts.load(Ordering::Acquire) == 0 || merged.contains(PageAttr::SHARED) {
            frame.ref_counts.fetch_add(1, Ordering::AcqRel);
            if let Some(zone) = self.zone_of(frame) {
                zone.total_links.fetch_add(1, Ordering::Relaxed);
            }
        }
        frame.age.store(0, Ordering::Relaxed);
        *frame.anon.lock() = None;
    }
}

/// 在位图的 `[start, end)` bit 区间内寻找 `count` 个连续的 0 bit。
///
/// 按 u64 字检查：整字已满直接跳过；其余位置用双字窗口拼出从当前
/// bit 开始的 64 bit 视图，与长度掩码求交。返回首个命中的 bit 下标。
fn scan_free_run(words: &[u64], start: usize, end: usize, count: usize) -> Option<usize> {
    debug_assert!(count >= 1 && count < MAX_CONTIG_FRAMES);
    let mask = (1u64 << count) - 1;
    let mut idx = start;
    while idx + count <= end {
        let wi = idx >> 6;
        let shift = idx & 63;
        let word = words[wi];
        if word == u64::MAX {
            // 整字已满，跳到下一个字边界
            idx = (wi + 1) << 6;
            continue;
        }
        let window = if shift == 0 {
            word
        } else {
            let hi = words.get(wi + 1).copied().unwrap_or(u64::MAX);
            (word >> shift) | (hi << (64 - shift))
        };
        if window & mask == 0 {
            return Some(idx);
        }
        idx += 1;
    }
    None
}
