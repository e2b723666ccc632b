//! SLAB 内核堆
//!
//! 面向全内核的通用分配器，建立在帧分配器之上。
//!
//! ## 结构
//!
//! 16 个内存池，尺寸类为 2 的幂（32B 到 1MB）。每个池持有一条
//! slab 对象的环形链表；一个 slab 对象占一个 2MB 帧，按固定尺寸
//! 切成槽位，用位图记录占用情况。
//!
//! ## 元数据放置
//!
//! - 尺寸类 ≤ 512B：slab 头部和位图嵌在帧**尾部**。这些类的位图大、
//!   对象小，另行分配位图会让本函数与自身反复互相调用，最终栈溢出；
//!   嵌入同时省掉一次分配。
//! - 尺寸类 ≥ 1KB：位图很短，嵌入会挤占本就不多的槽位，
//!   头部和位图改从小尺寸类的池里分配。
//! - 启动自举 slab 一律采用嵌入式（彼时还没有可用的分配器），
//!   且永不释放。
//!
//! ## 锁与收缩
//!
//! 每个池一把自旋锁，只在位图扫描与链表操作期间持有；扩容
//! （帧分配、元数据构造）在锁外进行，避免把帧分配器的临界区
//! 嵌进池锁里。释放时，完全空闲的非自举 slab 在池的空闲总量
//! 不少于其容量两倍时被整体归还帧分配器，以限制内存增长。

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::mem::size_of;
use core::ptr::{self, NonNull, null_mut};
use log::{info, warn};
use once_cell::race::OnceBox;
use sync::SpinLock;

use crate::address::{FrameNum, FrameRange, Paddr, UsizeConvert, Vaddr};
use crate::arch_ops;
use crate::config::{PAGE_2M_MASK, PAGE_2M_SIZE, PAGE_4K_SIZE};
use crate::error::{MmError, MmResult};
use crate::frame_allocator::{FrameTable, PageAttr, ZoneSelect};
use crate::page_table::TableAlloc;

/// 尺寸类数量
pub const SLAB_CLASS_COUNT: usize = 16;
/// 最小尺寸类的位移（32B）
const MIN_SHIFT: usize = 5;
/// 单次分配的最大字节数（最大尺寸类，1MB）
pub const SLAB_MAX_ALLOC: usize = 1 << (MIN_SHIFT + SLAB_CLASS_COUNT - 1);
/// 嵌入式元数据的尺寸类上限
const EMBED_LIMIT: usize = 512;

#[inline]
fn class_size(index: usize) -> usize {
    1 << (MIN_SHIFT + index)
}

#[inline]
fn class_index(size: usize) -> usize {
    let size = size.max(1 << MIN_SHIFT).next_power_of_two();
    size.trailing_zeros() as usize - MIN_SHIFT
}

/// slab 对象头部
///
/// 嵌入式元数据时位于所管理帧的尾部；大尺寸类时由内存池另行分配。
#[repr(C)]
struct SlabObj {
    prev: *mut SlabObj,
    next: *mut SlabObj,
    /// 数据区起始虚拟地址（2MB 对齐）
    vaddr: usize,
    /// 背后 2MB 帧的起始物理地址
    paddr: usize,
    /// 槽位总数
    capacity: usize,
    /// 空闲槽位数
    free_count: usize,
    /// 占用位图（1=已分配；容量之外的尾部 bit 恒为 1）
    bmp: *mut u64,
    bmp_words: usize,
    /// 头部与位图由内存池另行分配
    external: bool,
    /// 启动自举 slab，永不释放
    bootstrap: bool,
}

/// 一个尺寸类的内存池
struct Pool {
    size: usize,
    /// 环形双向链表入口；空池为 null
    head: *mut SlabObj,
    total_free: usize,
    total_using: usize,
}

// SAFETY: slab 头部只通过持有池锁的代码访问，指针不跨池共享。
unsafe impl Send for Pool {}

/// 待释放 slab 的信息（在池锁外完成实际释放）
struct PendingRelease {
    paddr: usize,
    external: bool,
    header: *mut SlabObj,
    bmp: *mut u64,
}

/// SLAB 内核堆
pub struct KernelHeap {
    pools: [SpinLock<Pool>; SLAB_CLASS_COUNT],
    /// 扩容与释放所用的帧分配器；自举阶段之后挂接
    frames: OnceBox<Arc<FrameTable>>,
}

impl KernelHeap {
    /// 创建一个空堆（所有池都没有 slab，需要先自举）
    pub fn new() -> Self {
        KernelHeap {
            pools: core::array::from_fn(|i| {
                SpinLock::new(Pool {
                    size: class_size(i),
                    head: null_mut(),
                    total_free: 0,
                    total_using: 0,
                })
            }),
            frames: OnceBox::new(),
        }
    }

    /// 堆自举：从给定的线性映射区域为每个尺寸类切出一个嵌入式 slab。
    ///
    /// 帧分配器尚不存在时即可调用；区域占用的帧之后必须由调用者在
    /// 帧分配器中标记为已占用。
    ///
    /// # Safety
    /// `region` 必须指向一段可写、按 2MB 对齐、长度不少于
    /// `SLAB_CLASS_COUNT * PAGE_2M_SIZE` 的线性映射内存，且之后不再
    /// 被其它用途触碰。
    pub unsafe fn bootstrap(&self, region: Vaddr, length: usize) -> MmResult<()> {
        if !region.is_2m_aligned() || length < SLAB_CLASS_COUNT * PAGE_2M_SIZE {
            return Err(MmError::InvalidArgument);
        }

        for i in 0..SLAB_CLASS_COUNT {
            let page_va = region.as_usize() + i * PAGE_2M_SIZE;
            // SAFETY: 调用者保证区域位于线性映射内
            let paddr = unsafe { arch_ops().vaddr_to_paddr(page_va) };
            // SAFETY: 该 2MB 页可写且归本 slab 独占
            let obj = unsafe { carve_embedded(page_va, paddr, class_size(i), true) };
            let mut pool = self.pools[i].lock();
            // SAFETY: obj 是刚构造的合法 slab 头部
            unsafe {
                let free = (*obj).free_count;
                link_slab(&mut pool, obj);
                pool.total_free += free;
            }
        }
        info!("slab heap bootstrapped: {} pools", SLAB_CLASS_COUNT);
        Ok(())
    }

    /// 挂接帧分配器，使堆可以扩容和归还帧
    pub fn attach_frames(&self, frames: Arc<FrameTable>) {
        if self.frames.set(Box::new(frames)).is_err() {
            warn!("attach_frames: frame table already attached");
        }
    }

    /// 通用内存分配。
    ///
    /// `size` 向上取整到尺寸类；超过最大尺寸类（1MB）返回
    /// [`MmError::InvalidArgument`]。`zero` 为真时清零返回的对象。
    /// 返回对象的对齐等于其尺寸类（槽位从 2MB 对齐的基址按类大小
    /// 排布）。
    pub fn allocate(&self, size: usize, zero: bool) -> MmResult<NonNull<u8>> {
        if size == 0 || size > SLAB_MAX_ALLOC {
            warn!("allocate: invalid size {size}");
            return Err(MmError::InvalidArgument);
        }
        let index = class_index(size);

        loop {
            {
                let mut pool = self.pools[index].lock();
                if pool.total_free > 0 {
                    // SAFETY: 持有池锁
                    if let Some(ptr) = unsafe { pool_take_slot(&mut pool) } {
                        drop(pool);
                        if zero {
                            // SAFETY: ptr 指向一个至少 size 字节的独占槽位
                            unsafe { ptr::write_bytes(ptr, 0, size) };
                        }
                        return Ok(NonNull::new(ptr).ok_or(MmError::OutOfMemory)?);
                    }
                }
            }
            // 池中无空闲对象：在锁外扩容后重试
            self.grow(index)?;
        }
    }

    /// 通用内存释放。
    ///
    /// 按 2MB 对齐指针定位所属 slab；地址不属于任何 slab 时返回
    /// [`MmError::NotFound`]。
    pub fn free(&self, ptr: NonNull<u8>) -> MmResult<()> {
        let addr = ptr.as_ptr() as usize;
        let page_base = addr & PAGE_2M_MASK;

        for i in 0..SLAB_CLASS_COUNT {
            let mut pool = self.pools[i].lock();
            // SAFETY: 持有池锁
            let Some(obj_ptr) = (unsafe { find_slab(&pool, page_base) }) else {
                continue;
            };
            // SAFETY: obj_ptr 来自本池链表，持锁期间独占
            let obj = unsafe { &mut *obj_ptr };

            let idx = (addr - obj.vaddr) / pool.size;
            if obj.vaddr + idx * pool.size != addr || idx >= obj.capacity {
                warn!("free: address {addr:#x} is not a slot boundary");
                return Err(MmError::InvalidArgument);
            }
            // SAFETY: idx < capacity <= bmp_words * 64
            let word = unsafe { *obj.bmp.add(idx >> 6) };
            if word & (1u64 << (idx & 63)) == 0 {
                warn!("free: double free at {addr:#x}");
                return Err(MmError::InvalidArgument);
            }
            unsafe { *obj.bmp.add(idx >> 6) = word & !(1u64 << (idx & 63)) };
            obj.free_count += 1;
            pool.total_free += 1;
            pool.total_using -= 1;

            // 完全空闲的非自举 slab，且池中空闲总量至少是它容量的
            // 两倍：整体释放以减轻内存压力
            let mut pending = None;
            if obj.free_count == obj.capacity
                && !obj.bootstrap
                && pool.total_free >= obj.capacity * 2
            {
                // SAFETY: 持有池锁
                unsafe { unlink_slab(&mut pool, obj_ptr) };
                pool.total_free -= obj.capacity;
                pending = Some(PendingRelease {
                    paddr: obj.paddr,
                    external: obj.external,
                    header: obj_ptr,
                    bmp: obj.bmp,
                });
            }
            drop(pool);

            if let Some(info) = pending {
                self.release_slab(info);
            }
            return Ok(());
        }

        warn!("free: address {addr:#x} not owned by any slab");
        Err(MmError::NotFound)
    }

    /// 堆缓存中已使用的字节数
    pub fn cache_used_bytes(&self) -> usize {
        self.pools
            .iter()
            .map(|p| {
                let pool = p.lock();
                pool.total_using * pool.size
            })
            .sum()
    }

    /// 堆缓存中空闲的字节数
    pub fn cache_free_bytes(&self) -> usize {
        self.pools
            .iter()
            .map(|p| {
                let pool = p.lock();
                pool.total_free * pool.size
            })
            .sum()
    }

    /// 为指定尺寸类扩容一个 slab（在池锁外进行）
    fn grow(&self, index: usize) -> MmResult<()> {
        let frames = self.frames.get().ok_or(MmError::OutOfMemory)?;
        let size = class_size(index);

        let range = frames.allocate(ZoneSelect::Normal, 1, PageAttr::KERNEL)?;
        let paddr = range.start().start_addr();
        let page_va = arch_ops().paddr_to_vaddr(paddr.as_usize());

        let obj = if size <= EMBED_LIMIT {
            // SAFETY: 新分配的帧可写且独占
            unsafe { carve_embedded(page_va, paddr.as_usize(), size, false) }
        } else {
            match self.carve_external(page_va, paddr.as_usize(), size) {
                Ok(obj) => obj,
                Err(err) => {
                    let _ = frames.page_clean(range.start());
                    let _ = frames.free(range);
                    return Err(err);
                }
            }
        };

        let mut pool = self.pools[index].lock();
        // SAFETY: obj 是刚构造的合法 slab 头部
        unsafe {
            let free = (*obj).free_count;
            link_slab(&mut pool, obj);
            pool.total_free += free;
        }
        Ok(())
    }

    /// 为大尺寸类构造 slab：头部与位图从小尺寸类的池里分配
    fn carve_external(&self, page_va: usize, paddr: usize, size: usize) -> MmResult<*mut SlabObj> {
        let capacity = PAGE_2M_SIZE / size;
        let bmp_words = capacity.div_ceil(64);

        let header = self.allocate(size_of::<SlabObj>(), false)?.as_ptr() as *mut SlabObj;
        let bmp = match self.allocate(bmp_words * 8, true) {
            Ok(p) => p.as_ptr() as *mut u64,
            Err(err) => {
                // SAFETY: header 是刚从本堆分配的
                let _ = self.free(unsafe { NonNull::new_unchecked(header as *mut u8) });
                return Err(err);
            }
        };

        // 容量之外的尾部 bit 置 1，扫描时不会越界命中
        for idx in capacity..bmp_words * 64 {
            // SAFETY: idx / 64 < bmp_words
            unsafe { *bmp.add(idx >> 6) |= 1u64 << (idx & 63) };
        }

        // SAFETY: header 指向一块足够容纳 SlabObj 的独占内存
        unsafe {
            ptr::write(
                header,
                SlabObj {
                    prev: null_mut(),
                    next: null_mut(),
                    vaddr: page_va,
                    paddr,
                    capacity,
                    free_count: capacity,
                    bmp,
                    bmp_words,
                    external: true,
                    bootstrap: false,
                },
            );
        }
        Ok(header)
    }

    /// 归还一个已完全空闲的 slab
    fn release_slab(&self, info: PendingRelease) {
        match self.frames.get() {
            Some(frames) => {
                let f = FrameNum::from_addr_floor(Paddr::from_usize(info.paddr));
                if frames.page_clean(f).is_err() {
                    warn!("release_slab: page_clean failed for frame {f:?}");
                }
                if frames.free(FrameRange::from_start_len(f, 1)).is_err() {
                    warn!("release_slab: frame {f:?} double free");
                }
            }
            None => warn!("release_slab: no frame table attached"),
        }
        if info.external {
            // 外置元数据归还到各自的尺寸类；嵌入式元数据随帧一起消失
            // SAFETY: 两个指针都是当初从本堆分配的
            unsafe {
                let _ = self.free(NonNull::new_unchecked(info.bmp as *mut u8));
                let _ = self.free(NonNull::new_unchecked(info.header as *mut u8));
            }
        }
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl TableAlloc for KernelHeap {
    fn alloc_table(&self) -> MmResult<Paddr> {
        // 4KB 尺寸类的槽位天然按 4KB 对齐
        let ptr = self.allocate(PAGE_4K_SIZE, true)?;
        // SAFETY: slab 对象位于线性映射区域
        let paddr = unsafe { arch_ops().vaddr_to_paddr(ptr.as_ptr() as usize) };
        Ok(Paddr::from_usize(paddr))
    }

    fn free_table(&self, table: Paddr) {
        let va = arch_ops().paddr_to_vaddr(table.as_usize());
        if let Some(ptr) = NonNull::new(va as *mut u8) {
            if self.free(ptr).is_err() {
                warn!("free_table: {table:?} not owned by the heap");
            }
        }
    }

    fn release_frame(&self, frame: Paddr) {
        match self.frames.get() {
            Some(frames) => {
                let f = FrameNum::from_addr_floor(frame);
                if frames.page_clean(f).is_err() {
                    warn!("release_frame: {frame:?} is not a managed frame");
                    return;
                }
                if frames.free(FrameRange::from_start_len(f, 1)).is_err() {
                    warn!("release_frame: frame {f:?} double free");
                }
            }
            None => warn!("release_frame: no frame table attached"),
        }
    }
}

/// 在一个 2MB 页内切出嵌入式 slab：头部和位图位于页尾
///
/// # Safety
/// `page_va` 必须指向一块可写、独占的 2MB 页。
unsafe fn carve_embedded(page_va: usize, paddr: usize, size: usize, bootstrap: bool) -> *mut SlabObj {
    let bits = PAGE_2M_SIZE / size;
    let bmp_bytes = bits.div_ceil(64) * 8;
    let meta = size_of::<SlabObj>() + bmp_bytes;
    let header_addr = (page_va + PAGE_2M_SIZE - meta) & !0xf;
    let capacity = (header_addr - page_va) / size;
    let bmp_words = capacity.div_ceil(64);
    let bmp = (header_addr + size_of::<SlabObj>()) as *mut u64;

    // SAFETY: 元数据区位于页内，由上方算式保证不与槽位重叠
    unsafe {
        ptr::write_bytes(bmp as *mut u8, 0, bmp_words * 8);
        // 容量之外的尾部 bit 置 1
        for idx in capacity..bmp_words * 64 {
            *bmp.add(idx >> 6) |= 1u64 << (idx & 63);
        }
        let header = header_addr as *mut SlabObj;
        ptr::write(
            header,
            SlabObj {
                prev: null_mut(),
                next: null_mut(),
                vaddr: page_va,
                paddr,
                capacity,
                free_count: capacity,
                bmp,
                bmp_words,
                external: false,
                bootstrap,
            },
        );
        header
    }
}

/// 从池中取一个空闲槽位；调用者必须持有池锁
unsafe fn pool_take_slot(pool: &mut Pool) -> Option<*mut u8> {
    let head = pool.head;
    if head.is_null() {
        return None;
    }
    let mut cur = head;
    loop {
        // SAFETY: cur 来自池链表
        let obj = unsafe { &mut *cur };
        if obj.free_count > 0 {
            for w in 0..obj.bmp_words {
                // SAFETY: w < bmp_words
                let word = unsafe { *obj.bmp.add(w) };
                if word == u64::MAX {
                    continue;
                }
                let bit = (!word).trailing_zeros() as usize;
                let idx = (w << 6) + bit;
                // SAFETY: 尾部无效 bit 恒为 1，此处 idx < capacity
                unsafe { *obj.bmp.add(w) = word | (1u64 << bit) };
                obj.free_count -= 1;
                pool.total_free -= 1;
                pool.total_using += 1;
                return Some((obj.vaddr + idx * pool.size) as *mut u8);
            }
        }
        cur = obj.next;
        if cur == head {
            return None;
        }
    }
}

/// 按页基址查找所属 slab；调用者必须持有池锁
unsafe fn find_slab(pool: &Pool, page_base: usize) -> Option<*mut SlabObj> {
    let head = pool.head;
    if head.is_null() {
        return None;
    }
    let mut cur = head;
    loop {
        // SAFETY: cur 来自池链表
        if unsafe { (*cur).vaddr } == page_base {
            return Some(cur);
        }
        cur = unsafe { (*cur).next };
        if cur == head {
            return None;
        }
    }
}

/// 把 slab 接入环形链表；调用者必须持有池锁
unsafe fn link_slab(pool: &mut Pool, obj: *mut SlabObj) {
    // SAFETY: obj 合法且不在任何链表上
    unsafe {
        if pool.head.is_null() {
            (*obj).next = obj;
            (*obj).prev = obj;
            pool.head = obj;
        } else {
            let head = pool.head;
            let tail = (*head).prev;
            (*obj).next = head;
            (*obj).prev = tail;
            (*tail).next = obj;
            (*head).prev = obj;
        }
    }
}

/// 把 slab 摘出环形链表；调用者必须持有池锁
unsafe fn unlink_slab(pool: &mut Pool, obj: *mut SlabObj) {
    // SAFETY: obj 在本池链表上
    unsafe {
        if (*obj).next == obj {
            pool.head = null_mut();
        } else {
            let prev = (*obj).prev;
            let next = (*obj).next;
            (*prev).next = next;
            (*next).prev = prev;
            if pool.head == obj {
                pool.head = next;
            }
        }
    }
}
