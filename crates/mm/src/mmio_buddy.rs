//! MMIO 虚拟地址窗口的伙伴分配器
//!
//! 设备寄存器需要内核虚拟地址区间来建立映射。本模块把配置的 MMIO
//! 窗口交给一个经典伙伴分配器管理：按 2 的幂组织空闲块链表
//! （4KB 到 1GB），申请时弹出或逐级分裂，释放时与伙伴块逐级合并。
//!
//! 整个空闲链表数组由一把粗粒度自旋锁保护。

use alloc::vec::Vec;
use log::{debug, warn};
use sync::SpinLock;

use crate::address::{UsizeConvert, Vaddr};
use crate::config::{PAGE_1G_SHIFT, PAGE_4K_SHIFT};
use crate::error::{MmError, MmResult};

/// 最小伙伴块的幂（4KB）
pub const MMIO_BUDDY_MIN_EXP: u32 = PAGE_4K_SHIFT as u32;
/// 最大伙伴块的幂（1GB）
pub const MMIO_BUDDY_MAX_EXP: u32 = PAGE_1G_SHIFT as u32;
/// 空闲链表数组的长度
const MMIO_BUDDY_REGION_COUNT: usize = (MMIO_BUDDY_MAX_EXP - MMIO_BUDDY_MIN_EXP + 1) as usize;

#[inline]
fn exp2index(exp: u32) -> usize {
    (exp - MMIO_BUDDY_MIN_EXP) as usize
}

/// 按幂索引的空闲块链表数组
struct FreeLists {
    lists: [Vec<usize>; MMIO_BUDDY_REGION_COUNT],
}

/// MMIO 地址窗口的伙伴内存池
pub struct MmioPool {
    pool_start: Vaddr,
    pool_size: usize,
    free: SpinLock<FreeLists>,
}

impl MmioPool {
    /// 在 `[base, base + size)` 上创建伙伴内存池。
    ///
    /// 初始填充：从高幂到低幂，按 `size` 的二进制位贪心铺满窗口。
    /// `base` 必须按其中最大的块对齐。
    pub fn new(base: Vaddr, size: usize) -> MmResult<Self> {
        if size == 0 || size & ((1 << MMIO_BUDDY_MIN_EXP) - 1) != 0 {
            return Err(MmError::InvalidArgument);
        }

        let pool = MmioPool {
            pool_start: base,
            pool_size: size,
            free: SpinLock::new(FreeLists {
                lists: core::array::from_fn(|_| Vec::new()),
            }),
        };

        let mut cursor = base.as_usize();
        let mut remain = size;
        for exp in (MMIO_BUDDY_MIN_EXP..=MMIO_BUDDY_MAX_EXP).rev() {
            let block = 1usize << exp;
            while remain >= block && cursor & (block - 1) == 0 {
                pool.give_back(Vaddr::from_usize(cursor), exp)?;
                cursor += block;
                remain -= block;
            }
        }
        if remain != 0 {
            // 窗口基址没有按块对齐，无法完整铺满
            return Err(MmError::InvalidArgument);
        }

        debug!("mmio pool: {base:?} + {size:#x} bytes");
        Ok(pool)
    }

    /// 窗口起始地址
    pub fn base(&self) -> Vaddr {
        self.pool_start
    }

    /// 窗口大小（字节）
    pub fn size(&self) -> usize {
        self.pool_size
    }

    /// 把申请大小归一化为伙伴块的幂
    ///
    /// 不足一个小页按一个小页计；超过窗口大小返回
    /// [`MmError::InvalidArgument`]。
    pub fn size_to_exp(&self, size: usize) -> MmResult<u32> {
        if size == 0 {
            return Err(MmError::InvalidArgument);
        }
        let size = size
            .max(1 << MMIO_BUDDY_MIN_EXP)
            .next_power_of_two();
        let exp = size.trailing_zeros();
        if exp > MMIO_BUDDY_MAX_EXP || size > self.pool_size {
            return Err(MmError::InvalidArgument);
        }
        Ok(exp)
    }

    /// 申请一块 MMIO 虚拟地址区间。
    ///
    /// `size` 向上取整到 2 的幂；返回的地址按实际块大小自然对齐。
    /// 没有足够大的空闲块时返回 [`MmError::OutOfMemory`]。
    pub fn reserve(&self, size: usize) -> MmResult<(Vaddr, usize)> {
        let exp = self.size_to_exp(size)?;
        let addr = self.pop_block(exp)?;
        Ok((addr, 1usize << exp))
    }

    /// 归还一块此前由 [`MmioPool::reserve`] 返回的区间。
    ///
    /// 与空闲的伙伴块逐级合并后再挂回链表。
    pub fn release(&self, vaddr: Vaddr, exp: u32) -> MmResult<()> {
        if !(MMIO_BUDDY_MIN_EXP..=MMIO_BUDDY_MAX_EXP).contains(&exp) {
            return Err(MmError::InvalidArgument);
        }
        let offset = vaddr.as_usize().wrapping_sub(self.pool_start.as_usize());
        if offset >= self.pool_size || offset & ((1usize << exp) - 1) != 0 {
            warn!("mmio release: {vaddr:?} is not a block of exp {exp}");
            return Err(MmError::InvalidArgument);
        }

        let mut free = self.free.lock();
        let mut addr = vaddr.as_usize();
        let mut exp = exp;
        // 伙伴块也空闲则合并，直到伙伴缺席或到达最大块
        while exp < MMIO_BUDDY_MAX_EXP {
            let rel = addr - self.pool_start.as_usize();
            let buddy = self.pool_start.as_usize() + (rel ^ (1usize << exp));
            let list = &mut free.lists[exp2index(exp)];
            match list.iter().position(|&a| a == buddy) {
                Some(pos) => {
                    list.swap_remove(pos);
                    addr = addr.min(buddy);
                    exp += 1;
                }
                None => break,
            }
        }
        free.lists[exp2index(exp)].push(addr);
        Ok(())
    }

    /// 弹出一个 `2^exp` 的空闲块；没有就分裂更大的块
    fn pop_block(&self, exp: u32) -> MmResult<Vaddr> {
        let mut free = self.free.lock();

        if let Some(addr) = free.lists[exp2index(exp)].pop() {
            return Ok(Vaddr::from_usize(addr));
        }

        // 找最小的、能满足要求的更大块，一路对半分裂下来
        for higher in exp + 1..=MMIO_BUDDY_MAX_EXP {
            if free.lists[exp2index(higher)].is_empty() {
                continue;
            }
            let addr = free.lists[exp2index(higher)].pop().unwrap();
            let mut cur = higher;
            while cur > exp {
                cur -= 1;
                // 低半块继续分裂，高半块挂回链表
                free.lists[exp2index(cur)].push(addr + (1usize << cur));
            }
            return Ok(Vaddr::from_usize(addr));
        }

        Err(MmError::OutOfMemory)
    }

    /// 初始填充用的归还（不做伙伴合并）
    fn give_back(&self, vaddr: Vaddr, exp: u32) -> MmResult<()> {
        if vaddr.as_usize() & ((1usize << exp) - 1) != 0 {
            return Err(MmError::InvalidArgument);
        }
        self.free.lock().lists[exp2index(exp)].push(vaddr.as_usize());
        Ok(())
    }

    /// 当前空闲字节总数（诊断用）
    pub fn free_bytes(&self) -> usize {
        let free = self.free.lock();
        free.lists
            .iter()
            .enumerate()
            .map(|(i, list)| list.len() << (MMIO_BUDDY_MIN_EXP as usize + i))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PAGE_1G_SIZE, PAGE_4K_SIZE};
    use crate::test_util::register_mocks;

    const BASE: usize = 0xffff_a100_0000_0000;

    #[test]
    fn test_reserve_rounds_up_and_aligns() {
        register_mocks();
        let pool = MmioPool::new(Vaddr::from_usize(BASE), PAGE_1G_SIZE).unwrap();

        let (addr, size) = pool.reserve(PAGE_4K_SIZE + 1).unwrap();
        assert_eq!(size, 2 * PAGE_4K_SIZE);
        assert_eq!(addr.as_usize() % size, 0);

        let (addr, size) = pool.reserve(1).unwrap();
        assert_eq!(size, PAGE_4K_SIZE);
        assert_eq!(addr.as_usize() % size, 0);
    }

    #[test]
    fn test_release_coalesces_back_to_full_pool() {
        register_mocks();
        let pool = MmioPool::new(Vaddr::from_usize(BASE), PAGE_1G_SIZE).unwrap();
        assert_eq!(pool.free_bytes(), PAGE_1G_SIZE);

        let (a, sz_a) = pool.reserve(PAGE_4K_SIZE).unwrap();
        let (b, sz_b) = pool.reserve(PAGE_4K_SIZE).unwrap();
        assert_eq!(pool.free_bytes(), PAGE_1G_SIZE - sz_a - sz_b);

        pool.release(a, sz_a.trailing_zeros()).unwrap();
        pool.release(b, sz_b.trailing_zeros()).unwrap();
        // 伙伴合并必须把窗口恢复成一整个 1GB 块
        assert_eq!(pool.free_bytes(), PAGE_1G_SIZE);
        let (again, size) = pool.reserve(PAGE_1G_SIZE).unwrap();
        assert_eq!(again.as_usize(), BASE);
        assert_eq!(size, PAGE_1G_SIZE);
    }

    #[test]
    fn test_reserve_after_release_reuses_space() {
        register_mocks();
        let pool = MmioPool::new(Vaddr::from_usize(BASE), PAGE_1G_SIZE).unwrap();

        let (a, sz) = pool.reserve(1 << 20).unwrap();
        let before = pool.free_bytes();
        pool.release(a, sz.trailing_zeros()).unwrap();
        // 释放后同样大小的申请必须再次成功，且总量不变
        let (_b, sz2) = pool.reserve(1 << 20).unwrap();
        assert_eq!(sz2, sz);
        assert_eq!(pool.free_bytes(), before);
    }

    #[test]
    fn test_exhaustion_and_invalid_sizes() {
        register_mocks();
        let pool = MmioPool::new(Vaddr::from_usize(BASE), 4 * PAGE_4K_SIZE).unwrap();

        assert_eq!(pool.reserve(0), Err(MmError::InvalidArgument));
        assert_eq!(
            pool.reserve(8 * PAGE_4K_SIZE),
            Err(MmError::InvalidArgument)
        );

        let mut got = alloc::vec::Vec::new();
        for _ in 0..4 {
            got.push(pool.reserve(PAGE_4K_SIZE).unwrap());
        }
        assert_eq!(pool.reserve(PAGE_4K_SIZE), Err(MmError::OutOfMemory));
        for (addr, size) in got {
            pool.release(addr, size.trailing_zeros()).unwrap();
        }
        assert_eq!(pool.free_bytes(), 4 * PAGE_4K_SIZE);
    }

    #[test]
    fn test_release_rejects_misaligned_block() {
        register_mocks();
        let pool = MmioPool::new(Vaddr::from_usize(BASE), PAGE_1G_SIZE).unwrap();
        assert_eq!(
            pool.release(Vaddr::from_usize(BASE + 0x123), 12),
            Err(MmError::InvalidArgument)
        );
        assert_eq!(
            pool.release(Vaddr::from_usize(BASE + PAGE_1G_SIZE), 12),
            Err(MmError::InvalidArgument)
        );
    }
}
