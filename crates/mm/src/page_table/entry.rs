//! 页表项定义
//!
//! 页表项是一个 64 位值：高位部分是下一级页表或页帧的物理地址，
//! 低位与第 63 位是标志位。

use bitflags::bitflags;

use crate::address::{Paddr, UsizeConvert};

/// 页表项中物理地址所占的位
const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    /// 页表项标志位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        /// 存在位
        const PRESENT = 1 << 0;
        /// 可写位
        const WRITABLE = 1 << 1;
        /// 用户态可访问
        const USER = 1 << 2;
        /// 页面写穿
        const WRITE_THROUGH = 1 << 3;
        /// 禁止缓存
        const NO_CACHE = 1 << 4;
        /// 已访问
        const ACCESSED = 1 << 5;
        /// 脏页
        const DIRTY = 1 << 6;
        /// 大页（在倒数第二级页表项中表示 2MB 叶）
        const HUGE = 1 << 7;
        /// 全局页
        const GLOBAL = 1 << 8;
        /// 禁止执行
        const NO_EXECUTE = 1 << 63;
    }
}

impl EntryFlags {
    /// 指向下一级页表的内核页表项标志
    pub fn kernel_table() -> Self {
        Self::PRESENT | Self::WRITABLE
    }

    /// 指向下一级页表的用户页表项标志
    pub fn user_table() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::USER
    }

    /// 内核 2MB 大页叶标志
    pub fn kernel_page_2m() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::HUGE
    }

    /// 用户 2MB 大页叶标志
    pub fn user_page_2m() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::USER | Self::HUGE
    }

    /// 内核 4KB 页叶标志
    pub fn kernel_page_4k() -> Self {
        Self::PRESENT | Self::WRITABLE
    }

    /// 用户 4KB 页叶标志
    pub fn user_page_4k() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::USER
    }

    /// 设备内存叶标志（写穿、禁止缓存）
    pub fn device() -> Self {
        Self::WRITE_THROUGH | Self::NO_CACHE
    }
}

/// 页表项
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct PageEntry(u64);

impl PageEntry {
    /// 空页表项
    pub const fn empty() -> Self {
        PageEntry(0)
    }

    /// 由物理地址和标志构造页表项
    pub fn new(paddr: Paddr, flags: EntryFlags) -> Self {
        PageEntry((paddr.as_usize() as u64 & ENTRY_ADDR_MASK) | flags.bits())
    }

    /// 页表项是否为空
    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// 页表项中的物理地址
    pub fn addr(&self) -> Paddr {
        Paddr::from_usize((self.0 & ENTRY_ADDR_MASK) as usize)
    }

    /// 页表项中的标志位
    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// 写入页表项
    pub fn set(&mut self, paddr: Paddr, flags: EntryFlags) {
        *self = Self::new(paddr, flags);
    }

    /// 清空页表项
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// 原始 64 位值
    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_round_trip() {
        let e = PageEntry::new(
            Paddr::from_usize(0x20_0000),
            EntryFlags::kernel_page_2m(),
        );
        assert_eq!(e.addr().as_usize(), 0x20_0000);
        assert!(e.flags().contains(EntryFlags::PRESENT | EntryFlags::HUGE));
        assert!(!e.flags().contains(EntryFlags::USER));
    }

    #[test]
    fn test_entry_addr_masks_flags() {
        // 标志位不应污染地址，地址也不应污染标志位
        let e = PageEntry::new(Paddr::from_usize(0x1234_5000), EntryFlags::NO_EXECUTE);
        assert_eq!(e.addr().as_usize(), 0x1234_5000);
        assert_eq!(e.flags(), EntryFlags::NO_EXECUTE);
    }
}
