//! 匿名映射记录（反向映射）
//!
//! 每个被至少一个区域映射的物理帧都有一条匿名映射记录，
//! 记录当前附着的所有区域，使一个帧能找到映射它的每个区域。
//!
//! ## 生命周期
//!
//! 记录在帧第一次获得映射时、于帧的小自旋锁保护下惰性创建；
//! 附着计数等于当前附着的区域数。最后一个区域解除附着时记录被
//! 标记为 `dying` 并退役：普通内存帧随之归还帧分配器，设备内存
//! 只销毁记录本身。
//!
//! ## 锁
//!
//! 附着表由**可睡眠**的互斥锁保护：附着 / 解除附着和"归零释放"
//! 序列都要遍历这张表，并发修改者之间需要互斥且允许阻塞。
//! 帧的小自旋锁与本锁从不嵌套持有（先拿帧锁取记录、放掉，
//! 再拿记录锁附着）。

use alloc::sync::Arc;
use alloc::vec::Vec;
use sync::{SleepLock, SleepLockGuard};

use crate::address::{FrameNum, Paddr};
use crate::memory_space::region::RegionId;

/// 匿名映射记录的后备存储
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonBacking {
    /// 普通物理内存帧（退役时归还帧分配器）
    Ram(FrameNum),
    /// 设备 MMIO 内存（退役时只销毁记录）
    Device(Paddr),
}

/// 附着表（由睡眠锁保护的部分）
#[derive(Debug)]
pub struct AnonInner {
    attached: Vec<RegionId>,
    dying: bool,
}

/// 匿名映射记录
#[derive(Debug)]
pub struct AnonRecord {
    backing: AnonBacking,
    inner: SleepLock<AnonInner>,
}

impl AnonRecord {
    /// 创建一条新的（尚无附着者的）记录
    pub fn new(backing: AnonBacking) -> Arc<Self> {
        Arc::new(AnonRecord {
            backing,
            inner: SleepLock::new(AnonInner {
                attached: Vec::new(),
                dying: false,
            }),
        })
    }

    /// 后备存储
    pub fn backing(&self) -> AnonBacking {
        self.backing
    }

    /// 把一个区域附着到记录上。
    ///
    /// 返回的 RAII 保护器在未提交时于 Drop 中自动解除附着，
    /// 保证映射流程的所有提前返回路径都能正确回退计数。
    /// 记录已进入退役流程时返回 None，调用者应重新获取记录。
    pub fn attach(record: &Arc<Self>, region: RegionId) -> Option<AnonAttachGuard> {
        let mut inner = record.inner.lock();
        if inner.dying {
            return None;
        }
        inner.attached.push(region);
        drop(inner);
        Some(AnonAttachGuard {
            record: Some(record.clone()),
            region,
        })
    }

    /// 锁住附着表
    pub fn lock(&self) -> AnonLockGuard<'_> {
        AnonLockGuard(self.inner.lock())
    }

    /// 当前附着的区域数（即引用计数）
    pub fn ref_count(&self) -> usize {
        self.inner.lock().attached.len()
    }

    /// 记录是否已进入退役流程
    pub fn is_dying(&self) -> bool {
        self.inner.lock().dying
    }

    /// 解除一个区域的附着；若附着表因此变空则标记退役并返回 true。
    pub fn detach(&self, region: RegionId) -> bool {
        self.lock().detach(region)
    }
}

/// 附着表的锁保护器
///
/// 解除附着与页表清理需要在同一次持锁中完成
/// （见 [`crate::memory_space::AddressSpace::unmap_region`]）。
pub struct AnonLockGuard<'a>(SleepLockGuard<'a, AnonInner>);

impl AnonLockGuard<'_> {
    /// 解除一个区域的附着；若附着表因此变空则标记退役并返回 true。
    pub fn detach(&mut self, region: RegionId) -> bool {
        if let Some(pos) = self.0.attached.iter().position(|&r| r == region) {
            self.0.attached.swap_remove(pos);
        }
        if self.0.attached.is_empty() && !self.0.dying {
            self.0.dying = true;
            true
        } else {
            false
        }
    }

    /// 当前附着的区域数
    pub fn attached(&self) -> usize {
        self.0.attached.len()
    }
}

/// 附着操作的 RAII 保护器
///
/// 调用 [`AnonAttachGuard::commit`] 之前，Drop 会自动解除附着。
pub struct AnonAttachGuard {
    record: Option<Arc<AnonRecord>>,
    region: RegionId,
}

impl AnonAttachGuard {
    /// 确认附着成功，返回记录引用供区域保存
    pub fn commit(mut self) -> Arc<AnonRecord> {
        self.record.take().expect("attach guard committed twice")
    }
}

impl Drop for AnonAttachGuard {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            record.detach(self.region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::register_mocks;

    #[test]
    fn test_attach_detach_counts() {
        register_mocks();
        let record = AnonRecord::new(AnonBacking::Ram(FrameNum(7)));

        let g1 = AnonRecord::attach(&record, 1).unwrap();
        let g2 = AnonRecord::attach(&record, 2).unwrap();
        assert_eq!(record.ref_count(), 2);

        let _r1 = g1.commit();
        let _r2 = g2.commit();
        assert!(!record.detach(1));
        assert_eq!(record.ref_count(), 1);
        assert!(record.detach(2));
        assert!(record.is_dying());
    }

    #[test]
    fn test_uncommitted_guard_rolls_back() {
        register_mocks();
        let record = AnonRecord::new(AnonBacking::Ram(FrameNum(7)));
        {
            let _guard = AnonRecord::attach(&record, 9).unwrap();
            assert_eq!(record.ref_count(), 1);
            // 提前返回路径：guard 未提交即被 Drop
        }
        assert_eq!(record.ref_count(), 0);
        assert!(record.is_dying());
    }

    #[test]
    fn test_attach_refused_while_dying() {
        register_mocks();
        let record = AnonRecord::new(AnonBacking::Device(Paddr(0xfee0_0000)));
        let g = AnonRecord::attach(&record, 1).unwrap();
        let _r = g.commit();
        assert!(record.detach(1));
        // 已进入退役流程的记录拒绝新的附着
        assert!(AnonRecord::attach(&record, 2).is_none());
    }
}
