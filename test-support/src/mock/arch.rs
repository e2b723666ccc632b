//! 架构相关操作的 Mock 实现
//!
//! 注意：这里不直接依赖 `sync` crate（避免循环依赖）。
//! `sync` crate 在 `cfg(test)` 下为这些类型实现其 trait（例如 `ArchOps`）。

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// x86 RFLAGS 中断使能位（测试中用作统一的标志掩码）
pub const MOCK_INTR_FLAG: usize = 0x200;

/// Mock 架构操作
///
/// 用一个原子布尔值模拟单核的本地中断开关；让出 CPU 退化为自旋提示。
pub struct MockArchOps {
    pub interrupt_state: AtomicBool,
    pub cpu_id: AtomicUsize,
    pub max_cpus: AtomicUsize,
}

impl MockArchOps {
    pub const fn new() -> Self {
        Self {
            interrupt_state: AtomicBool::new(true),
            cpu_id: AtomicUsize::new(0),
            max_cpus: AtomicUsize::new(1),
        }
    }

    /// 读取并"禁用"中断，返回之前的标志位
    ///
    /// # Safety
    /// 仅用于测试环境，状态完全由本结构体模拟。
    pub unsafe fn read_and_disable_interrupts(&self) -> usize {
        if self.interrupt_state.swap(false, Ordering::SeqCst) {
            MOCK_INTR_FLAG
        } else {
            0
        }
    }

    /// 恢复中断状态
    ///
    /// # Safety
    /// flags 必须是之前 read_and_disable_interrupts 返回的值。
    pub unsafe fn restore_interrupts(&self, flags: usize) {
        self.interrupt_state
            .store(flags & MOCK_INTR_FLAG != 0, Ordering::SeqCst);
    }

    /// 中断使能位掩码
    pub fn interrupt_flag_mask(&self) -> usize {
        MOCK_INTR_FLAG
    }

    /// 当前 CPU ID（测试默认：0）
    pub fn cpu_id(&self) -> usize {
        self.cpu_id.load(Ordering::Relaxed)
    }

    /// 最大 CPU 数量（测试默认：1）
    pub fn max_cpu_count(&self) -> usize {
        self.max_cpus.load(Ordering::Relaxed)
    }

    /// 让出 CPU（测试默认：自旋提示）
    pub fn yield_now(&self) {
        core::hint::spin_loop();
    }
}

impl Default for MockArchOps {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局 Mock 实例
pub static MOCK_ARCH_OPS: MockArchOps = MockArchOps::new();
