//! 单元测试辅助：把 test-support 的 Mock 接到本 crate 的 trait 上。
//!
//! test-support 不直接依赖 sync（避免循环依赖），trait 的桥接实现
//! 放在这里的 `cfg(test)` 代码中完成。

use crate::ArchOps;
use std::sync::Once;
use test_support::mock::arch::MockArchOps;

impl ArchOps for MockArchOps {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        unsafe { MockArchOps::read_and_disable_interrupts(self) }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        unsafe { MockArchOps::restore_interrupts(self, flags) }
    }

    fn interrupt_flag_mask(&self) -> usize {
        MockArchOps::interrupt_flag_mask(self)
    }

    fn cpu_id(&self) -> usize {
        MockArchOps::cpu_id(self)
    }

    fn max_cpu_count(&self) -> usize {
        MockArchOps::max_cpu_count(self)
    }

    fn yield_now(&self) {
        MockArchOps::yield_now(self)
    }
}

static INIT: Once = Once::new();

/// 注册 Mock 架构操作（整个测试进程只注册一次）。
pub fn register_mocks() {
    INIT.call_once(|| unsafe {
        crate::register_arch_ops(&test_support::mock::arch::MOCK_ARCH_OPS);
    });
}
