//! TLB 失效协议
//!
//! 页表结构性修改之后需要使翻译缓存失效。本地 CPU 直接刷新；
//! 其它 CPU 通过"广播 + 应答"协议同步：发起方广播 flush IPI，
//! 然后自旋等待每个远端 CPU 在其 IPI 处理函数中完成本地刷新并调用
//! [`acknowledge`]。
//!
//! # 使用约束
//!
//! 发起方在等待应答期间必须保持本地中断可被递交（不能在持有关中断的
//! 自旋锁时调用 [`flush_all`]），否则两个同时发起刷新的 CPU 会互相
//! 等待对方的应答而死锁。单 CPU 配置下协议短路为一次本地刷新。

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch_ops;

/// 正在进行的 shootdown 的未应答 CPU 数
static PENDING_ACKS: AtomicUsize = AtomicUsize::new(0);
/// 同一时刻只允许一个发起方
static IN_PROGRESS: AtomicBool = AtomicBool::new(false);

/// 刷新所有 CPU 的全部 TLB 条目。
///
/// 先刷新本地，再向其它 CPU 广播并等待应答。
pub fn flush_all() {
    let ops = arch_ops();
    ops.tlb_flush_local();

    let others = ops.num_cpus().saturating_sub(1);
    if others == 0 {
        return;
    }

    // 串行化发起方
    while IN_PROGRESS.swap(true, Ordering::Acquire) {
        core::hint::spin_loop();
    }

    PENDING_ACKS.store(others, Ordering::Release);
    ops.send_tlb_flush_ipi_all();

    while PENDING_ACKS.load(Ordering::Acquire) != 0 {
        core::hint::spin_loop();
    }

    IN_PROGRESS.store(false, Ordering::Release);
}

/// 远端 CPU 在 flush IPI 处理函数中完成本地刷新后调用，向发起方应答。
pub fn acknowledge() {
    // 多余的应答（例如协议之外的杂散 IPI）直接忽略
    let _ = PENDING_ACKS.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        if v == 0 { None } else { Some(v - 1) }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::register_mocks;

    #[test]
    fn test_flush_all_single_cpu_short_circuits() {
        register_mocks();
        // Mock 拓扑只有一个 CPU，flush_all 必须立即返回
        flush_all();
        assert_eq!(PENDING_ACKS.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_acknowledge_without_shootdown_is_ignored() {
        register_mocks();
        acknowledge();
        assert_eq!(PENDING_ACKS.load(Ordering::Relaxed), 0);
    }
}
