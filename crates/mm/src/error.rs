//! 内存管理错误类型
//!
//! 所有可失败的操作都把错误返回给直接调用者，不做静默重试，
//! 也不允许因为分配失败而停机。

/// 内存管理操作中可能发生的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// 内存耗尽（没有空闲帧 / slab 槽位 / 符合大小的伙伴块）
    OutOfMemory,
    /// 参数无效（地址未对齐、长度为零、超出最大尺寸类等）
    InvalidArgument,
    /// 目标虚拟地址已存在映射
    AlreadyMapped,
    /// 插入的区域与现有区域冲突（或已存在完全相同的区域）
    RegionExists,
    /// 地址不属于任何受管对象（区域 / slab / 帧）
    NotFound,
    /// 地址越过了分配器管理的外边界
    Unsupported,
}

/// 内存管理操作的结果类型
pub type MmResult<T> = Result<T, MmError>;
