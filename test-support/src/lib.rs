//! 测试支持 crate
//!
//! 提供宿主机单元测试所需的 Mock 实现和测试工具。
//! 本 crate 不依赖工作区内的其它 crate（避免循环依赖）；
//! 各 crate 在自己的 `cfg(test)` 代码中为这些 Mock 类型桥接 trait 实现。

#![no_std]

pub mod mock;
