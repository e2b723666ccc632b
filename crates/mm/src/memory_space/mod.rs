//! 内存空间模块
//!
//! 定义地址空间（有序区域表 + 页表根 + 段布局标记）、虚拟内存区域
//! 以及把物理帧连回区域的反向映射（匿名映射记录）。

pub mod anon;
mod region;
mod space;

pub use anon::{AnonBacking, AnonRecord};
pub use region::{InsertOutcome, Region, RegionId, RegionOps, VmFlags};
pub use space::{AddressSpace, SegmentLayout};
