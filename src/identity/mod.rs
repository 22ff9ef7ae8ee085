//! 身份锁：多个 worker 进程从共享 profile 池中各自认领一个身份
//!
//! - **process**: 进程存活与启动时间指纹
//! - **registry**: 持久化注册表（文件锁 + 原子替换）
//! - **coordinator**: acquire / release / 失效清理

mod coordinator;
mod process;
mod registry;

pub use coordinator::IdentityLockCoordinator;
pub use process::{ProcessProbe, SystemProbe};
pub use registry::{LockRecord, LockRegistry, RegistryDocument};
