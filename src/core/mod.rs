//! 核心：错误分类与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{AgentError, ErrorCode, Result};
pub use shutdown::{
    ConnectionCleanup, IdentityReleaseCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
