//! 可观测性：进程级日志 sink 的初始化与收尾

use std::io::Write;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志 sink 句柄；drop 时 flush 标准输出
#[must_use]
pub struct LogGuard {
    _private: (),
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        let _ = std::io::stdout().flush();
    }
}

/// 默认 info，可通过 RUST_LOG 覆盖。重复调用不会替换已安装的 subscriber。
pub fn init() -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
    if installed.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
    LogGuard { _private: () }
}
