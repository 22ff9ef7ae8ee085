//! 进程探测：判断 pid 是否存活并取其启动时间
//!
//! (pid, 启动时间) 组成进程指纹；同一数值的 pid 被系统复用给新进程时启动时间不同，据此识别。

use sysinfo::{Pid, ProcessStatus, System};

/// 进程指纹来源
pub trait ProcessProbe: Send + Sync {
    /// 进程启动时间（Unix 秒）；进程不存在或已成僵尸时返回 None
    fn start_time(&self, pid: u32) -> Option<u64>;

    fn is_alive(&self, pid: u32) -> bool {
        self.start_time(pid).is_some()
    }
}

/// 基于 sysinfo 的系统探测
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn start_time(&self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return None;
        }
        system
            .process(pid)
            .filter(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .map(|p| p.start_time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let probe = SystemProbe;
        let pid = std::process::id();
        let first = probe.start_time(pid).expect("current process must be visible");
        assert_eq!(probe.start_time(pid), Some(first));
        assert!(probe.is_alive(pid));
    }

    #[test]
    fn test_unused_pid_is_not_alive() {
        // 超出 Linux pid_max 上限
        assert!(!SystemProbe.is_alive(u32::MAX - 1));
    }
}
