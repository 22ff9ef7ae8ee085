//! 跨进程身份锁协调器
//!
//! 同一主机上独立启动的 worker 从共享的 profile 池中各自认领一个。
//! 所有操作都是注册表上的一次原子读-改-写，并在其中先清理失效记录：
//! pid 已不存在，或 pid 当前进程的启动时间与记录的指纹不符（pid 被复用）。

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Span;

use super::process::{ProcessProbe, SystemProbe};
use super::registry::{LockRecord, LockRegistry, RegistryDocument};
use crate::core::error::{AgentError, Result};
use crate::gateway::iso_now;

pub struct IdentityLockCoordinator {
    registry: LockRegistry,
    probe: Arc<dyn ProcessProbe>,
    span: Span,
}

impl IdentityLockCoordinator {
    pub fn new(registry: LockRegistry, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            registry,
            probe,
            span: tracing::info_span!("identity"),
        }
    }

    /// 使用系统进程探测
    pub fn with_system_probe(path: impl Into<PathBuf>) -> Self {
        Self::new(LockRegistry::new(path), Arc::new(SystemProbe))
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn registry_path(&self) -> &std::path::Path {
        self.registry.path()
    }

    /// 为 pid 认领第一个未被占用的候选 profile；全部被占用时返回 None，不写注册表。
    ///
    /// pid 已持有某个候选 profile 时直接返回它；持有的 profile 不在候选中时被新记录替换。
    pub fn acquire<S: AsRef<str>>(&self, pid: u32, candidates: &[S]) -> Result<Option<String>> {
        let _enter = self.span.enter();
        let fingerprint = self.probe.start_time(pid).ok_or_else(|| {
            AgentError::Config(format!("cannot fingerprint process {}: not running", pid))
        })?;
        let probe = self.probe.as_ref();

        let (claimed, purged) = self.registry.transact(|doc| {
            let purged = purge_stale(doc, probe);

            if let Some(own) = doc.records.get(&pid) {
                if candidates.iter().any(|c| AsRef::<str>::as_ref(c) == own.profile) {
                    return (Some(own.profile.clone()), purged);
                }
            }

            let held: Vec<&str> = doc
                .records
                .values()
                .filter(|r| r.pid != pid)
                .map(|r| r.profile.as_str())
                .collect();
            let free = candidates
                .iter()
                .map(|c| AsRef::<str>::as_ref(c))
                .find(|c| !held.contains(c))
                .map(str::to_string);

            if let Some(profile) = &free {
                doc.records.insert(
                    pid,
                    LockRecord {
                        profile: profile.clone(),
                        pid,
                        start_time_fingerprint: fingerprint,
                        locked_at: iso_now(),
                    },
                );
            }
            (free, purged)
        })?;

        log_purged(&purged);
        match &claimed {
            Some(profile) => tracing::info!(pid, profile = %profile, "Identity profile acquired"),
            None => tracing::warn!(pid, candidates = candidates.len(), "No identity profile available"),
        }
        Ok(claimed)
    }

    /// 删除 pid 的记录；重复释放或从未认领都是空操作。返回是否删除了记录。
    pub fn release(&self, pid: u32) -> Result<bool> {
        let _enter = self.span.enter();
        let removed = self.registry.transact(|doc| doc.records.remove(&pid))?;
        if let Some(record) = &removed {
            tracing::info!(pid, profile = %record.profile, "Identity profile released");
        }
        Ok(removed.is_some())
    }

    /// pid 当前持有的 profile；指纹不符时清除该记录并返回 None
    pub fn get_profile_for(&self, pid: u32) -> Result<Option<String>> {
        let _enter = self.span.enter();
        let actual = self.probe.start_time(pid);
        let (profile, purged) = self.registry.transact(|doc| match doc.records.get(&pid) {
            Some(record) if Some(record.start_time_fingerprint) == actual => {
                (Some(record.profile.clone()), None)
            }
            Some(_) => (None, doc.records.remove(&pid)),
            None => (None, None),
        })?;
        if let Some(record) = purged {
            log_purged(std::slice::from_ref(&record));
        }
        Ok(profile)
    }

    /// 清理所有失效记录，返回被清理的记录
    pub fn clean_stale(&self) -> Result<Vec<LockRecord>> {
        let _enter = self.span.enter();
        let probe = self.probe.as_ref();
        let purged = self.registry.transact(|doc| purge_stale(doc, probe))?;
        log_purged(&purged);
        Ok(purged)
    }

    /// 当前所有有效记录（读取时顺带清理失效记录）
    pub fn list_all(&self) -> Result<Vec<LockRecord>> {
        let _enter = self.span.enter();
        let probe = self.probe.as_ref();
        let (live, purged) = self.registry.transact(|doc| {
            let purged = purge_stale(doc, probe);
            (doc.records.values().cloned().collect::<Vec<_>>(), purged)
        })?;
        log_purged(&purged);
        Ok(live)
    }
}

fn is_stale(record: &LockRecord, probe: &dyn ProcessProbe) -> bool {
    probe.start_time(record.pid) != Some(record.start_time_fingerprint)
}

fn purge_stale(doc: &mut RegistryDocument, probe: &dyn ProcessProbe) -> Vec<LockRecord> {
    let stale: Vec<u32> = doc
        .records
        .values()
        .filter(|r| is_stale(r, probe))
        .map(|r| r.pid)
        .collect();
    stale
        .into_iter()
        .filter_map(|pid| doc.records.remove(&pid))
        .collect()
}

fn log_purged(purged: &[LockRecord]) {
    for record in purged {
        tracing::info!(
            pid = record.pid,
            profile = %record.profile,
            locked_at = %record.locked_at,
            "Purged stale identity lock"
        );
    }
}
