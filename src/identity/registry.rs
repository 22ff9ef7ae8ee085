//! 锁注册表：同一主机上所有 worker 共享的持久化记录
//!
//! 一切读写都在 `transact` 中完成：
//! - 对旁路文件 `<registry>.lock` 加排他 flock，覆盖整个读-过滤-写过程
//! - 写入先落到同目录临时文件并 fsync，再原子 rename 覆盖，最后 fsync 目录
//! - 注册表缺失、为空或损坏时按空表处理，下一次修改时覆盖

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{AgentError, Result};

/// 单条锁记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub profile: String,
    pub pid: u32,
    /// 进程启动时间（Unix 秒）
    pub start_time_fingerprint: u64,
    /// 加锁时间（ISO-8601）
    pub locked_at: String,
}

/// 注册表文件内容：pid → 记录
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub records: BTreeMap<u32, LockRecord>,
}

/// 持久化锁注册表
#[derive(Debug, Clone)]
pub struct LockRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl LockRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    /// 默认位置：~/.oblivion/profile-locks.json
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".oblivion")
            .join("profile-locks.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在跨进程排他锁内对注册表做一次读-改-写；内容未变化时不写盘
    pub fn transact<R>(&self, f: impl FnOnce(&mut RegistryDocument) -> R) -> Result<R> {
        let dir = self.dir();
        create_dir_restricted(&dir)?;
        let _guard = FileLock::exclusive(&self.lock_path)?;

        let mut doc = self.read_document()?;
        let before = doc.clone();
        let result = f(&mut doc);
        if doc != before {
            self.write_document(&dir, &doc)?;
        }
        Ok(result)
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn read_document(&self) -> Result<RegistryDocument> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RegistryDocument::default()),
            Err(e) => {
                return Err(AgentError::Io(format!(
                    "reading {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(RegistryDocument::default());
        }
        match serde_json::from_slice(&bytes) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                tracing::warn!(
                    "Lock registry {} is corrupt ({}); treating as empty",
                    self.path.display(),
                    e
                );
                Ok(RegistryDocument::default())
            }
        }
    }

    fn write_document(&self, dir: &Path, doc: &RegistryDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let io_err = |what: &str, e: io::Error| AgentError::Io(format!("{} {}: {}", what, self.path.display(), e));

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err("creating temp file for", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(|e| io_err("restricting", e))?;
        }
        temp.write_all(&bytes).map_err(|e| io_err("writing", e))?;
        temp.as_file().sync_all().map_err(|e| io_err("syncing", e))?;
        temp.persist(&self.path)
            .map_err(|e| io_err("replacing", e.error))?;

        #[cfg(unix)]
        {
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }
}

/// 目录权限 0700（仅属主可访问）
///
/// 已存在的目录若归当前用户所有则收紧权限；共享目录（sticky 位，如 /tmp）或他人所有的目录只告警。
fn create_dir_restricted(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .map_err(|e| AgentError::Io(format!("creating {}: {}", dir.display(), e)))?;
    }
    #[cfg(unix)]
    restrict_dir_mode(dir);
    Ok(())
}

#[cfg(unix)]
fn restrict_dir_mode(dir: &Path) {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let meta = match fs::metadata(dir) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Failed to stat {}: {}", dir.display(), e);
            return;
        }
    };
    let mode = meta.permissions().mode();
    if mode & 0o077 == 0 {
        return;
    }
    // SAFETY: geteuid 无副作用且总是成功
    let owned = meta.uid() == unsafe { libc::geteuid() };
    if owned && mode & 0o1000 == 0 {
        match fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
            Ok(()) => tracing::debug!("Restricted {} to 0700 (was {:o})", dir.display(), mode & 0o777),
            Err(e) => tracing::warn!("Failed to restrict {}: {}", dir.display(), e),
        }
    } else {
        tracing::warn!(
            "Registry directory {} is accessible by other users (mode {:o})",
            dir.display(),
            mode & 0o777
        );
    }
}

/// 持有期间对锁文件加排他 flock；drop 时关闭文件即释放
struct FileLock {
    _file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| AgentError::Io(format!("opening lock file {}: {}", path.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            use std::os::unix::io::AsRawFd;

            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
                tracing::warn!("Failed to restrict lock file {}: {}", path.display(), e);
            }
            let fd = file.as_raw_fd();
            loop {
                // SAFETY: fd 由 file 持有且在调用期间有效；LOCK_EX 阻塞直到获得排他锁
                let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
                if rc == 0 {
                    break;
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(AgentError::Io(format!("locking {}: {}", path.display(), err)));
                }
            }
        }

        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(profile: &str, pid: u32) -> LockRecord {
        LockRecord {
            profile: profile.into(),
            pid,
            start_time_fingerprint: 42,
            locked_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_transact_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LockRegistry::new(dir.path().join("locks.json"));

        registry
            .transact(|doc| {
                doc.records.insert(10, record("alpha", 10));
            })
            .unwrap();
        let records = registry.transact(|doc| doc.records.clone()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[&10].profile, "alpha");

        let raw = fs::read_to_string(registry.path()).unwrap();
        assert!(raw.contains("startTimeFingerprint"));
    }

    #[test]
    fn test_missing_and_corrupt_registry_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("locks.json");
        let registry = LockRegistry::new(&path);
        assert!(registry.transact(|doc| doc.records.is_empty()).unwrap());

        fs::write(&path, b"{ not json").unwrap();
        assert!(registry.transact(|doc| doc.records.is_empty()).unwrap());
    }

    #[test]
    fn test_unchanged_document_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LockRegistry::new(dir.path().join("locks.json"));
        registry.transact(|_| ()).unwrap();
        assert!(!registry.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_registry_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let registry = LockRegistry::new(dir.path().join("locks.json"));
        registry
            .transact(|doc| {
                doc.records.insert(1, record("a", 1));
            })
            .unwrap();
        let mode = fs::metadata(registry.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_open_directory_is_tightened() {
        use std::os::unix::fs::PermissionsExt;
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(".oblivion");
        fs::create_dir(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();

        let registry = LockRegistry::new(dir.join("locks.json"));
        registry.transact(|_| ()).unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_lock_path_is_sibling() {
        let registry = LockRegistry::new("/tmp/x/locks.json");
        assert_eq!(registry.lock_path, PathBuf::from("/tmp/x/locks.json.lock"));
    }
}
