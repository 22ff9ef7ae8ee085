//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `OBLIVION__*` 覆盖（双下划线表示嵌套，如 `OBLIVION__NEXUS__URL=https://nexus.local`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::api::RetryPolicy;
use crate::core::error::{AgentError, Result, DEFAULT_RETRYABLE_STATUSES};
use crate::gateway::ConnectionConfig;
use crate::identity::LockRegistry;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub nexus: NexusSection,
    pub api: ApiSection,
    pub connection: ConnectionSection,
    pub identity: IdentitySection,
}

/// [nexus] 段：编排服务地址与默认凭据（profile 未指定凭据时使用）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NexusSection {
    #[serde(default)]
    pub url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// [api] 段：请求超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub retryable_statuses: Vec<u16>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_ms: 1000,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

impl ApiSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.max_retries)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(Duration::from_millis(self.jitter_ms))
            .with_retryable_statuses(self.retryable_statuses.iter().copied())
    }
}

/// [connection] 段：持久连接与重连
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter_ms: u64,
    /// 连接超时守卫，与握手超时相互独立
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub path: String,
    pub capabilities: Vec<String>,
    pub version: String,
    /// 主动心跳间隔；0 表示只应答服务端 ping
    pub heartbeat_interval_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 30_000,
            reconnect_jitter_ms: 1000,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 20_000,
            path: "/agents".to_string(),
            capabilities: Vec::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval_secs: 0,
        }
    }
}

impl ConnectionSection {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            auto_reconnect: self.auto_reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
            reconnect_jitter: Duration::from_millis(self.reconnect_jitter_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            capabilities: self.capabilities.clone(),
            version: self.version.clone(),
        }
    }
}

/// [identity] 段：锁注册表位置与可认领的 profile 池（按优先级排序）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub registry_path: Option<PathBuf>,
    pub profiles: Vec<ProfileEntry>,
    /// 周期性清理失效锁的间隔（秒）
    pub clean_interval_secs: u64,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            registry_path: None,
            profiles: Vec::new(),
            clean_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileEntry {
    pub name: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl IdentitySection {
    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(LockRegistry::default_path)
    }

    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.name.clone()).collect()
    }

    pub fn profile(&self, name: &str) -> Option<&ProfileEntry> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

impl AppConfig {
    /// worker 启动前的校验，任何 I/O 之前失败
    pub fn validate(&self) -> Result<()> {
        if self.nexus.url.trim().is_empty() {
            return Err(AgentError::Config("nexus.url is required".into()));
        }
        if self.identity.profiles.is_empty() {
            return Err(AgentError::Config("identity.profiles must not be empty".into()));
        }
        for profile in &self.identity.profiles {
            if profile.name.trim().is_empty() {
                return Err(AgentError::Config("identity profile name must not be empty".into()));
            }
            self.credentials_for(&profile.name)?;
        }
        if self.api.timeout_ms == 0 || self.connection.connect_timeout_ms == 0 {
            return Err(AgentError::Config("timeouts must be greater than zero".into()));
        }
        Ok(())
    }

    /// profile 的 (client_id, client_secret)；profile 未配置时回退到 [nexus] 段
    pub fn credentials_for(&self, profile: &str) -> Result<(String, String)> {
        let entry = self.identity.profile(profile);
        let pick = |own: Option<&String>, fallback: &Option<String>, field: &str| {
            own.or(fallback.as_ref())
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or_else(|| {
                    AgentError::Config(format!("{} is required for profile '{}'", field, profile))
                })
        };
        let client_id = pick(
            entry.and_then(|e| e.client_id.as_ref()),
            &self.nexus.client_id,
            "client_id",
        )?;
        let client_secret = pick(
            entry.and_then(|e| e.client_secret.as_ref()),
            &self.nexus.client_secret,
            "client_secret",
        )?;
        Ok((client_id, client_secret))
    }
}

/// 从 config 目录加载配置，环境变量 OBLIVION__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 OBLIVION__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> std::result::Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("OBLIVION")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> AppConfig {
        let mut config = AppConfig::default();
        config.nexus.url = "http://localhost:3000".into();
        config.nexus.client_id = Some("shared-id".into());
        config.nexus.client_secret = Some("shared-secret".into());
        config.identity.profiles = vec![
            ProfileEntry {
                name: "worker-1".into(),
                client_id: Some("w1".into()),
                client_secret: Some("s1".into()),
            },
            ProfileEntry {
                name: "worker-2".into(),
                client_id: None,
                client_secret: None,
            },
        ];
        config
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.api.timeout_ms, 30_000);
        assert_eq!(config.api.retryable_statuses, vec![502, 503, 504]);
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.connection.path, "/agents");
        let policy = config.api.retry_policy();
        assert_eq!(policy.max_attempts(true), 4);
        assert_eq!(policy.max_attempts(false), 1);
    }

    #[test]
    fn test_profile_credentials_fall_back_to_nexus() {
        let config = sample();
        assert_eq!(
            config.credentials_for("worker-1").unwrap(),
            ("w1".to_string(), "s1".to_string())
        );
        assert_eq!(
            config.credentials_for("worker-2").unwrap(),
            ("shared-id".to_string(), "shared-secret".to_string())
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut config = sample();
        config.identity.profiles.clear();
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));

        let mut config = sample();
        config.nexus.url = " ".into();
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));

        let mut config = sample();
        config.nexus.client_secret = None;
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[nexus]
url = "https://nexus.example.com"

[api]
max_retries = 1

[connection]
capabilities = ["code", "search"]

[[identity.profiles]]
name = "alpha"
client_id = "a"
client_secret = "b"
"#
        )
        .unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.nexus.url, "https://nexus.example.com");
        assert_eq!(config.api.max_retries, 1);
        assert_eq!(config.api.base_delay_ms, 1000);
        assert_eq!(config.connection.capabilities, vec!["code", "search"]);
        assert_eq!(config.identity.profile_names(), vec!["alpha"]);
    }
}
