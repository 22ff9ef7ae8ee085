//! Oblivion worker
//!
//! 入口：初始化日志与配置，认领身份 profile，建立认证、请求层与持久连接，
//! 运行至收到关闭信号或连接彻底断开，最后断开连接并释放身份锁。

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use oblivion::api::retry::random_jitter_ms;
use oblivion::api::ApiClient;
use oblivion::auth::{CredentialConfig, CredentialManager};
use oblivion::config::{load_config, AppConfig};
use oblivion::core::{
    ConnectionCleanup, IdentityReleaseCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
use oblivion::gateway::{AgentStatus, ConnectionManager, WebSocketTransport};
use oblivion::identity::IdentityLockCoordinator;
use oblivion::observability;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log = observability::init();

    // 可选：第一个参数为额外的配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let pid = std::process::id();
    let coordinator = Arc::new(IdentityLockCoordinator::with_system_probe(
        config.identity.registry_path(),
    ));
    tracing::info!(
        "Identity registry: {}",
        coordinator.registry_path().display()
    );

    let profile = claim_profile(Arc::clone(&coordinator), pid, config.identity.profile_names())
        .await
        .context("Failed to acquire identity profile")?;
    let Some(profile) = profile else {
        tracing::warn!("All identity profiles are held by other workers; exiting");
        return Ok(());
    };

    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();
    let mut shutdown = ShutdownCoordinator::new(Arc::clone(&manager));

    let outcome = run(&config, &profile, &coordinator, &manager, &mut shutdown).await;
    if let Err(e) = &outcome {
        tracing::error!("Worker stopped with error: {:#}", e);
        manager.shutdown(ShutdownReason::FatalError(e.to_string()));
    }

    // 释放身份锁放在最后：连接已断开后 profile 才可被他人认领
    shutdown.register(IdentityReleaseCleanup::new(Arc::clone(&coordinator), pid));
    shutdown.run_cleanup().await;
    outcome
}

/// 启动时清理失效锁并列出现有持有者，然后认领
async fn claim_profile(
    coordinator: Arc<IdentityLockCoordinator>,
    pid: u32,
    candidates: Vec<String>,
) -> anyhow::Result<Option<String>> {
    let profile = tokio::task::spawn_blocking(move || -> oblivion::Result<Option<String>> {
        let purged = coordinator.clean_stale()?;
        if !purged.is_empty() {
            tracing::info!("Purged {} stale identity locks at startup", purged.len());
        }
        for record in coordinator.list_all()? {
            tracing::info!(
                pid = record.pid,
                profile = %record.profile,
                locked_at = %record.locked_at,
                "Identity profile held"
            );
        }
        coordinator.acquire(pid, &candidates)
    })
    .await
    .context("Identity task panicked")??;
    Ok(profile)
}

async fn run(
    config: &AppConfig,
    profile: &str,
    coordinator: &Arc<IdentityLockCoordinator>,
    manager: &Arc<ShutdownManager>,
    shutdown: &mut ShutdownCoordinator,
) -> anyhow::Result<()> {
    let (client_id, client_secret) = config.credentials_for(profile)?;
    let credentials = Arc::new(
        CredentialManager::new(CredentialConfig::new(&config.nexus.url, client_id, client_secret))?
            .with_span(tracing::info_span!("credentials", profile = %profile)),
    );

    let api = Arc::new(
        ApiClient::new(&config.nexus.url, credentials.clone())?
            .with_policy(config.api.retry_policy())
            .with_timeout(config.api.timeout())
            .with_span(tracing::info_span!("api", profile = %profile)),
    );

    let transport = Arc::new(WebSocketTransport::new(
        &config.nexus.url,
        &config.connection.path,
        config.connection.handshake_timeout(),
    )?);
    tracing::info!("Nexus endpoint: {}", transport.url());

    let connection = Arc::new(
        ConnectionManager::new(config.connection.connection_config(), credentials.clone(), transport)
            .with_span(tracing::info_span!("connection", profile = %profile)),
    );
    shutdown.register(ConnectionCleanup::new(Arc::clone(&connection)));
    register_handlers(&connection, &api);

    connect_with_backoff(config, &connection, manager).await?;
    tracing::info!(
        agent_id = connection.agent_id().as_deref().unwrap_or("-"),
        "Worker ready, waiting for tasks"
    );

    let token = manager.token();
    let cleaner = spawn_stale_cleaner(
        Arc::clone(coordinator),
        Duration::from_secs(config.identity.clean_interval_secs.max(1)),
        token.clone(),
    );
    let heartbeat = (config.connection.heartbeat_interval_secs > 0).then(|| {
        spawn_heartbeat(
            Arc::downgrade(&connection),
            Duration::from_secs(config.connection.heartbeat_interval_secs),
            token.clone(),
        )
    });

    let result = tokio::select! {
        _ = manager.wait_for_shutdown() => {
            tracing::info!(reason = ?manager.reason(), "Shutdown signal received");
            Ok(())
        }
        _ = connection.wait_until_disconnected() => {
            Err(anyhow::anyhow!("connection to nexus lost after exhausting reconnect attempts"))
        }
    };

    token.cancel();
    cleaner.abort();
    if let Some(h) = heartbeat {
        h.abort();
    }
    result
}

/// 首次连接失败时按重连参数退避重试；期间收到关闭信号则放弃
async fn connect_with_backoff(
    config: &AppConfig,
    connection: &ConnectionManager,
    manager: &ShutdownManager,
) -> anyhow::Result<()> {
    let policy = config.connection.connection_config();
    let mut attempt = 0u32;
    loop {
        match connection.connect().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < policy.max_reconnect_attempts => {
                attempt += 1;
                let delay = policy.reconnect_delay(attempt, random_jitter_ms(policy.reconnect_jitter));
                tracing::warn!(
                    "Connect failed ({}); retry {}/{} in {:?}",
                    e,
                    attempt,
                    policy.max_reconnect_attempts,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = manager.wait_for_shutdown() => {
                        anyhow::bail!("shutdown requested before connecting");
                    }
                }
            }
            Err(e) => return Err(e).context("Failed to connect to nexus"),
        }
    }
}

/// 处理器只持有弱引用，避免连接与处理器互相持有
fn register_handlers(connection: &Arc<ConnectionManager>, api: &Arc<ApiClient>) {
    let conn = Arc::downgrade(connection);
    let api_for_tasks = Arc::clone(api);
    connection.on_task_assigned(move |task| {
        let conn: Weak<ConnectionManager> = conn.clone();
        let api = Arc::clone(&api_for_tasks);
        async move {
            tracing::info!(task_id = %task.task_id, title = %task.title, "Task assigned");
            let Some(conn) = conn.upgrade() else {
                return Ok::<(), anyhow::Error>(());
            };
            conn.update_status(AgentStatus::Working, Some(task.task_id.clone()), None)?;

            let path = format!("/tasks/{}", task.task_id);
            match api.get::<serde_json::Value>(&path).await {
                Ok(detail) => tracing::debug!(task_id = %task.task_id, "Task detail: {}", detail),
                Err(e) => tracing::warn!(task_id = %task.task_id, code = %e.code(), "Fetching task detail failed: {}", e),
            }

            conn.update_status(AgentStatus::Idle, None, None)?;
            Ok(())
        }
    });

    connection.on_context_update(|ctx| async move {
        tracing::info!(
            task_id = %ctx.task_id,
            author = %ctx.author,
            human = ctx.is_human,
            "Context update"
        );
        Ok(())
    });

    connection.on_wake_up(|wake| async move {
        tracing::info!(reason = ?wake.reason, task_id = ?wake.task_id, "Wake up");
        Ok(())
    });

    connection.on_tool_result(|result| async move {
        tracing::debug!(request_id = %result.request_id, success = result.success, "Tool result");
        Ok(())
    });
}

fn spawn_stale_cleaner(
    coordinator: Arc<IdentityLockCoordinator>,
    interval: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let coordinator = Arc::clone(&coordinator);
            match tokio::task::spawn_blocking(move || coordinator.clean_stale()).await {
                Ok(Ok(purged)) if !purged.is_empty() => {
                    tracing::info!("Purged {} stale identity locks", purged.len());
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!("Stale lock cleanup failed: {}", e),
                Err(e) => tracing::warn!("Stale lock cleanup task panicked: {}", e),
            }
        }
    })
}

fn spawn_heartbeat(
    connection: Weak<ConnectionManager>,
    interval: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(conn) = connection.upgrade() else {
                break;
            };
            if conn.is_connected() {
                if let Err(e) = conn.send_heartbeat() {
                    tracing::debug!("Heartbeat not sent: {}", e);
                }
            }
        }
    })
}
