//! 会话池
//!
//! 按 “代理身份 + 目标主机” 缓存已握手完成的连接，供同一代理的后续请求复用。
//! 会话在使用期间被取出（独占），请求成功且响应可复用时再放回。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::common::{ParsedProxy, ProxyStream, TargetUrl};

use super::Protocol;

/// 会话池配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionPoolConfig {
    /// 空闲超过该时长的会话在清理时丢弃
    pub idle_timeout_secs: u64,
    pub max_entries: usize,
    /// 后台清理间隔
    pub sweep_interval_secs: u64,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            max_entries: 100,
            sweep_interval_secs: 30,
        }
    }
}

impl SessionPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// 池中的一条会话：握手（及 TLS）完成、可直接发请求的通道
pub struct ManagedSession {
    pub stream: ProxyStream,
    pub protocol: Protocol,
    /// Plain HTTP forwarding session: requests use the absolute URI.
    pub forwarding: bool,
    pub proxy_key: String,
    pub target_host: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub request_count: u32,
    pub is_alive: bool,
}

impl ManagedSession {
    pub fn new(
        stream: ProxyStream,
        protocol: Protocol,
        forwarding: bool,
        proxy: &ParsedProxy,
        target: &TargetUrl,
    ) -> Self {
        let now = Instant::now();
        Self {
            stream,
            protocol,
            forwarding,
            proxy_key: proxy.identity(),
            target_host: target.host.clone(),
            created_at: now,
            last_used_at: now,
            request_count: 0,
            is_alive: true,
        }
    }

    /// 记录一次成功请求
    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
        self.request_count += 1;
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }
}

impl std::fmt::Debug for ManagedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSession")
            .field("protocol", &self.protocol)
            .field("proxy_key", &self.proxy_key)
            .field("target_host", &self.target_host)
            .field("request_count", &self.request_count)
            .field("is_alive", &self.is_alive)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPoolStats {
    pub sessions: usize,
    pub total_requests: u64,
}

/// 进程级会话池
pub struct SessionPool {
    config: SessionPoolConfig,
    sessions: Mutex<HashMap<String, ManagedSession>>,
}

impl SessionPool {
    pub fn new(config: SessionPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(SessionPoolConfig::default())
    }

    pub fn config(&self) -> &SessionPoolConfig {
        &self.config
    }

    /// 池键：代理身份 + 目标 host:port；同一主机不同路径共用一条会话
    pub fn key(proxy: &ParsedProxy, target: &TargetUrl) -> String {
        format!("{}|{}", proxy.identity(), target.authority())
    }

    /// 取出会话（独占使用）。过期或已失效的会话直接丢弃。
    ///
    /// 取出的会话可能已被对端关闭，调用方首次 I/O 失败时应改用新连接。
    pub async fn get(&self, key: &str) -> Option<ManagedSession> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.remove(key)?;
        if !session.is_alive || session.idle_for(Instant::now()) > self.config.idle_timeout() {
            debug!(key = key, "session expired on checkout");
            return None;
        }
        debug!(key = key, requests = session.request_count, "session pool hit");
        Some(session)
    }

    /// 放回会话。同键已有会话时新会话覆盖旧会话；满时淘汰最久未用的一条。
    pub async fn store(&self, key: String, session: ManagedSession) {
        if !session.is_alive {
            return;
        }
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(&key) && sessions.len() >= self.config.max_entries.max(1) {
            let lru = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_used_at)
                .map(|(k, _)| k.clone());
            if let Some(lru) = lru {
                debug!(key = %lru, "session pool full, evicting LRU");
                sessions.remove(&lru);
            }
        }
        sessions.insert(key, session);
    }

    /// 清理空闲超时或已失效的会话，返回清理数量
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let before = sessions.len();
        sessions.retain(|_, s| s.is_alive && s.idle_for(now) <= idle_timeout);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed = removed, remaining = sessions.len(), "session pool swept");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn clear(&self) {
        self.sessions.lock().await.clear();
    }

    pub async fn stats(&self) -> SessionPoolStats {
        let sessions = self.sessions.lock().await;
        SessionPoolStats {
            sessions: sessions.len(),
            total_requests: sessions.values().map(|s| s.request_count as u64).sum(),
        }
    }
}
