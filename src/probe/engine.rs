//! 探测编排
//!
//! `ProbeEngine` 在进程内构造一次，持有共享的 DNS 缓存、会话池和 TLS 配置。
//! 每次 `probe` 调用：校验输入 → 确定协议（已知 / 按顺序探测）→ 顺序执行 N 次连接 → 汇总。

use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::tls::build_probe_tls_config;
use crate::common::{Dialer, ErrorCode, ParsedProxy, ProbeError, ProxyStream, TargetUrl};
use crate::config::EngineConfig;
use crate::dns::{build_resolver, DnsCache, DnsCacheStats, DnsResolver};
use crate::proxy::outbound::http::basic_auth;
use crate::proxy::{
    handshaker_for, protocol_order, tls, HandshakeContext, ManagedSession, Protocol, SessionPool,
    SessionPoolStats,
};

use super::classify::{detection_verdict, failure_code, DetectionVerdict, ProtocolSource};
use super::exit_ip::{parse_exit_ip, ExitIpInfo};
use super::metrics::{
    first_connection_time, round2, subsequent_connection_time, ConnectionMetrics, MetricsSummary,
    PhaseTimings,
};
use super::options::{ProbeOptions, ProxyInput};
use super::request::{build_request, read_response, send_request, ReadOptions, RequestSpec, ResponseOutcome};
use super::result::{ProbeResult, ProbeStatus, ProxyError};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub sessions: SessionPoolStats,
    pub dns: DnsCacheStats,
}

/// 单次连接尝试的参数
#[derive(Debug, Clone, Copy)]
struct AttemptSpec {
    number: u32,
    timeout: Duration,
    /// 首连测真实 DNS 耗时，不走缓存
    cold_dns: bool,
    fast_fail: bool,
    keep_alive: bool,
    /// 可复用的连接放回会话池
    pool: bool,
}

struct AttemptOutcome {
    metrics: ConnectionMetrics,
    response: ResponseOutcome,
}

/// 已确认协议后的 N 次连接结果
struct FullRun {
    protocol: Protocol,
    status_code: u16,
    connections: Vec<ConnectionMetrics>,
}

pub struct ProbeEngine {
    config: EngineConfig,
    dns: Arc<DnsCache>,
    sessions: Arc<SessionPool>,
    tls: Arc<ClientConfig>,
    dialer: Dialer,
    maintenance: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ProbeEngine {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        Self::with_resolver(config, build_resolver())
    }

    pub fn with_resolver(config: EngineConfig, resolver: Arc<dyn DnsResolver>) -> anyhow::Result<Self> {
        config.validate()?;
        let tls = Arc::new(build_probe_tls_config()?);
        Ok(Self {
            dns: Arc::new(DnsCache::new(resolver, &config.dns)),
            sessions: SessionPool::new(config.session.clone()),
            dialer: Dialer::new(config.dialer.clone()),
            tls,
            config,
            maintenance: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dns(&self) -> &Arc<DnsCache> {
        &self.dns
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    /// 启动后台维护任务：定期清理会话池与 DNS 缓存。重复调用无副作用。
    pub async fn start_maintenance(&self) {
        let mut slot = self.maintenance.lock().await;
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let sessions = Arc::clone(&self.sessions);
        let dns = Arc::clone(&self.dns);
        let interval = self.config.session.sweep_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = sessions.sweep().await;
                        dns.prune().await;
                        debug!(swept = swept, "maintenance tick");
                    }
                }
            }
        });
        *slot = Some((cancel, handle));
        debug!(interval_secs = interval.as_secs(), "maintenance task started");
    }

    /// 停止维护任务并关闭所有池中会话
    pub async fn shutdown(&self) {
        if let Some((cancel, handle)) = self.maintenance.lock().await.take() {
            cancel.cancel();
            let _ = handle.await;
        }
        self.sessions.clear().await;
        info!("probe engine shut down");
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            sessions: self.sessions.stats().await,
            dns: self.dns.stats().await,
        }
    }

    /// 探测一个代理。任何失败都以 `status = fail` 的结果返回，不会 panic。
    pub async fn probe(
        &self,
        proxy: impl Into<ProxyInput>,
        target_url: &str,
        options: &ProbeOptions,
    ) -> ProbeResult {
        let started = Instant::now();
        let input = proxy.into();

        let Some(parsed) = input.parse() else {
            debug!(proxy = %input.label(), "invalid proxy format");
            return finish(
                ProbeResult::failed(input.label(), target_url, ProxyError::new(ErrorCode::InvalidFormat)),
                started,
            );
        };
        let Some(target) = TargetUrl::parse(target_url) else {
            let mut err = ProxyError::new(ErrorCode::InvalidFormat);
            err.message = format!("Invalid target URL '{}': only http:// and https:// are supported", target_url);
            return finish(ProbeResult::failed(parsed.to_string(), target_url, err), started);
        };

        let connections = options.connections();
        let overall = (options.timeout() * (connections + 1)).min(self.config.probe.max_timeout());
        let deadline = started + overall;
        let mut tried = Vec::new();

        let outcome = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => Err(
                ProxyError::from_probe_error(ErrorCode::ProxyError, &ProbeError::Cancelled)
            ),
            res = tokio::time::timeout_at(deadline, self.run(&parsed, &target, options, deadline, &mut tried)) => {
                match res {
                    Ok(r) => r,
                    Err(_) => {
                        let mut err = ProxyError::new(ErrorCode::Timeout);
                        err.message = format!(
                            "{}: overall deadline of {} ms exceeded",
                            ErrorCode::Timeout.message(),
                            overall.as_millis()
                        );
                        Err(err)
                    }
                }
            }
        };

        let result = match outcome {
            Ok(run) => {
                let exit_ip = if options.ip_lookup {
                    self.lookup_exit_ip(&parsed, run.protocol, options, started).await
                } else {
                    None
                };
                ProbeResult {
                    status: ProbeStatus::Ok,
                    proxy: parsed.to_string(),
                    target: target.to_string(),
                    protocol: Some(run.protocol),
                    status_code: Some(run.status_code),
                    first_connection_time: first_connection_time(&run.connections),
                    subsequent_connection_time: subsequent_connection_time(&run.connections),
                    timings: MetricsSummary::from_connections(&run.connections),
                    connections: options.test_all_connections.then_some(run.connections),
                    exit_ip,
                    error: None,
                    protocols_tried: tried,
                    elapsed_ms: 0.0,
                }
            }
            Err(mut err) => {
                if err.protocols_tried.is_none() && !tried.is_empty() {
                    err.protocols_tried = Some(tried.clone());
                }
                let mut r = ProbeResult::failed(parsed.to_string(), target.to_string(), err);
                r.protocols_tried = tried;
                r
            }
        };

        let result = finish(result, started);
        match &result.error {
            None => info!(
                proxy = %result.proxy,
                protocol = ?result.protocol,
                first_ms = result.first_connection_time.unwrap_or_default(),
                elapsed_ms = result.elapsed_ms,
                "probe ok"
            ),
            Some(e) => info!(
                proxy = %result.proxy,
                code = %e.code,
                elapsed_ms = result.elapsed_ms,
                "probe failed"
            ),
        }
        result
    }

    /// 确定协议并执行完整探测
    async fn run(
        &self,
        proxy: &ParsedProxy,
        target: &TargetUrl,
        options: &ProbeOptions,
        deadline: Instant,
        tried: &mut Vec<Protocol>,
    ) -> Result<FullRun, ProxyError> {
        let has_credentials = proxy.has_credentials();

        if let Some(protocol) = options.protocol {
            tried.push(protocol);
            return self
                .full_probe(proxy, target, protocol, options, deadline)
                .await
                .map_err(|e| {
                    let code = failure_code(&e, protocol, ProtocolSource::Known, has_credentials);
                    ProxyError::from_probe_error(code, &e)
                });
        }

        let detection_timeout = options.timeout().min(self.config.probe.detection_timeout());
        for candidate in protocol_order(proxy.port, has_credentials) {
            tried.push(candidate);
            let spec = AttemptSpec {
                number: 1,
                timeout: detection_timeout,
                cold_dns: false,
                fast_fail: true,
                keep_alive: false,
                pool: false,
            };

            let source = match self.fresh_attempt(proxy, target, candidate, spec, deadline).await {
                Ok(_) => {
                    debug!(proxy = %proxy, protocol = %candidate, "protocol detected");
                    ProtocolSource::Detected
                }
                Err(err) => match detection_verdict(&err, candidate, has_credentials) {
                    DetectionVerdict::Next => {
                        debug!(proxy = %proxy, protocol = %candidate, error = %err, "candidate rejected");
                        continue;
                    }
                    DetectionVerdict::Promote => {
                        debug!(proxy = %proxy, protocol = %candidate, error = %err, "protocol promoted after request failure");
                        ProtocolSource::Promoted
                    }
                    DetectionVerdict::Terminal(code) => {
                        return Err(ProxyError::from_probe_error(code, &err)
                            .with_protocols_tried(tried.clone()));
                    }
                },
            };

            return self
                .full_probe(proxy, target, candidate, options, deadline)
                .await
                .map_err(|e| {
                    let code = failure_code(&e, candidate, source, has_credentials);
                    ProxyError::from_probe_error(code, &e).with_protocols_tried(tried.clone())
                });
        }

        Err(ProxyError::new(ErrorCode::AllProtocolsFailed).with_protocols_tried(tried.clone()))
    }

    /// 已确认协议：顺序执行 N 次连接，首连冷启动，后续按需复用会话
    async fn full_probe(
        &self,
        proxy: &ParsedProxy,
        target: &TargetUrl,
        protocol: Protocol,
        options: &ProbeOptions,
        deadline: Instant,
    ) -> Result<FullRun, ProbeError> {
        let n = options.connections();
        let mut connections = Vec::with_capacity(n as usize);
        let mut status_code = 0;

        for number in 1..=n {
            let spec = AttemptSpec {
                number,
                timeout: options.timeout(),
                cold_dns: number == 1,
                fast_fail: false,
                keep_alive: true,
                pool: options.session_reuse,
            };
            let outcome = if options.session_reuse && number > 1 {
                self.reuse_or_fresh(proxy, target, protocol, spec, deadline).await?
            } else {
                self.fresh_attempt(proxy, target, protocol, spec, deadline).await?
            };
            status_code = outcome.response.head.status;
            debug!(
                proxy = %proxy,
                protocol = %protocol,
                connection = number,
                reused = outcome.metrics.session_reused,
                total_ms = outcome.metrics.total_time,
                "connection attempt completed"
            );
            connections.push(outcome.metrics);
        }

        Ok(FullRun {
            protocol,
            status_code,
            connections,
        })
    }

    /// 优先使用池中会话；会话已失效时丢弃并改用新连接（不计为复用）
    async fn reuse_or_fresh(
        &self,
        proxy: &ParsedProxy,
        target: &TargetUrl,
        protocol: Protocol,
        spec: AttemptSpec,
        deadline: Instant,
    ) -> Result<AttemptOutcome, ProbeError> {
        let key = SessionPool::key(proxy, target);
        if let Some(session) = self.sessions.get(&key).await {
            if session.protocol == protocol {
                match self.session_attempt(proxy, target, session, spec, deadline).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(e) if is_stale_session(&e) => {
                        warn!(proxy = %proxy, error = %e, "stale session discarded, reconnecting");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.fresh_attempt(proxy, target, protocol, spec, deadline).await
    }

    async fn session_attempt(
        &self,
        proxy: &ParsedProxy,
        target: &TargetUrl,
        mut session: ManagedSession,
        spec: AttemptSpec,
        deadline: Instant,
    ) -> Result<AttemptOutcome, ProbeError> {
        let deadline = deadline.min(Instant::now() + spec.timeout);
        let mut timings = PhaseTimings::begin();
        let response = self
            .exchange(&mut session.stream, proxy, target, session.forwarding, spec.keep_alive, deadline, &mut timings)
            .await?;

        let metrics = ConnectionMetrics::from_timings(&timings, spec.number, true, proxy.has_credentials());
        session.touch();
        if response.reusable {
            self.sessions.store(SessionPool::key(proxy, target), session).await;
        }
        Ok(AttemptOutcome { metrics, response })
    }

    /// 新建连接：DNS → TCP → 协议握手 → (TLS) → 请求
    async fn fresh_attempt(
        &self,
        proxy: &ParsedProxy,
        target: &TargetUrl,
        protocol: Protocol,
        spec: AttemptSpec,
        deadline: Instant,
    ) -> Result<AttemptOutcome, ProbeError> {
        let deadline = deadline.min(Instant::now() + spec.timeout);
        let mut timings = PhaseTimings::begin();

        timings.dns_start = Some(Instant::now());
        let lookup = async {
            if spec.cold_dns {
                self.dns.resolve_fresh(&proxy.host).await
            } else {
                self.dns.resolve(&proxy.host).await
            }
        };
        let proxy_ip = tokio::time::timeout_at(deadline, lookup)
            .await
            .map_err(|_| ProbeError::Timeout("dns lookup"))?;
        timings.dns_end = Some(Instant::now());

        timings.connect_start = Some(Instant::now());
        let tcp = self.dialer.connect(&proxy_ip, proxy.port, deadline).await?;
        timings.connect_end = Some(Instant::now());

        let ctx = HandshakeContext {
            proxy,
            target,
            deadline,
            fast_fail: spec.fast_fail,
            wrong_protocol_timeout: self.config.probe.wrong_protocol_timeout(),
            dns: self.dns.as_ref(),
        };
        timings.handshake_start = Some(Instant::now());
        let handshake = handshaker_for(protocol).handshake(Box::new(tcp), &ctx).await?;
        timings.handshake_end = Some(Instant::now());
        if let Some((start, end)) = handshake.auth_span {
            timings.auth_start = Some(start);
            timings.auth_end = Some(end);
        }

        let forwarding = handshake.forwarding;
        let mut stream = handshake.stream;
        if target.secure {
            timings.tls_start = Some(Instant::now());
            stream = tls::upgrade(stream, &target.host, Arc::clone(&self.tls), deadline).await?;
            timings.tls_end = Some(Instant::now());
        }

        let response = self
            .exchange(&mut stream, proxy, target, forwarding, spec.keep_alive, deadline, &mut timings)
            .await?;
        let metrics = ConnectionMetrics::from_timings(&timings, spec.number, false, proxy.has_credentials());

        if spec.pool && response.reusable {
            let mut session = ManagedSession::new(stream, protocol, forwarding, proxy, target);
            session.touch();
            self.sessions.store(SessionPool::key(proxy, target), session).await;
        }
        Ok(AttemptOutcome { metrics, response })
    }

    /// 发送 GET 并读取响应，记录请求相关时间点
    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        stream: &mut ProxyStream,
        proxy: &ParsedProxy,
        target: &TargetUrl,
        forwarding: bool,
        keep_alive: bool,
        deadline: Instant,
        timings: &mut PhaseTimings,
    ) -> Result<ResponseOutcome, ProbeError> {
        let request = build_request(&RequestSpec {
            target,
            forwarding,
            proxy_auth: basic_auth(proxy),
            user_agent: &self.config.probe.user_agent,
            keep_alive,
        });

        let (request_start, request_end) = send_request(stream, &request, deadline).await?;
        timings.request_start = Some(request_start);
        timings.request_end = Some(request_end);

        let read_opts = ReadOptions {
            connect_fallback: Duration::from_millis(self.config.probe.connect_fallback_ms),
            response_fallback: Duration::from_millis(self.config.probe.response_fallback_ms),
        };
        let response = read_response(stream, deadline, keep_alive, read_opts).await?;
        timings.first_byte = Some(response.first_byte);
        timings.last_byte = Some(response.last_byte);

        if matches!(response.head.status, 502..=504) {
            return Err(ProbeError::BadStatus(response.head.status));
        }
        Ok(response)
    }

    /// 出口 IP 查询：独立连接，走已确认的协议。失败只记日志，不影响结果。
    async fn lookup_exit_ip(
        &self,
        proxy: &ParsedProxy,
        protocol: Protocol,
        options: &ProbeOptions,
        started: Instant,
    ) -> Option<ExitIpInfo> {
        let Some(target) = TargetUrl::parse(&self.config.probe.ip_lookup_url) else {
            warn!(url = %self.config.probe.ip_lookup_url, "invalid exit IP lookup URL");
            return None;
        };
        let remaining = self.config.probe.max_timeout().saturating_sub(started.elapsed());
        let budget = options.timeout().min(remaining);
        if budget.is_zero() {
            warn!(proxy = %proxy, "no time left for exit IP lookup");
            return None;
        }

        let spec = AttemptSpec {
            number: 1,
            timeout: budget,
            cold_dns: false,
            fast_fail: false,
            keep_alive: false,
            pool: false,
        };
        let deadline = Instant::now() + budget;
        let attempt = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => Err(ProbeError::Cancelled),
            r = self.fresh_attempt(proxy, &target, protocol, spec, deadline) => r,
        };

        match attempt {
            Ok(outcome) => {
                let info = parse_exit_ip(&outcome.response.decoded_body());
                if info.is_none() {
                    warn!(proxy = %proxy, status = outcome.response.head.status, "exit IP response not understood");
                }
                info
            }
            Err(e) => {
                warn!(proxy = %proxy, error = %e, "exit IP lookup failed");
                None
            }
        }
    }
}

fn finish(mut result: ProbeResult, started: Instant) -> ProbeResult {
    result.elapsed_ms = round2(started.elapsed().as_secs_f64() * 1000.0);
    result
}

/// 复用会话首次 I/O 就失败，多半是对端已经关闭了空闲连接
fn is_stale_session(err: &ProbeError) -> bool {
    matches!(
        err,
        ProbeError::Io(_) | ProbeError::ClosedBeforeResponse | ProbeError::ClosedDuringHandshake(_)
    )
}
