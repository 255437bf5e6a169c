use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::stream::{self, StreamExt};
use tracing::{info, warn};

use proxyprobe::{EngineConfig, ProbeEngine, ProbeOptions, Protocol};

/// 批量检测代理的可用性、协议与各阶段延迟，结果按行输出 JSON
#[derive(Debug, Parser)]
#[command(name = "proxyprobe", version, about)]
struct Cli {
    /// 代理列表（host:port / host:port:user:pass / user:pass@host:port）
    proxies: Vec<String>,

    /// 从文件读取代理，每行一个，`#` 开头为注释
    #[arg(short, long)]
    file: Option<PathBuf>,

    #[arg(short, long, default_value = "https://www.google.com/generate_204")]
    target: String,

    /// 跳过协议探测
    #[arg(short, long, value_parser = parse_protocol)]
    protocol: Option<Protocol>,

    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// 每个代理的连接次数（1-10）
    #[arg(short = 'n', long, default_value_t = 1)]
    connections: u32,

    #[arg(long)]
    session_reuse: bool,

    #[arg(long)]
    ip_lookup: bool,

    /// 输出每次连接的明细
    #[arg(long)]
    all_connections: bool,

    #[arg(short = 'j', long, default_value_t = 16)]
    concurrency: usize,

    /// YAML 配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn parse_protocol(s: &str) -> Result<Protocol, String> {
    s.parse::<Protocol>().map_err(|e| e.to_string())
}

fn read_proxy_file(path: &PathBuf) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read proxy list '{}'", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => proxyprobe::config::load_config(&path.to_string_lossy())?,
        None => EngineConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();

    let mut proxies = cli.proxies.clone();
    if let Some(path) = &cli.file {
        proxies.extend(read_proxy_file(path)?);
    }
    if proxies.is_empty() {
        anyhow::bail!("no proxies given (pass them as arguments or with --file)");
    }

    let engine = Arc::new(ProbeEngine::new(config)?);
    engine.start_maintenance().await;
    info!(count = proxies.len(), target = %cli.target, "probing proxies");

    let options = ProbeOptions {
        timeout: cli.timeout_ms,
        connections_per_proxy: cli.connections,
        test_all_connections: cli.all_connections,
        session_reuse: cli.session_reuse,
        ip_lookup: cli.ip_lookup,
        protocol: cli.protocol,
        ..Default::default()
    };

    // Ctrl-C 取消所有进行中的探测
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling probes");
            cancel.cancel();
        }
    });

    let mut results = stream::iter(proxies)
        .map(|proxy| {
            let engine = Arc::clone(&engine);
            let options = options.clone();
            let target = cli.target.clone();
            async move { engine.probe(proxy, &target, &options).await }
        })
        .buffer_unordered(cli.concurrency.max(1));

    let (mut ok, mut failed) = (0usize, 0usize);
    while let Some(result) = results.next().await {
        if result.is_ok() {
            ok += 1;
        } else {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&result)?);
    }

    engine.shutdown().await;
    info!(ok = ok, failed = failed, "done");
    Ok(())
}
