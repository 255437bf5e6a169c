pub mod types;

use std::path::Path;

use anyhow::{Context, Result};

pub use types::{EngineConfig, LogConfig, ProbeTuning};

/// 从 YAML 文件加载引擎配置：展开环境变量，反序列化，校验
pub fn load_config(path: &str) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config file '{}'", path))?;
    parse_config(&raw)
}

pub fn parse_config(content: &str) -> Result<EngineConfig> {
    let expanded = expand_env_vars(content);
    // 空文件按全默认处理
    let config: EngineConfig = if expanded.trim().is_empty() {
        EngineConfig::default()
    } else {
        serde_yml::from_str(&expanded).context("invalid config YAML")?
    };
    config.validate()?;
    Ok(config)
}

/// Expand `${VAR}`, `${VAR:-default}` and `$VAR`. Undefined variables expand to nothing.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        if chars.peek() == Some(&'{') {
            chars.next();
            let name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            let (name, default) = match name.split_once(":-") {
                Some((n, d)) => (n, Some(d)),
                None => (name.as_str(), None),
            };
            match (std::env::var(name), default) {
                (Ok(val), Some(d)) if val.is_empty() => result.push_str(d),
                (Ok(val), _) => result.push_str(&val),
                (Err(_), Some(d)) => result.push_str(d),
                (Err(_), None) => {}
            }
        } else {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if !(c.is_ascii_alphanumeric() || c == '_') {
                    break;
                }
                name.push(c);
                chars.next();
            }
            if name.is_empty() {
                result.push('$');
            } else if let Ok(val) = std::env::var(&name) {
                result.push_str(&val);
            }
        }
    }
    result
}
