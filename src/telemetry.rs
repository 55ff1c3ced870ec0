//! 日志初始化
//!
//! `RUST_LOG` 优先于传入的默认过滤器。重复初始化返回错误而不是 panic。

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// 安装文本格式的 tracing subscriber
pub fn init_tracing(default_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(env_filter(default_filter))
        .try_init()
        .context("failed to install tracing subscriber")
}

/// 安装 JSON 格式的 tracing subscriber
pub fn init_tracing_json(default_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json().with_current_span(false))
        .with(env_filter(default_filter))
        .try_init()
        .context("failed to install JSON tracing subscriber")
}
