//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 任务配置
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    // 网络配置
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_max_workers() -> usize {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        &[
            FieldMeta {
                name: "max_workers",
                description: "同时处理任务的 worker 数量",
            },
            FieldMeta {
                name: "request_timeout",
                description: "单次 HTTP 请求超时（秒）",
            },
            FieldMeta {
                name: "max_retries",
                description: "HTTP 请求最大尝试次数（含首次）",
            },
            FieldMeta {
                name: "retry_base_delay_ms",
                description: "重试退避基础延迟（毫秒），按 2^n 递增",
            },
            FieldMeta {
                name: "retry_max_delay_ms",
                description: "重试退避延迟上限（毫秒）",
            },
        ]
    }
}
