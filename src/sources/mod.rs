//! 应用源抽象：能力集、注册表与共享类型。
//!
//! 每个源（应用商店）实现 [`Source`]；注册表在启动时建好后只读共享。

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

use crate::network::HttpError;

pub mod fdroid;
pub mod rustore;

/// 制品类型，用作输出文件的扩展名。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Apk,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::Apk => f.write_str("apk"),
        }
    }
}

/// 某源上一个可下载的版本。
///
/// `code == 0` 的零值是"未找到"哨兵：只有 code 非零才算命中。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Version {
    pub name: String,
    pub code: u64,
    pub size: u64,
    pub link: String,
    pub package_name: String,
    pub developer_id: String,
    pub file_type: Option<FileType>,
}

impl Version {
    pub fn is_found(&self) -> bool {
        self.code != 0
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// 源明确表示没有这个应用/版本。预期情况，不计入错误列表。
    #[error("{package} not found")]
    NotFound { package: String },
    /// 该源不支持按开发者列应用。
    #[error("developer listing not supported")]
    Unsupported,
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unexpected response shape: {0}")]
    Shape(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound { .. })
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, SourceError::Unsupported)
    }
}

/// 解析过程中某个源的失败记录（NotFound 不在内）。
#[derive(Debug)]
pub struct SourceFailure {
    pub source: String,
    pub package: String,
    pub error: SourceError,
}

pub trait Source: Send + Sync {
    /// 全局唯一、全小写。
    fn name(&self) -> &'static str;

    /// 该源允许的并发下载数。
    fn max_parallel_downloads(&self) -> usize {
        1
    }

    /// 查找应用版本。`version_code == 0` 取最新，非零要求精确匹配。
    fn find_by_package(&self, package: &str, version_code: u64) -> Result<Version, SourceError>;

    /// 列出同一开发者的全部包名。可选能力，默认不支持。
    fn find_by_developer(&self, _developer_id: &str) -> Result<Vec<String>, SourceError> {
        Err(SourceError::Unsupported)
    }

    /// 打开版本的下载字节流。
    fn download(&self, version: &Version) -> Result<Box<dyn Read + Send>, SourceError>;

    /// 下载落盘后的源特定处理（如 rustore 的 zip 解包）。默认无操作。
    fn post_download(&self, _path: &Path) -> Result<(), SourceError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("source {0} is already registered")]
    Duplicate(String),
    #[error("source name {0} must be lowercase")]
    NotLowercase(String),
}

/// 显式注册表对象：启动时构建一次，之后只读传引用。
#[derive(Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn Source>) -> Result<(), RegistryError> {
        let name = source.name();
        if name != name.to_lowercase() {
            return Err(RegistryError::NotLowercase(name.to_string()));
        }
        if self.sources.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.sources.insert(name.to_string(), source);
        Ok(())
    }

    /// 按名字筛选源；`names` 为空表示全部。未知名字被忽略。
    pub fn select(&self, names: &[String]) -> Vec<Arc<dyn Source>> {
        if names.is_empty() {
            return self.sources.values().cloned().collect();
        }
        let wanted: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        self.sources
            .iter()
            .filter(|(name, _)| wanted.contains(name))
            .map(|(_, source)| source.clone())
            .collect()
    }
}
