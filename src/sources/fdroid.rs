//! F-Droid 源：官方仓库的 index-v2.json。
//!
//! 索引一次性给出全部包与版本；按需挑出目标包的最高（或精确）versionCode。

use std::collections::HashMap;
use std::io::Read;

use reqwest::Method;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_CHARSET, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use super::{FileType, Source, SourceError, Version};
use crate::network::{HttpClient, NetSettings};

const REPO_URL: &str = "https://f-droid.org/repo";
const INDEX_URL: &str = "https://f-droid.org/repo/index-v2.json";

#[derive(Debug, Deserialize, Default)]
struct AppMetadata {
    #[serde(rename = "authorName", default)]
    author_name: String,
}

#[derive(Debug, Deserialize)]
struct VersionFile {
    name: String,
    #[serde(default)]
    size: f64,
}

#[derive(Debug, Deserialize)]
struct VersionManifest {
    #[serde(rename = "versionName", default)]
    version_name: String,
    #[serde(rename = "versionCode", default)]
    version_code: u64,
}

#[derive(Debug, Deserialize)]
struct VersionEntry {
    file: VersionFile,
    manifest: VersionManifest,
}

#[derive(Debug, Deserialize, Default)]
struct AppEntry {
    #[serde(default)]
    metadata: AppMetadata,
    #[serde(default)]
    versions: HashMap<String, VersionEntry>,
}

#[derive(Debug, Deserialize)]
struct Index {
    packages: HashMap<String, AppEntry>,
}

pub struct FDroid {
    http: HttpClient,
}

impl FDroid {
    pub fn new(net: &NetSettings) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("F-Droid 1.21.1"));
        headers.insert(ACCEPT_CHARSET, HeaderValue::from_static("UTF-8"));
        Ok(Self {
            http: net.client(headers)?,
        })
    }

    fn fetch_index(&self) -> Result<Index, SourceError> {
        let req = self.http.request(Method::GET, INDEX_URL).build()?;
        let resp = self.http.execute(req)?;
        if resp.status() != StatusCode::OK {
            return Err(SourceError::Status {
                status: resp.status(),
                body: String::new(),
            });
        }
        Ok(resp.json()?)
    }

    fn pick_version(app: &AppEntry, package: &str, version_code: u64) -> Option<Version> {
        let entry = if version_code != 0 {
            app.versions
                .values()
                .find(|v| v.manifest.version_code == version_code)
        } else {
            app.versions
                .values()
                .max_by_key(|v| v.manifest.version_code)
        }?;
        if entry.manifest.version_code == 0 {
            return None;
        }
        Some(Version {
            name: entry.manifest.version_name.clone(),
            code: entry.manifest.version_code,
            size: entry.file.size as u64,
            link: entry.file.name.clone(),
            package_name: package.to_string(),
            developer_id: app.metadata.author_name.clone(),
            file_type: Some(FileType::Apk),
        })
    }
}

impl Source for FDroid {
    fn name(&self) -> &'static str {
        "fdroid"
    }

    fn max_parallel_downloads(&self) -> usize {
        3
    }

    fn find_by_package(&self, package: &str, version_code: u64) -> Result<Version, SourceError> {
        let index = self.fetch_index()?;
        // 索引键与用户输入的大小写可能不一致
        let (pkg_name, app) = index
            .packages
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(package))
            .ok_or_else(|| SourceError::NotFound {
                package: package.to_string(),
            })?;
        Self::pick_version(app, pkg_name, version_code).ok_or_else(|| SourceError::NotFound {
            package: package.to_string(),
        })
    }

    fn find_by_developer(&self, developer_id: &str) -> Result<Vec<String>, SourceError> {
        let index = self.fetch_index()?;
        let packages = index
            .packages
            .iter()
            .filter(|(_, app)| app.metadata.author_name.eq_ignore_ascii_case(developer_id))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        debug!("fdroid: 开发者 {developer_id} 共 {} 个应用", packages.len());
        Ok(packages)
    }

    fn download(&self, version: &Version) -> Result<Box<dyn Read + Send>, SourceError> {
        let url = format!("{REPO_URL}{}", version.link);
        let req = self.http.request(Method::GET, &url).build()?;
        let resp = self.http.execute(req)?;
        if resp.status() != StatusCode::OK {
            return Err(SourceError::Status {
                status: resp.status(),
                body: String::new(),
            });
        }
        Ok(Box::new(resp))
    }
}
