//! RuStore 源：backapi.rustore.ru 的 JSON API。
//!
//! 下载接口需要设备画像；这里只带一个精简的静态画像，
//! 不做完整的设备指纹伪装。

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::Method;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde_json::{Value, json};
use tracing::debug;

use super::{FileType, Source, SourceError, Version};
use crate::network::{HttpClient, NetSettings};

const API_BASE: &str = "https://backapi.rustore.ru";

struct DeviceProfile {
    brand: &'static str,
    model: &'static str,
    android_release: &'static str,
    sdk_int: u32,
    abi: &'static str,
}

const DEVICES: &[DeviceProfile] = &[
    DeviceProfile {
        brand: "google",
        model: "Pixel 7",
        android_release: "14",
        sdk_int: 34,
        abi: "arm64-v8a",
    },
    DeviceProfile {
        brand: "samsung",
        model: "SM-S918B",
        android_release: "14",
        sdk_int: 34,
        abi: "arm64-v8a",
    },
    DeviceProfile {
        brand: "xiaomi",
        model: "M2101K6G",
        android_release: "13",
        sdk_int: 33,
        abi: "arm64-v8a",
    },
];

fn clock_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
        .unwrap_or(0)
}

fn pick_device() -> &'static DeviceProfile {
    &DEVICES[(clock_nanos() as usize) % DEVICES.len()]
}

/// `xxxxxxxxxxxxxxxx--dddddddddd` 形式的设备 id。
/// 随机性来自时钟纳秒（避免引入 rand 依赖）。
fn generate_device_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    const DIGITS: &[u8] = b"0123456789";
    let mut state = clock_nanos() | 1;
    let mut next = || {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let head: String = (0..16)
        .map(|_| CHARSET[(next() % CHARSET.len() as u64) as usize] as char)
        .collect();
    let tail: String = (0..10)
        .map(|_| DIGITS[(next() % DIGITS.len() as u64) as usize] as char)
        .collect();
    format!("{head}--{tail}")
}

pub struct RuStore {
    http: HttpClient,
    device: &'static DeviceProfile,
    apps_cache: Mutex<HashMap<String, Value>>,
}

impl RuStore {
    pub fn new(net: &NetSettings) -> Result<Self, SourceError> {
        let device = pick_device();
        let headers = Self::default_headers(device)?;
        Ok(Self {
            http: net.client(headers)?,
            device,
            apps_cache: Mutex::new(HashMap::new()),
        })
    }

    fn default_headers(device: &DeviceProfile) -> Result<HeaderMap, SourceError> {
        let ua = format!(
            "RuStore/1.93.0.3 (Android {}; SDK {}; {}; {}; ru)",
            device.android_release, device.sdk_int, device.abi, device.model
        );
        let pairs: Vec<(&str, String)> = vec![
            ("deviceId", generate_device_id()),
            ("deviceManufacturerName", device.brand.to_string()),
            ("deviceModelName", device.model.to_string()),
            ("deviceModel", format!("{} {}", device.brand, device.model)),
            ("firmwareLang", "ru".to_string()),
            ("androidSdkVer", device.sdk_int.to_string()),
            ("firmwareVer", device.android_release.to_string()),
            ("deviceType", "mobile".to_string()),
            ("ruStoreVerCode", "1093003".to_string()),
        ];
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&ua).map_err(|e| SourceError::Shape(e.to_string()))?,
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        for (name, value) in pairs {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SourceError::Shape(e.to_string()))?;
            let value =
                HeaderValue::from_str(&value).map_err(|e| SourceError::Shape(e.to_string()))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    fn get_app_info(&self, package: &str) -> Result<Value, SourceError> {
        if let Ok(cache) = self.apps_cache.lock()
            && let Some(info) = cache.get(package)
        {
            return Ok(info.clone());
        }

        let url = format!("{API_BASE}/applicationData/overallInfo/{package}");
        let req = self.http.request(Method::GET, &url).build()?;
        let resp = self.http.execute(req)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound {
                package: package.to_string(),
            });
        }
        let body = resp.text()?;
        if status != StatusCode::OK {
            return Err(SourceError::Status { status, body });
        }
        let result: Value = serde_json::from_str(&body)?;
        if result.get("code").and_then(Value::as_str) != Some("OK") {
            return Err(SourceError::NotFound {
                package: package.to_string(),
            });
        }
        let info = result
            .get("body")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| SourceError::Shape("overallInfo: body 不是对象".to_string()))?;
        if let Ok(mut cache) = self.apps_cache.lock() {
            cache.insert(package.to_string(), info.clone());
        }
        Ok(info)
    }

    fn get_download_link(&self, app_id: u64) -> Result<String, SourceError> {
        let url = format!("{API_BASE}/applicationData/v2/download-link");
        let payload = json!({
            "appId": app_id,
            "firstInstall": true,
            "mobileServices": ["GMS"],
            "supportedAbis": [self.device.abi],
            "screenDensity": 480,
            "supportedLocales": ["en_US", "ru_RU"],
            "sdkVersion": self.device.sdk_int,
            "withoutSplits": true,
            "signatureFingerprint": null,
        });
        let req = self
            .http
            .request(Method::POST, &url)
            .body(serde_json::to_vec(&payload)?)
            .build()?;
        let resp = self.http.execute(req)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound {
                package: app_id.to_string(),
            });
        }
        let body = resp.text()?;
        if status != StatusCode::OK {
            return Err(SourceError::Status { status, body });
        }
        let result: Value = serde_json::from_str(&body)?;
        if let Some(err) = result.get("error").and_then(Value::as_str) {
            return Err(SourceError::Shape(err.to_string()));
        }
        if result.get("code").and_then(Value::as_str) != Some("OK") {
            let message = result
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("download-link: code != OK");
            return Err(SourceError::Shape(message.to_string()));
        }
        result
            .pointer("/body/downloadUrls/0/url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SourceError::Shape("download-link: 缺少 downloadUrls".to_string()))
    }
}

impl Source for RuStore {
    fn name(&self) -> &'static str {
        "rustore"
    }

    fn max_parallel_downloads(&self) -> usize {
        3
    }

    fn find_by_package(&self, package: &str, version_code: u64) -> Result<Version, SourceError> {
        let info = self.get_app_info(package)?;
        let code = info
            .get("versionCode")
            .and_then(Value::as_u64)
            .ok_or_else(|| SourceError::Shape("overallInfo: 缺少 versionCode".to_string()))?;
        if version_code != 0 && version_code != code {
            return Err(SourceError::NotFound {
                package: package.to_string(),
            });
        }
        Ok(Version {
            name: info
                .get("versionName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            code,
            size: info.get("fileSize").and_then(Value::as_u64).unwrap_or(0),
            link: String::new(), // 下载链接在取流时按 appId 实时申请
            package_name: package.to_string(),
            developer_id: info
                .get("publicCompanyId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            file_type: Some(FileType::Apk),
        })
    }

    fn find_by_developer(&self, developer_id: &str) -> Result<Vec<String>, SourceError> {
        let url = format!("{API_BASE}/applicationData/devs/{developer_id}/apps?limit=1000");
        let req = self.http.request(Method::GET, &url).build()?;
        let resp = self.http.execute(req)?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound {
                package: developer_id.to_string(),
            });
        }
        let body = resp.text()?;
        if status != StatusCode::OK {
            return Err(SourceError::Status { status, body });
        }
        let result: Value = serde_json::from_str(&body)?;
        if result.get("code").and_then(Value::as_str) != Some("OK") {
            let message = result
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("devs apps: code != OK");
            return Err(SourceError::Shape(message.to_string()));
        }
        let elements = result
            .pointer("/body/elements")
            .and_then(Value::as_array)
            .ok_or_else(|| SourceError::Shape("devs apps: 缺少 elements".to_string()))?;
        let mut packages = Vec::with_capacity(elements.len());
        for app in elements {
            let package = app
                .get("packageName")
                .and_then(Value::as_str)
                .ok_or_else(|| SourceError::Shape("devs apps: 缺少 packageName".to_string()))?;
            packages.push(package.to_string());
        }
        Ok(packages)
    }

    fn download(&self, version: &Version) -> Result<Box<dyn Read + Send>, SourceError> {
        let info = self.get_app_info(&version.package_name)?;
        let app_id = info
            .get("appId")
            .and_then(Value::as_u64)
            .ok_or_else(|| SourceError::Shape("overallInfo: 缺少 appId".to_string()))?;
        let link = self.get_download_link(app_id)?;
        let req = self.http.request(Method::GET, &link).build()?;
        let resp = self.http.execute(req)?;
        if resp.status() != StatusCode::OK {
            return Err(SourceError::Status {
                status: resp.status(),
                body: String::new(),
            });
        }
        Ok(Box::new(resp))
    }

    /// rustore 偶尔返回把 apk 包在里面的 zip，这里原地换成 apk。
    fn post_download(&self, path: &Path) -> Result<(), SourceError> {
        extract_apk_from_zip(path)
    }
}

fn extract_apk_from_zip(path: &Path) -> Result<(), SourceError> {
    let file = fs::File::open(path)?;
    let mut archive = match zip::ZipArchive::new(file) {
        Ok(archive) => archive,
        // 不是 zip 容器：本身就是 apk 之外的普通下载，不动它
        Err(zip::result::ZipError::InvalidArchive(_)) => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let has_manifest = archive
        .file_names()
        .any(|name| name.eq_ignore_ascii_case("AndroidManifest.xml"));
    if has_manifest {
        // 顶层就有 AndroidManifest.xml：文件已经是 apk，无需解包
        debug!("{} 已是 apk，跳过解包", path.display());
        return Ok(());
    }
    if archive.len() == 0 {
        return Err(SourceError::Shape("empty zip archive".to_string()));
    }

    debug!("从 zip 解出 apk: {}", path.display());
    let out_path = path.with_extension("apk.tmp");
    {
        let mut entry = archive.by_index(0)?;
        let mut out = fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    drop(archive);
    fs::remove_file(path)?;
    fs::rename(&out_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn device_id_shape() {
        let id = generate_device_id();
        let (head, tail) = id.split_once("--").unwrap();
        assert_eq!(head.len(), 16);
        assert_eq!(tail.len(), 10);
        assert!(head.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(tail.chars().all(|c| c.is_ascii_digit()));
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_nested_apk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.apk");
        write_zip(&path, &[("inner.apk", b"fake apk bytes")]);
        extract_apk_from_zip(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"fake apk bytes");
    }

    #[test]
    fn keeps_real_apk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.apk");
        write_zip(&path, &[("AndroidManifest.xml", b"<manifest/>"), ("classes.dex", b"dex")]);
        let before = fs::read(&path).unwrap();
        extract_apk_from_zip(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), before);
    }
}
