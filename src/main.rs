//! apkd：从多个应用商店源下载 APK 的命令行工具。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/输出路径等基础设施
//! - `network`：带重试与退避的 HTTP 客户端
//! - `sources`：源抽象与各商店适配（fdroid / rustore）
//! - `resolve`：多源并发解析，版本号最大者胜出
//! - `download`：任务队列、worker 池、准入控制与进度条

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::warn;

mod base_system;
mod download;
mod network;
mod resolve;
mod sources;

use base_system::config::load_or_create;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use base_system::output_paths::sanitized_absolute;
use download::admission::AdmissionController;
use download::progress::Progress;
use download::queue::{DownloadOptions, ErrorSink, PackageTask, Task, TaskQueue};
use network::{NetSettings, RetryPolicy};
use resolve::Resolver;
use sources::SourceRegistry;
use sources::fdroid::FDroid;
use sources::rustore::RuStore;

#[derive(Debug, Parser)]
#[command(name = "apkd")]
#[command(about = "从多个应用商店源下载 APK", version)]
struct Cli {
    /// 应用包名，可多次指定；`包名:versionCode` 可锁定版本
    #[arg(short = 'p', long = "package")]
    packages: Vec<String>,

    /// 包名列表文件，一行一个，`#` 开头为注释
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// 只使用指定源，可多次指定
    #[arg(short = 's', long = "source")]
    sources: Vec<String>,

    /// 同时下载该开发者的全部应用
    #[arg(long = "dev", default_value_t = false)]
    dev: bool,

    /// 目标文件已存在时强制覆盖
    #[arg(short = 'F', long = "force", default_value_t = false)]
    force: bool,

    /// 下载输出目录
    #[arg(short = 'O', long = "output-dir")]
    output_dir: Option<String>,

    /// 输出文件名（只支持单个包）
    #[arg(short = 'o', long = "output-file")]
    output_file: Option<String>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log = LogSystem::init(LogOptions {
        debug: cli.debug,
        console: cli.debug,
    })?;
    let config = load_or_create::<Config>(None).map_err(|e| anyhow!(e.to_string()))?;

    let packages = collect_packages(&cli)?;
    if packages.is_empty() {
        bail!("未指定包名，使用 --package 或 --file");
    }

    let errors = Arc::new(ErrorSink::new());
    let cancel = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(errors.clone(), cancel.clone())?;

    let net = NetSettings {
        timeout: Duration::from_secs(config.request_timeout),
        retry: RetryPolicy {
            max_attempts: config.max_retries,
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
            ..RetryPolicy::default()
        },
        cancel: Some(cancel),
    };

    let registry = build_registry(&net)?;
    let active = registry.select(&cli.sources);
    if active.is_empty() {
        bail!("没有可用的源，检查 --source 参数");
    }

    let options = DownloadOptions {
        output_dir: prepare_output_dir(cli.output_dir.as_deref())?,
        output_file: prepare_output_file(cli.output_file.as_deref(), packages.len())?,
        force: cli.force,
        expand_developer: cli.dev,
    };

    let queue = TaskQueue::new(
        config.max_workers,
        Resolver::new(active),
        AdmissionController::new(),
        Progress::new(),
        errors.clone(),
        options,
    );
    for (package, version_code) in packages {
        queue.submit(Task::Package(PackageTask {
            package,
            version_code,
            bar: None,
        }));
    }
    queue.wait();

    print_error_summary(&errors.snapshot());
    Ok(())
}

fn install_interrupt_handler(errors: Arc<ErrorSink>, cancel: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
        // 立即退出：不等在途下载收尾，只把已收集的错误刷出来
        print_error_summary(&errors.snapshot());
        std::process::exit(130);
    })
    .context("安装中断处理失败")
}

fn build_registry(net: &NetSettings) -> Result<SourceRegistry> {
    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(FDroid::new(net)?))?;
    registry.register(Arc::new(RuStore::new(net)?))?;
    Ok(registry)
}

/// 合并 `--package` 与 `--file` 的包名，解析 `包名:versionCode`。
/// 重复的包名后出现者生效。
fn collect_packages(cli: &Cli) -> Result<Vec<(String, u64)>> {
    let mut specs = cli.packages.clone();
    if let Some(file) = &cli.file {
        let raw = fs::read_to_string(file)
            .with_context(|| format!("读取包名列表 {} 失败", file.display()))?;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            specs.push(line.to_string());
        }
    }

    let mut packages: Vec<(String, u64)> = Vec::with_capacity(specs.len());
    for spec in specs {
        let (name, version_code) = match spec.split_once(':') {
            Some((name, code)) => {
                let code: u64 = code
                    .parse()
                    .with_context(|| format!("包 {name} 的 versionCode 无效: {code}"))?;
                (name.to_string(), code)
            }
            None => (spec, 0),
        };
        if name.is_empty() {
            bail!("包名不能为空");
        }
        if let Some(existing) = packages.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = version_code;
        } else {
            packages.push((name, version_code));
        }
    }
    Ok(packages)
}

fn prepare_output_dir(output_dir: Option<&str>) -> Result<Option<PathBuf>> {
    let Some(dir) = output_dir else {
        return Ok(None);
    };
    let (path, warning) = sanitized_absolute(dir)?;
    if let Some(warning) = warning {
        warn!("{warning}");
    }
    match fs::metadata(&path) {
        Ok(meta) if !meta.is_dir() => bail!("输出路径 {} 不是目录", path.display()),
        Ok(_) => {}
        Err(_) => fs::create_dir_all(&path)
            .with_context(|| format!("创建输出目录 {} 失败", path.display()))?,
    }
    Ok(Some(path))
}

fn prepare_output_file(output_file: Option<&str>, package_count: usize) -> Result<Option<PathBuf>> {
    let Some(file) = output_file else {
        return Ok(None);
    };
    if package_count > 1 {
        bail!("下载多个包时不支持 --output-file");
    }
    let (path, warning) = sanitized_absolute(file)?;
    if let Some(warning) = warning {
        warn!("{warning}");
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_dir(parent)?;
    }
    Ok(Some(path))
}

fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("创建目录 {} 失败", path.display()))
}

fn print_error_summary(errors: &[String]) {
    if errors.is_empty() {
        return;
    }
    println!("\n错误:");
    for error in errors {
        println!("- {error}");
    }
}
