//! 任务队列与 worker 池。
//!
//! 两种任务走同一条队列：解析任务（找版本）与下载任务（取字节流落盘）。
//! worker 处理解析任务时可以继续投递新任务（下载任务、开发者扩包出的
//! 解析任务），所以完成检测用一个共享计数：入队前 +1，处理完 -1。
//! 顺序不能反——worker 正要为后续任务 +1 时计数瞬间归零的话，
//! `wait` 会提前返回。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, bail};
use crossbeam_channel as channel;
use tracing::{debug, error, info, warn};

use super::admission::AdmissionController;
use super::progress::{Progress, ProgressRead, TaskBar, TaskStatus};
use crate::base_system::output_paths::sanitize_file_name;
use crate::resolve::Resolver;
use crate::sources::{Source, Version};

const QUEUE_CAPACITY: usize = 100;

/// 用户可见错误的汇总列表。追加专用，最后一次性打印。
#[derive(Default)]
pub struct ErrorSink {
    entries: Mutex<Vec<String>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: String) {
        error!("{message}");
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

pub struct PackageTask {
    pub package: String,
    /// 0 表示取最新，非零要求精确匹配。
    pub version_code: u64,
    pub bar: Option<TaskBar>,
}

pub struct VersionTask {
    pub version: Version,
    pub source: Arc<dyn Source>,
    pub bar: Option<TaskBar>,
}

/// 任务种类是封闭集合，worker 里用 match 分派。
pub enum Task {
    Package(PackageTask),
    Version(VersionTask),
}

impl Task {
    fn package_name(&self) -> &str {
        match self {
            Task::Package(task) => &task.package,
            Task::Version(task) => &task.version.package_name,
        }
    }
}

#[derive(Default)]
pub struct DownloadOptions {
    pub output_dir: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub force: bool,
    /// 对每个命中的版本，把同开发者的其他应用也加入队列。
    pub expand_developer: bool,
}

struct QueueShared {
    tx: Mutex<Option<channel::Sender<Task>>>,
    pending: Mutex<usize>,
    done: Condvar,
    resolver: Resolver,
    admission: AdmissionController,
    progress: Progress,
    errors: Arc<ErrorSink>,
    options: DownloadOptions,
    processed_packages: Mutex<HashSet<String>>,
    /// 开发者 → 已扩包过的源名，防止同一开发者在同一源上展开两次。
    processed_developers: Mutex<HashMap<String, Vec<String>>>,
}

pub struct TaskQueue {
    shared: Arc<QueueShared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(
        max_workers: usize,
        resolver: Resolver,
        admission: AdmissionController,
        progress: Progress,
        errors: Arc<ErrorSink>,
        options: DownloadOptions,
    ) -> Self {
        let (tx, rx) = channel::bounded::<Task>(QUEUE_CAPACITY);
        let shared = Arc::new(QueueShared {
            tx: Mutex::new(Some(tx)),
            pending: Mutex::new(0),
            done: Condvar::new(),
            resolver,
            admission,
            progress,
            errors,
            options,
            processed_packages: Mutex::new(HashSet::new()),
            processed_developers: Mutex::new(HashMap::new()),
        });

        let workers = (0..max_workers.max(1))
            .map(|_| {
                let shared = shared.clone();
                let rx = rx.clone();
                std::thread::spawn(move || worker_loop(shared, rx))
            })
            .collect();

        Self { shared, workers }
    }

    pub fn submit(&self, task: Task) {
        self.shared.submit(task);
    }

    /// 等全部任务（含处理中追加的）做完，然后关闭队列并回收 worker。
    pub fn wait(self) {
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            while *pending > 0 {
                pending = self
                    .shared
                    .done
                    .wait(pending)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
        // 丢掉唯一的 Sender，worker 的 recv 随之结束
        self.shared
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<QueueShared>, rx: channel::Receiver<Task>) {
    for task in rx.iter() {
        shared
            .processed_packages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.package_name().to_string());
        match task {
            Task::Package(task) => shared.process_package_task(task),
            Task::Version(task) => shared.process_version_task(task),
        }
        shared.finish_one();
    }
}

impl QueueShared {
    fn submit(&self, task: Task) {
        debug!("添加任务: {}", task.package_name());
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            *pending += 1;
        }
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .cloned();
        match tx {
            Some(tx) => {
                if tx.send(task).is_err() {
                    warn!("任务队列已关闭，任务被丢弃");
                    self.finish_one();
                }
            }
            None => {
                warn!("任务队列已关闭，任务被丢弃");
                self.finish_one();
            }
        }
    }

    fn finish_one(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.done.notify_all();
        }
    }

    /// 解析任务：多源竞争找版本，命中则投递下载任务，按需做开发者扩包。
    /// 任务自己兜住所有错误，worker 永远不会因为单个任务挂掉。
    fn process_package_task(&self, task: PackageTask) {
        let bar = self
            .progress
            .search(task.bar.as_ref(), &task.package, task.version_code);

        let (version, source, failures) = self.resolver.resolve(&task.package, task.version_code);
        for failure in &failures {
            self.errors.push(format!(
                "源 {}: 应用 {}: {}",
                failure.source, failure.package, failure.error
            ));
        }
        let Some(source) = source.filter(|_| version.is_found()) else {
            // 干净的"哪里都没有"错误列表为空，这里只会显示 not found
            bar.finish(if failures.is_empty() {
                TaskStatus::NotFound
            } else {
                TaskStatus::Error
            });
            return;
        };

        // 下载任务先入队，开发者扩包随后进行
        self.submit(Task::Version(VersionTask {
            version: version.clone(),
            source: source.clone(),
            bar: Some(bar),
        }));
        self.expand_developer(&version, &source);
    }

    fn expand_developer(&self, version: &Version, source: &Arc<dyn Source>) {
        if !self.options.expand_developer || version.developer_id.is_empty() {
            return;
        }
        {
            let mut seen = self
                .processed_developers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let sources_done = seen.entry(version.developer_id.clone()).or_default();
            if sources_done.iter().any(|name| name == source.name()) {
                return;
            }
            sources_done.push(source.name().to_string());
        }

        debug!(
            "在源 {} 搜索开发者 {} 的应用",
            source.name(),
            version.developer_id
        );
        match source.find_by_developer(&version.developer_id) {
            Ok(packages) => {
                for package in packages {
                    let already = self
                        .processed_packages
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .contains(&package);
                    if already {
                        continue;
                    }
                    debug!(
                        "发现开发者 {} 的应用 {}（源 {}）",
                        version.developer_id,
                        package,
                        source.name()
                    );
                    let bar = self.progress.queued(&package);
                    self.submit(Task::Package(PackageTask {
                        package,
                        version_code: 0,
                        bar: Some(bar),
                    }));
                }
            }
            Err(err) if err.is_unsupported() => {
                debug!("源 {} 不支持按开发者列应用", source.name());
            }
            Err(err) => {
                self.errors.push(format!(
                    "在源 {} 查找开发者 {} 的应用失败: {}",
                    source.name(),
                    version.developer_id,
                    err
                ));
            }
        }
    }

    /// 下载任务：占源名额 → 取流 → 带进度落盘 → 源特定后处理。
    fn process_version_task(&self, task: VersionTask) {
        let bar = self
            .progress
            .download(task.bar.as_ref(), &task.version, task.source.name());
        match self.run_download(&task.version, task.source.as_ref(), &bar) {
            Ok(()) => bar.finish(TaskStatus::Done),
            Err(err) => {
                self.errors.push(format!(
                    "下载 {}（源 {}）失败: {err:#}",
                    task.version.package_name,
                    task.source.name()
                ));
                bar.finish(TaskStatus::Error);
            }
        }
    }

    fn run_download(
        &self,
        version: &Version,
        source: &dyn Source,
        bar: &TaskBar,
    ) -> anyhow::Result<()> {
        let out_file = self.output_path(version)?;
        if out_file.exists() {
            if !self.options.force {
                bail!("文件 {} 已存在，使用 --force 覆盖", out_file.display());
            }
            debug!("文件 {} 已存在，删除重下", out_file.display());
            fs::remove_file(&out_file)
                .with_context(|| format!("删除旧文件 {} 失败", out_file.display()))?;
        }

        info!(
            "开始从源 {} 下载 {} 到 {}",
            source.name(),
            version.package_name,
            out_file.display()
        );
        let _admission = self
            .admission
            .acquire(source.name(), source.max_parallel_downloads());

        let reader = source.download(version)?;
        let mut reader = ProgressRead::new(reader, bar.clone());
        let mut file = fs::File::create(&out_file)
            .with_context(|| format!("创建文件 {} 失败", out_file.display()))?;
        io::copy(&mut reader, &mut file)
            .with_context(|| format!("写入 {} 失败", out_file.display()))?;
        drop(file);

        source.post_download(&out_file)?;
        info!("{} 下载完成", version.package_name);
        Ok(())
    }

    fn output_path(&self, version: &Version) -> anyhow::Result<PathBuf> {
        if let Some(file) = &self.options.output_file {
            return Ok(file.clone());
        }
        let Some(file_type) = version.file_type else {
            bail!("未知文件类型: {}", version.package_name);
        };
        let name = format!(
            "{}-{}-v{}.{}",
            version.package_name, version.name, version.code, file_type
        );
        let name = sanitize_file_name(&name);
        Ok(match &self.options.output_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FileType, SourceError};
    use std::io::{Cursor, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PAYLOAD: &[u8] = b"apk-bytes";

    struct StubSource {
        name: &'static str,
        code: u64,
        developer: &'static str,
        sibling_packages: Vec<String>,
        fail_lookup: bool,
        developer_calls: AtomicUsize,
    }

    impl StubSource {
        fn found(name: &'static str, code: u64) -> Self {
            Self {
                name,
                code,
                developer: "",
                sibling_packages: Vec::new(),
                fail_lookup: false,
                developer_calls: AtomicUsize::new(0),
            }
        }

        fn with_developer(mut self, developer: &'static str, siblings: &[&str]) -> Self {
            self.developer = developer;
            self.sibling_packages = siblings.iter().map(|s| s.to_string()).collect();
            self
        }

        fn failing(name: &'static str) -> Self {
            Self {
                fail_lookup: true,
                ..Self::found(name, 0)
            }
        }
    }

    impl Source for StubSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn find_by_package(&self, package: &str, version_code: u64) -> Result<Version, SourceError> {
            if self.fail_lookup {
                return Err(SourceError::Shape("boom".to_string()));
            }
            if self.code == 0 || (version_code != 0 && version_code != self.code) {
                return Err(SourceError::NotFound {
                    package: package.to_string(),
                });
            }
            Ok(Version {
                name: format!("{}.0", self.code),
                code: self.code,
                size: PAYLOAD.len() as u64,
                link: format!("/{package}.apk"),
                package_name: package.to_string(),
                developer_id: self.developer.to_string(),
                file_type: Some(FileType::Apk),
            })
        }

        fn find_by_developer(&self, _developer_id: &str) -> Result<Vec<String>, SourceError> {
            self.developer_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.sibling_packages.clone())
        }

        fn download(&self, _version: &Version) -> Result<Box<dyn Read + Send>, SourceError> {
            Ok(Box::new(Cursor::new(PAYLOAD.to_vec())))
        }
    }

    fn make_queue(
        sources: Vec<Arc<dyn Source>>,
        options: DownloadOptions,
        workers: usize,
    ) -> (TaskQueue, Arc<ErrorSink>) {
        let errors = Arc::new(ErrorSink::new());
        let queue = TaskQueue::new(
            workers,
            Resolver::new(sources),
            AdmissionController::new(),
            Progress::hidden(),
            errors.clone(),
            options,
        );
        (queue, errors)
    }

    fn package_task(package: &str, version_code: u64) -> Task {
        Task::Package(PackageTask {
            package: package.to_string(),
            version_code,
            bar: None,
        })
    }

    #[test]
    fn resolves_and_downloads_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let options = DownloadOptions {
            output_dir: Some(dir.path().to_path_buf()),
            ..DownloadOptions::default()
        };
        let (queue, errors) = make_queue(vec![Arc::new(StubSource::found("stub", 7))], options, 2);
        queue.submit(package_task("org.example.app", 0));
        queue.wait();

        let out = dir.path().join("org.example.app-7.0-v7.apk");
        assert_eq!(fs::read(&out).unwrap(), PAYLOAD);
        assert!(errors.snapshot().is_empty());
    }

    #[test]
    fn dynamic_fan_out_completes_before_wait_returns() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(
            StubSource::found("stub", 3).with_developer("dev1", &["org.example.b", "org.example.c"]),
        );
        let options = DownloadOptions {
            output_dir: Some(dir.path().to_path_buf()),
            expand_developer: true,
            ..DownloadOptions::default()
        };
        let (queue, errors) = make_queue(vec![stub.clone()], options, 3);
        queue.submit(package_task("org.example.a", 0));
        queue.wait();

        // wait 返回时 1 + 2 个任务的产物必须都已落盘
        for package in ["org.example.a", "org.example.b", "org.example.c"] {
            let out = dir.path().join(format!("{package}-3.0-v3.apk"));
            assert!(out.exists(), "{package} should be downloaded");
        }
        assert!(errors.snapshot().is_empty());
        // 同一 (开发者, 源) 只扩包一次
        assert_eq!(stub.developer_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_found_everywhere_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = DownloadOptions {
            output_dir: Some(dir.path().to_path_buf()),
            ..DownloadOptions::default()
        };
        let (queue, errors) = make_queue(vec![Arc::new(StubSource::found("stub", 0))], options, 2);
        queue.submit(package_task("org.example.missing", 0));
        queue.wait();

        assert!(errors.snapshot().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn lookup_failure_is_recorded_and_worker_survives() {
        let dir = tempfile::tempdir().unwrap();
        let options = DownloadOptions {
            output_dir: Some(dir.path().to_path_buf()),
            ..DownloadOptions::default()
        };
        let (queue, errors) = make_queue(vec![Arc::new(StubSource::failing("bad"))], options, 1);
        queue.submit(package_task("org.example.first", 0));
        queue.submit(package_task("org.example.second", 0));
        queue.wait();

        // 两个任务都被同一个 worker 处理完：单个任务失败不会杀死 worker
        let collected = errors.snapshot();
        assert_eq!(collected.len(), 2);
        assert!(collected[0].contains("bad"));
    }

    #[test]
    fn existing_file_without_force_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("org.example.app-7.0-v7.apk");
        fs::write(&out, b"old").unwrap();

        let options = DownloadOptions {
            output_dir: Some(dir.path().to_path_buf()),
            ..DownloadOptions::default()
        };
        let (queue, errors) = make_queue(vec![Arc::new(StubSource::found("stub", 7))], options, 1);
        queue.submit(package_task("org.example.app", 0));
        queue.wait();

        assert_eq!(fs::read(&out).unwrap(), b"old");
        assert_eq!(errors.snapshot().len(), 1);
    }

    #[test]
    fn existing_file_with_force_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("org.example.app-7.0-v7.apk");
        fs::write(&out, b"old").unwrap();

        let options = DownloadOptions {
            output_dir: Some(dir.path().to_path_buf()),
            force: true,
            ..DownloadOptions::default()
        };
        let (queue, errors) = make_queue(vec![Arc::new(StubSource::found("stub", 7))], options, 1);
        queue.submit(package_task("org.example.app", 0));
        queue.wait();

        assert_eq!(fs::read(&out).unwrap(), PAYLOAD);
        assert!(errors.snapshot().is_empty());
    }

    #[test]
    fn pinned_version_code_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let options = DownloadOptions {
            output_dir: Some(dir.path().to_path_buf()),
            ..DownloadOptions::default()
        };
        let (queue, errors) = make_queue(vec![Arc::new(StubSource::found("stub", 7))], options, 1);
        queue.submit(package_task("org.example.app", 8));
        queue.wait();

        assert!(errors.snapshot().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn wait_returns_immediately_with_no_tasks() {
        let (queue, errors) = make_queue(
            vec![Arc::new(StubSource::found("stub", 1))],
            DownloadOptions::default(),
            2,
        );
        queue.wait();
        assert!(errors.snapshot().is_empty());
    }
}
