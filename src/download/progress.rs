//! 进度条渲染与字节计数。
//!
//! 调度侧只调用 [`Progress`] / [`TaskBar`] 的方法上报事件，渲染细节收在本模块；
//! 测试用隐藏绘制目标，不往终端写任何东西。条的先后顺序只是显示问题，
//! 与 worker 取任务的顺序无关。

use std::io::Read;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::sources::Version;

/// 任务的终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Done,
    NotFound,
    Error,
}

impl TaskStatus {
    fn label(self) -> &'static str {
        match self {
            TaskStatus::Done => "done",
            TaskStatus::NotFound => "not found",
            TaskStatus::Error => "error",
        }
    }
}

pub struct Progress {
    mp: MultiProgress,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            mp: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
        }
    }

    /// 测试 / 静默模式：条存在但不绘制。
    pub fn hidden() -> Self {
        Self {
            mp: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
        }
    }

    /// 开发者扩包发现的新任务：排队占位条。
    pub fn queued(&self, package: &str) -> TaskBar {
        let bar = self.mp.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(package.to_string());
        bar.set_message("[queued]");
        TaskBar { bar }
    }

    /// 解析任务开始。`after` 是它的排队占位条（若有），新条顶替其位置。
    pub fn search(&self, after: Option<&TaskBar>, package: &str, version_code: u64) -> TaskBar {
        let bar = self.insert(after, ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.enable_steady_tick(Duration::from_millis(120));
        if version_code != 0 {
            bar.set_prefix(format!("{package} ({version_code})"));
        } else {
            bar.set_prefix(package.to_string());
        }
        bar.set_message("[search]");
        TaskBar { bar }
    }

    /// 下载任务开始：按字节计数的进度条。`after` 是对应的搜索条（若有）。
    pub fn download(&self, after: Option<&TaskBar>, version: &Version, source_name: &str) -> TaskBar {
        let bar = self.insert(after, ProgressBar::new(version.size));
        bar.set_style(bar_style());
        bar.set_prefix(format!(
            "{} v{} ({}) {}",
            version.package_name, version.name, version.code, source_name
        ));
        TaskBar { bar }
    }

    fn insert(&self, after: Option<&TaskBar>, bar: ProgressBar) -> ProgressBar {
        match after {
            Some(anchor) => {
                let bar = self.mp.insert_after(&anchor.bar, bar);
                anchor.bar.finish_and_clear();
                self.mp.remove(&anchor.bar);
                bar
            }
            None => self.mp.add(bar),
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个任务的进度条句柄。克隆共享同一根条。
#[derive(Clone)]
pub struct TaskBar {
    bar: ProgressBar,
}

impl TaskBar {
    pub fn inc(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    /// 标记终态。条保留在屏幕上，便于最后浏览结果。
    pub fn finish(&self, status: TaskStatus) {
        self.bar.abandon_with_message(format!("[{}]", status.label()));
    }

    #[cfg(test)]
    pub(crate) fn position(&self) -> u64 {
        self.bar.position()
    }
}

/// 包装下载流：每次 read 把读到的字节数累加到进度条。
pub struct ProgressRead<R> {
    inner: R,
    bar: TaskBar,
}

impl<R: Read> ProgressRead<R> {
    pub fn new(inner: R, bar: TaskBar) -> Self {
        Self { inner, bar }
    }
}

impl<R: Read> Read for ProgressRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bar.inc(n as u64);
        Ok(n)
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner} {prefix} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix} {bar:30} {percent:>3}% {bytes}/{total_bytes} {bytes_per_sec} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("##-")
}
