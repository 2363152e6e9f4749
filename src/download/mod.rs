//! 下载调度模块入口。
//!
//! 子模块：
//! - `queue`     — 任务队列与 worker 池（解析任务 / 下载任务）
//! - `admission` — 按源的并发下载准入控制
//! - `progress`  — 进度条渲染与字节计数

pub mod admission;
pub mod progress;
pub mod queue;
