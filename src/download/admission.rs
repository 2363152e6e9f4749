//! 按源的并发下载准入控制。
//!
//! 每个源一个在途计数，上限由源自己声明（默认 1）。计数与锁都在首次使用时
//! 创建，之后不回收。`acquire` 固定间隔轮询直到有空位——与原始实现保持
//! 行为一致，不改成条件变量。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct SourceSlot {
    in_flight: Mutex<usize>,
}

#[derive(Default)]
pub struct AdmissionController {
    slots: Mutex<HashMap<String, Arc<SourceSlot>>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, source: &str) -> Arc<SourceSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(source.to_string()).or_default().clone()
    }

    /// 阻塞到 `source` 的在途下载数低于 `max`，随后占一个名额。
    /// 返回的守卫在 drop 时归还名额，任何退出路径都不会漏还。
    pub fn acquire(&self, source: &str, max: usize) -> AdmissionGuard {
        let max = max.max(1);
        let slot = self.slot(source);
        let mut waited = false;
        loop {
            {
                let mut in_flight = slot.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if *in_flight < max {
                    *in_flight += 1;
                    break;
                }
            }
            if !waited {
                debug!("源 {source} 并发已满（{max}），等待空位");
                waited = true;
            }
            thread::sleep(POLL_INTERVAL);
        }
        AdmissionGuard { slot }
    }
}

pub struct AdmissionGuard {
    slot: Arc<SourceSlot>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        let mut in_flight = self.slot.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *in_flight = in_flight.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn caps_concurrency_per_source() {
        let controller = Arc::new(AdmissionController::new());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let controller = controller.clone();
                let current = current.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    let guard = controller.acquire("store", 2);
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(150));
                    current.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "at most 2 inside at once");
        assert_eq!(current.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn release_admits_exactly_one_waiter() {
        let controller = Arc::new(AdmissionController::new());
        let first = controller.acquire("store", 1);

        let entered = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let controller = controller.clone();
                let entered = entered.clone();
                thread::spawn(move || {
                    let guard = controller.acquire("store", 1);
                    entered.fetch_add(1, Ordering::SeqCst);
                    // 占住名额，验证一次释放只放行一个
                    thread::sleep(Duration::from_millis(400));
                    drop(guard);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(250));
        assert_eq!(entered.load(Ordering::SeqCst), 0, "max=1 is held");

        drop(first);
        thread::sleep(Duration::from_millis(250));
        assert_eq!(entered.load(Ordering::SeqCst), 1, "one waiter admitted");

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn sources_do_not_share_slots() {
        let controller = AdmissionController::new();
        let a = controller.acquire("alpha", 1);
        // 另一个源不受 alpha 的占用影响，立刻返回
        let b = controller.acquire("beta", 1);
        drop(a);
        drop(b);
    }
}
