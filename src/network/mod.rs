//! 带重试的 HTTP 客户端。
//!
//! 包装 `reqwest::blocking::Client`：按重试策略决定是否重试，
//! 两次尝试之间做满抖动（full jitter）指数退避，退避睡眠可被取消标志打断。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use reqwest::blocking::{Client, Request, Response};
use reqwest::header::HeaderMap;
use tracing::{debug, warn};

static REQ_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> u64 {
    REQ_SEQ.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("request canceled")]
    Canceled,
}

/// 重试决策：由决策函数返回。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    No,
    Yes,
    UseDefault,
}

/// 决策函数签名：(请求, 响应, 错误, 当前尝试序号（1 起）, 最大尝试次数)。
pub type RetryDecider = Arc<
    dyn Fn(&Request, Option<&Response>, Option<&reqwest::Error>, usize, usize) -> RetryDecision
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）。
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retry_status: Vec<StatusCode>,
    /// 客户端级决策函数；单次调用传入的决策函数优先于它。
    pub retry_if: Option<RetryDecider>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            retry_status: vec![
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
            retry_if: None,
        }
    }
}

/// 构造各源 HTTP 客户端所需的公共网络参数。
#[derive(Clone)]
pub struct NetSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl NetSettings {
    pub fn client(&self, default_headers: HeaderMap) -> Result<HttpClient, HttpError> {
        let inner = Client::builder()
            .timeout(self.timeout)
            .default_headers(default_headers)
            .build()?;
        Ok(HttpClient {
            inner,
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
        })
    }
}

pub struct HttpClient {
    inner: Client,
    retry: RetryPolicy,
    cancel: Option<Arc<AtomicBool>>,
}

impl HttpClient {
    /// 构造 `Request` 用。建好的请求交给 [`HttpClient::execute`] 发送。
    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::blocking::RequestBuilder {
        self.inner.request(method, url)
    }

    pub fn execute(&self, req: Request) -> Result<Response, HttpError> {
        self.execute_with(req, None)
    }

    /// 发送请求，`retry_if` 为单次调用的决策函数，优先于客户端级决策函数。
    pub fn execute_with(
        &self,
        req: Request,
        retry_if: Option<&RetryDecider>,
    ) -> Result<Response, HttpError> {
        let req_id = next_request_id();
        debug!("[req-{req_id}] 发送请求: {} {}", req.method(), req.url());

        let Some(mut attempt_req) = req.try_clone() else {
            // 流式 body 无法重放，只发一次
            return Ok(self.inner.execute(req)?);
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let decider = retry_if.or(self.retry.retry_if.as_ref());
        let mut last: Option<Result<Response, reqwest::Error>> = None;

        for attempt in 1..=max_attempts {
            let result = self.inner.execute(attempt_req);
            match &result {
                Ok(resp) => debug!("[req-{req_id}] 收到响应: {}", resp.status()),
                Err(err) => debug!("[req-{req_id}] 请求失败: {err}"),
            }

            if !self.should_retry(&req, &result, attempt, max_attempts, decider) {
                return Ok(result?);
            }

            let reason = match &result {
                Ok(resp) => format!("status code: {}", resp.status().as_u16()),
                Err(err) => format!("error: {err}"),
            };
            last = Some(result);

            let delay = full_jitter(backoff_delay(
                self.retry.base_delay_ms,
                self.retry.max_delay_ms,
                attempt,
            ));
            warn!(
                "[req-{req_id}] 第 {attempt}/{max_attempts} 次尝试失败（{reason}），{delay:?} 后重试"
            );
            self.sleep_cancellable(delay)?;

            attempt_req = match req.try_clone() {
                Some(r) => r,
                None => break,
            };
        }

        // 尝试耗尽：最后一次是传输错误就返回错误，是坏状态码就原样返回响应，
        // 调用方必须自行检查状态码。
        match last {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(err)) => Err(err.into()),
            None => Err(HttpError::Canceled),
        }
    }

    fn should_retry(
        &self,
        req: &Request,
        result: &Result<Response, reqwest::Error>,
        attempt: usize,
        max_attempts: usize,
        decider: Option<&RetryDecider>,
    ) -> bool {
        let (resp, err) = match result {
            Ok(resp) => (Some(resp), None),
            Err(err) => (None, Some(err)),
        };
        if let Some(decider) = decider {
            match decider(req, resp, err, attempt, max_attempts) {
                RetryDecision::Yes => return true,
                RetryDecision::No => return false,
                RetryDecision::UseDefault => {}
            }
        }
        default_decision(&self.retry.retry_status, resp, err, attempt, max_attempts)
            == RetryDecision::Yes
    }

    fn sleep_cancellable(&self, total: Duration) -> Result<(), HttpError> {
        const STEP: Duration = Duration::from_millis(50);
        let mut remaining = total;
        loop {
            if let Some(flag) = &self.cancel
                && flag.load(Ordering::Relaxed)
            {
                return Err(HttpError::Canceled);
            }
            if remaining.is_zero() {
                return Ok(());
            }
            let chunk = remaining.min(STEP);
            thread::sleep(chunk);
            remaining = remaining.saturating_sub(chunk);
        }
    }
}

/// 默认决策：尝试耗尽不重试；超时类传输错误重试；可重试状态码重试；其余不重试。
pub fn default_decision(
    retry_status: &[StatusCode],
    resp: Option<&Response>,
    err: Option<&reqwest::Error>,
    attempt: usize,
    max_attempts: usize,
) -> RetryDecision {
    if attempt >= max_attempts {
        return RetryDecision::No;
    }
    if let Some(err) = err {
        if err.is_timeout() {
            return RetryDecision::Yes;
        }
        return RetryDecision::No;
    }
    if let Some(resp) = resp
        && retry_status.contains(&resp.status())
    {
        return RetryDecision::Yes;
    }
    RetryDecision::No
}

/// 第 n 次尝试（1 起）的退避上限：`min(max_delay, base * 2^(n-1))`。
pub fn backoff_delay(base_delay_ms: u64, max_delay_ms: u64, attempt: usize) -> Duration {
    let attempt = attempt.max(1);
    let shift = (attempt - 1).min(32) as u32;
    let exp = base_delay_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(exp.min(max_delay_ms))
}

/// 满抖动：实际睡眠取 `[0, delay)` 内的均匀值。
///
/// 抖动来自时钟纳秒（避免引入 rand 依赖）。
pub fn full_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let bucket = (nanos % 10_000) as f64 / 10_000.0; // [0,1)
    delay.mul_f64(bucket)
}
