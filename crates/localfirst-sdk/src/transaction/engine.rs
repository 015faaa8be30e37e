//! 补偿事务引擎
//!
//! 一个事务由若干顺序执行的步骤组成，每个步骤可以带补偿函数和重试配置：
//! - 同一事务同一时刻只允许一个步骤在执行
//! - 整体超时从第一个步骤开始计时，不按步骤重置；超时或外部取消通过
//!   `CancellationToken` 通知正在执行的步骤
//! - 任一步骤最终失败时，按完成顺序的逆序（LIFO）执行已完成步骤的补偿；
//!   所有补偿都会尝试，失败会被汇总
//!
//! 状态流转：`pending -> running -> committed | rolled-back | failed`

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{LocalFirstError, Result};
use crate::events::{emit_opt, EventCategory, EventManager, EventPriority};
use crate::transaction::retry_policy::RetryConfig;

/// 默认整体超时（毫秒）
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 30_000;

/// 事务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStatus {
    Pending,
    Running,
    Committed,
    RolledBack,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Running => "running",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled-back",
            TransactionStatus::Failed => "failed",
        }
    }

    /// 是否已经结束
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::RolledBack | TransactionStatus::Failed
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 事务选项
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub id: Option<String>,
    /// 整体超时（毫秒），None 使用默认值，0 表示不限时
    pub timeout_ms: Option<u64>,
    /// 外部取消信号
    pub signal: Option<CancellationToken>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

type CompensateFn<R> = Box<dyn FnOnce(R) -> BoxFuture<'static, Result<()>> + Send>;
type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// 单个步骤的选项
pub struct StepOptions<R> {
    compensate: Option<CompensateFn<R>>,
    retry: Option<RetryConfig>,
    signal: Option<CancellationToken>,
}

impl<R> Default for StepOptions<R> {
    fn default() -> Self {
        Self {
            compensate: None,
            retry: None,
            signal: None,
        }
    }
}

impl<R: Send + 'static> StepOptions<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 补偿函数，回滚时以该步骤的结果调用
    pub fn compensate<F, Fut>(mut self, compensate: F) -> Self
    where
        F: FnOnce(R) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensate = Some(Box::new(move |result| compensate(result).boxed()));
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// 仅作用于本步骤的取消信号
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

#[derive(Debug, Clone)]
enum AbortReason {
    Timeout,
    Cancelled(String),
}

struct CompletedStep {
    id: String,
    compensation: Option<Compensation>,
}

struct TxState {
    status: TransactionStatus,
    completed: Vec<CompletedStep>,
    started_at: Option<Instant>,
    deadline: Option<JoinHandle<()>>,
    next_step: usize,
}

/// 正在执行的步骤标记，离开作用域时清除
struct StepGuard<'a>(&'a AtomicBool);

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Attempt<R> {
    Finished(Result<R>),
    Aborted(LocalFirstError),
}

pub struct Transaction {
    id: String,
    timeout_ms: u64,
    token: CancellationToken,
    abort_reason: Arc<Mutex<Option<AbortReason>>>,
    state: Mutex<TxState>,
    step_in_flight: AtomicBool,
    events: Option<Arc<EventManager>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("completed_steps", &self.completed_steps())
            .finish()
    }
}

impl Transaction {
    /// 创建事务（状态为 pending，第一个步骤开始时才启动超时计时）
    pub fn start(options: TransactionOptions, events: Option<Arc<EventManager>>) -> Self {
        let id = options
            .id
            .unwrap_or_else(|| format!("tx-{}", uuid::Uuid::new_v4()));
        let timeout_ms = options.timeout_ms.unwrap_or(DEFAULT_TRANSACTION_TIMEOUT_MS);
        let token = match &options.signal {
            Some(signal) => signal.child_token(),
            None => CancellationToken::new(),
        };

        let tx = Self {
            id,
            timeout_ms,
            token,
            abort_reason: Arc::new(Mutex::new(None)),
            state: Mutex::new(TxState {
                status: TransactionStatus::Pending,
                completed: Vec::new(),
                started_at: None,
                deadline: None,
                next_step: 0,
            }),
            step_in_flight: AtomicBool::new(false),
            events,
        };

        debug!("事务 {} 已创建 (timeout={}ms)", tx.id, tx.timeout_ms);
        tx.emit("start", EventPriority::Normal, serde_json::json!({ "timeoutMs": tx.timeout_ms }));
        tx
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    /// 尚未补偿/提交的已完成步骤数
    pub fn completed_steps(&self) -> usize {
        self.state.lock().completed.len()
    }

    /// 从第一个步骤开始经过的时间
    pub fn elapsed(&self) -> Duration {
        self.state
            .lock()
            .started_at
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// 中止当前步骤；下一次 `run` 也会立即失败并触发回滚
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut abort_reason = self.abort_reason.lock();
            if abort_reason.is_none() {
                *abort_reason = Some(AbortReason::Cancelled(reason.clone()));
            }
        }
        info!("事务 {} 被取消: {}", self.id, reason);
        self.token.cancel();
    }

    /// 执行一个步骤
    ///
    /// 步骤函数收到事务的取消信号，应在信号触发后尽快返回。失败时先回滚
    /// 已完成的步骤再返回错误：回滚全部成功返回原始错误，否则返回
    /// [`LocalFirstError::CompensationFailed`]。
    pub async fn run<F, Fut, R>(&self, mut step: F, options: StepOptions<R>) -> Result<R>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<R>>,
        R: Clone + Send + 'static,
    {
        if self.step_in_flight.swap(true, Ordering::SeqCst) {
            return Err(self.state_error("running (step in flight)", "run"));
        }
        let _guard = StepGuard(&self.step_in_flight);

        let step_id = self.begin_step()?;
        let retry = options.retry.unwrap_or_default();
        let step_signal = options.signal;

        debug!("事务 {} 步骤 {} 开始", self.id, step_id);
        self.emit("step-start", EventPriority::Low, serde_json::json!({ "stepId": step_id }));

        let mut errors = Vec::new();
        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;

            if let Some(error) = self.pending_abort(step_signal.as_ref()) {
                break Err(error);
            }

            // 步骤 panic 按普通失败处理，之后照常重试或回滚
            let attempt_future = match catch_unwind(AssertUnwindSafe(|| step(self.token.child_token()))) {
                Ok(future) => AssertUnwindSafe(future)
                    .catch_unwind()
                    .map(|result| result.unwrap_or_else(|_| Err(step_panicked(&step_id))))
                    .left_future(),
                Err(_) => futures::future::ready(Err(step_panicked(&step_id))).right_future(),
            };

            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => Attempt::Aborted(self.abort_error()),
                _ = wait_cancelled(step_signal.as_ref()) => Attempt::Aborted(self.step_aborted_error()),
                result = attempt_future => Attempt::Finished(result),
            };

            match result {
                Attempt::Finished(Ok(value)) => break Ok(value),
                // 超时与取消不重试
                Attempt::Aborted(error) => break Err(error),
                Attempt::Finished(Err(error)) => {
                    warn!(
                        "事务 {} 步骤 {} 第 {} 次尝试失败: {}",
                        self.id, step_id, attempt, error
                    );
                    errors.push(error);
                    if !retry.should_retry(attempt) {
                        break Err(exhausted(&retry, attempt, errors));
                    }

                    let delay = retry.delay_for_attempt(attempt);
                    self.emit(
                        "step-retry",
                        EventPriority::Normal,
                        serde_json::json!({
                            "stepId": step_id,
                            "attempt": attempt,
                            "delayMs": delay.as_millis() as u64,
                        }),
                    );

                    let interrupted = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => Some(self.abort_error()),
                        _ = wait_cancelled(step_signal.as_ref()) => Some(self.step_aborted_error()),
                        _ = tokio::time::sleep(delay) => None,
                    };
                    if let Some(error) = interrupted {
                        break Err(error);
                    }
                }
            }
        };

        match outcome {
            Ok(value) => {
                let compensation = options.compensate.map(|compensate| {
                    let result = value.clone();
                    Box::new(move || compensate(result)) as Compensation
                });
                self.state.lock().completed.push(CompletedStep {
                    id: step_id.clone(),
                    compensation,
                });
                debug!("事务 {} 步骤 {} 完成 (attempts={})", self.id, step_id, attempt);
                self.emit(
                    "step-success",
                    EventPriority::Low,
                    serde_json::json!({ "stepId": step_id, "attempts": attempt }),
                );
                Ok(value)
            }
            Err(cause) => {
                warn!("事务 {} 步骤 {} 失败: {}", self.id, step_id, cause);
                self.emit(
                    "step-failed",
                    EventPriority::High,
                    serde_json::json!({
                        "stepId": step_id,
                        "attempts": attempt,
                        "code": cause.code(),
                        "message": cause.to_string(),
                    }),
                );
                Err(self.rollback(cause).await)
            }
        }
    }

    /// 提交事务；已提交时再次调用直接返回
    pub fn commit(&self) -> Result<()> {
        if self.step_in_flight.load(Ordering::SeqCst) {
            return Err(self.state_error("running (step in flight)", "commit"));
        }

        let mut state = self.state.lock();
        match state.status {
            TransactionStatus::Committed => Ok(()),
            TransactionStatus::Pending | TransactionStatus::Running => {
                state.status = TransactionStatus::Committed;
                if let Some(deadline) = state.deadline.take() {
                    deadline.abort();
                }
                let steps = state.completed.len();
                state.completed.clear();
                drop(state);

                info!("事务 {} 已提交 ({} 个步骤)", self.id, steps);
                self.emit("commit", EventPriority::Normal, serde_json::json!({ "steps": steps }));
                Ok(())
            }
            status => Err(self.state_error(status.as_str(), "commit")),
        }
    }

    /// 检查状态并在第一个步骤时启动超时计时，返回步骤 id
    fn begin_step(&self) -> Result<String> {
        let mut state = self.state.lock();
        match state.status {
            TransactionStatus::Pending => {
                state.status = TransactionStatus::Running;
                state.started_at = Some(Instant::now());
                state.deadline = self.spawn_deadline();
            }
            TransactionStatus::Running => {}
            status => return Err(self.state_error(status.as_str(), "run")),
        }
        let index = state.next_step;
        state.next_step += 1;
        Ok(format!("{}-step-{}", self.id, index))
    }

    fn spawn_deadline(&self) -> Option<JoinHandle<()>> {
        if self.timeout_ms == 0 {
            return None;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("事务 {} 不在异步运行时中，超时不生效", self.id);
            return None;
        };

        let token = self.token.clone();
        let abort_reason = self.abort_reason.clone();
        let events = self.events.clone();
        let id = self.id.clone();
        let timeout_ms = self.timeout_ms;

        Some(runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    {
                        let mut reason = abort_reason.lock();
                        if reason.is_none() {
                            *reason = Some(AbortReason::Timeout);
                        }
                    }
                    warn!("事务 {} 超时 ({}ms)", id, timeout_ms);
                    emit_opt(
                        &events,
                        EventCategory::Tx,
                        "timeout",
                        EventPriority::High,
                        serde_json::json!({ "transactionId": id, "timeoutMs": timeout_ms }),
                    );
                    token.cancel();
                }
            }
        }))
    }

    /// 按完成顺序的逆序执行补偿
    async fn rollback(&self, cause: LocalFirstError) -> LocalFirstError {
        let completed = {
            let mut state = self.state.lock();
            if let Some(deadline) = state.deadline.take() {
                deadline.abort();
            }
            std::mem::take(&mut state.completed)
        };
        let completed_steps = completed.len();

        info!(
            "事务 {} 开始回滚 {} 个步骤 (原因: {})",
            self.id, completed_steps, cause
        );
        self.emit(
            "rollback",
            EventPriority::High,
            serde_json::json!({ "steps": completed_steps, "code": cause.code() }),
        );

        let mut failures = Vec::new();
        for step in completed.into_iter().rev() {
            let Some(compensation) = step.compensation else { continue };
            debug!("事务 {} 补偿步骤 {}", self.id, step.id);

            let result = match catch_unwind(AssertUnwindSafe(compensation)) {
                Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(LocalFirstError::Other(format!("补偿函数 panic: {}", step.id))),
                },
                Err(_) => Err(LocalFirstError::Other(format!("补偿函数 panic: {}", step.id))),
            };

            if let Err(e) = result {
                error!("事务 {} 步骤 {} 补偿失败: {}", self.id, step.id, e);
                self.emit(
                    "compensation-failed",
                    EventPriority::Critical,
                    serde_json::json!({ "stepId": step.id, "message": e.to_string() }),
                );
                failures.push(e);
            }
        }

        if failures.is_empty() {
            self.state.lock().status = TransactionStatus::RolledBack;
            info!("事务 {} 已回滚", self.id);
            self.emit("rolled-back", EventPriority::Normal, serde_json::json!({ "steps": completed_steps }));
            cause
        } else {
            self.state.lock().status = TransactionStatus::Failed;
            error!(
                "事务 {} 回滚不完整: {}/{} 个补偿失败",
                self.id,
                failures.len(),
                completed_steps
            );
            self.emit(
                "failed",
                EventPriority::Critical,
                serde_json::json!({ "failures": failures.len(), "steps": completed_steps }),
            );
            LocalFirstError::CompensationFailed {
                failures,
                completed_steps,
            }
        }
    }

    /// 尝试开始前已经触发的取消
    fn pending_abort(&self, step_signal: Option<&CancellationToken>) -> Option<LocalFirstError> {
        if self.token.is_cancelled() {
            return Some(self.abort_error());
        }
        if step_signal.map(|s| s.is_cancelled()).unwrap_or(false) {
            return Some(self.step_aborted_error());
        }
        None
    }

    fn abort_error(&self) -> LocalFirstError {
        match self.abort_reason.lock().clone() {
            Some(AbortReason::Timeout) => LocalFirstError::TransactionTimeout {
                transaction_id: self.id.clone(),
                timeout_ms: self.timeout_ms,
            },
            Some(AbortReason::Cancelled(reason)) => LocalFirstError::TransactionAborted {
                transaction_id: self.id.clone(),
                reason,
            },
            None => LocalFirstError::TransactionAborted {
                transaction_id: self.id.clone(),
                reason: "cancelled by external signal".to_string(),
            },
        }
    }

    fn step_aborted_error(&self) -> LocalFirstError {
        LocalFirstError::TransactionAborted {
            transaction_id: self.id.clone(),
            reason: "step signal cancelled".to_string(),
        }
    }

    fn state_error(&self, status: &str, operation: &str) -> LocalFirstError {
        LocalFirstError::TransactionState {
            transaction_id: self.id.clone(),
            status: status.to_string(),
            operation: operation.to_string(),
        }
    }

    fn emit(&self, event_type: &str, priority: EventPriority, mut data: serde_json::Value) {
        if self.events.is_none() {
            return;
        }
        if let Some(map) = data.as_object_mut() {
            map.insert("transactionId".to_string(), serde_json::Value::String(self.id.clone()));
        }
        emit_opt(&self.events, EventCategory::Tx, event_type, priority, data);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(deadline) = self.state.get_mut().deadline.take() {
            deadline.abort();
        }
    }
}

async fn wait_cancelled(signal: Option<&CancellationToken>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

fn step_panicked(step_id: &str) -> LocalFirstError {
    error!("步骤 {} panic", step_id);
    LocalFirstError::Other(format!("步骤函数 panic: {}", step_id))
}

/// 只有配置了重试时才包装成 RetryExhausted
fn exhausted(retry: &RetryConfig, attempts: u32, mut errors: Vec<LocalFirstError>) -> LocalFirstError {
    if retry.max_attempts > 1 {
        return LocalFirstError::RetryExhausted { attempts, errors };
    }
    errors
        .pop()
        .unwrap_or_else(|| LocalFirstError::Other("step failed without an error".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn tx(timeout_ms: u64) -> Transaction {
        Transaction::start(TransactionOptions::new().timeout_ms(timeout_ms), None)
    }

    fn step_error(message: &str) -> LocalFirstError {
        LocalFirstError::Fetch(message.to_string())
    }

    #[tokio::test]
    async fn test_commit_after_successful_steps() {
        let tx = tx(1_000);
        assert_eq!(tx.status(), TransactionStatus::Pending);

        let a = tx.run(|_| async { Ok(1u32) }, StepOptions::new()).await.unwrap();
        let b = tx.run(|_| async { Ok(2u32) }, StepOptions::new()).await.unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(tx.status(), TransactionStatus::Running);
        assert_eq!(tx.completed_steps(), 2);

        tx.commit().unwrap();
        assert_eq!(tx.status(), TransactionStatus::Committed);
        // 幂等
        tx.commit().unwrap();

        let err = tx.run(|_| async { Ok(3u32) }, StepOptions::new()).await.unwrap_err();
        assert!(matches!(err, LocalFirstError::TransactionState { ref operation, .. } if operation == "run"));
    }

    #[tokio::test]
    async fn test_rollback_runs_completed_steps_in_reverse() {
        let tx = tx(1_000);
        let log = Arc::new(Mutex::new(Vec::new()));

        for n in 1..=2u32 {
            let log = log.clone();
            tx.run(
                move |_| async move { Ok(n) },
                StepOptions::new().compensate(move |value: u32| async move {
                    log.lock().push(value);
                    Ok(())
                }),
            )
            .await
            .unwrap();
        }

        let log3 = log.clone();
        let err = tx
            .run(
                |_| async { Err::<u32, _>(step_error("step 3 failed")) },
                StepOptions::new().compensate(move |_: u32| async move {
                    log3.lock().push(3);
                    Ok(())
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LocalFirstError::Fetch(ref m) if m == "step 3 failed"));
        assert_eq!(*log.lock(), vec![2, 1]);
        assert_eq!(tx.status(), TransactionStatus::RolledBack);

        // 回滚后不能追加步骤，也不能提交
        let step4_ran = Arc::new(AtomicBool::new(false));
        let flag = step4_ran.clone();
        let err = tx
            .run(
                move |_| {
                    flag.store(true, Ordering::SeqCst);
                    async { Ok(4u32) }
                },
                StepOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LocalFirstError::TransactionState { .. }));
        assert!(!step4_ran.load(Ordering::SeqCst));
        assert!(matches!(tx.commit(), Err(LocalFirstError::TransactionState { .. })));
    }

    #[tokio::test]
    async fn test_compensation_failures_take_precedence() {
        let tx = tx(1_000);
        for n in 1..=2u32 {
            tx.run(
                move |_| async move { Ok(n) },
                StepOptions::new().compensate(move |value: u32| async move {
                    Err(LocalFirstError::Other(format!("undo {value} failed")))
                }),
            )
            .await
            .unwrap();
        }

        let err = tx
            .run(|_| async { Err::<u32, _>(step_error("original")) }, StepOptions::new())
            .await
            .unwrap_err();

        match err {
            LocalFirstError::CompensationFailed {
                failures,
                completed_steps,
            } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(completed_steps, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(tx.status(), TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_one_failing_compensation_does_not_stop_others() {
        let tx = tx(1_000);
        let undone = Arc::new(Mutex::new(Vec::new()));

        let u = undone.clone();
        tx.run(
            |_| async { Ok(1u32) },
            StepOptions::new().compensate(move |v: u32| async move {
                u.lock().push(v);
                Ok(())
            }),
        )
        .await
        .unwrap();
        tx.run(
            |_| async { Ok(2u32) },
            StepOptions::new().compensate(|_: u32| async { Err(LocalFirstError::Other("nope".into())) }),
        )
        .await
        .unwrap();

        let err = tx
            .run(|_| async { Err::<u32, _>(step_error("boom")) }, StepOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LocalFirstError::CompensationFailed { ref failures, completed_steps: 2 } if failures.len() == 1));
        assert_eq!(*undone.lock(), vec![1]);
    }

    fn step_bug() -> Result<u32> {
        panic!("step bug")
    }

    #[tokio::test]
    async fn test_panicking_step_rolls_back() {
        let tx = tx(1_000);
        let undone = Arc::new(AtomicBool::new(false));

        let u = undone.clone();
        tx.run(
            |_| async { Ok(1u32) },
            StepOptions::new().compensate(move |_: u32| async move {
                u.store(true, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await
        .unwrap();

        let err = tx.run(|_| async { step_bug() }, StepOptions::new()).await.unwrap_err();
        assert!(matches!(err, LocalFirstError::Other(ref m) if m.contains("panic")));
        assert!(undone.load(Ordering::SeqCst));
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_step_that_panics_before_returning_a_future() {
        let tx = tx(1_000);
        let err = tx
            .run(
                |_| -> futures::future::Ready<Result<u32>> { panic!("sync step bug") },
                StepOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LocalFirstError::Other(_)));
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_timeout_kills_step_without_retry() {
        let tx = tx(100);
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let started = Instant::now();
        let err = tx
            .run(
                move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(())
                    }
                },
                StepOptions::new().retry(RetryConfig::linear(3, 10)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LocalFirstError::TransactionTimeout { timeout_ms: 100, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_deadline_spans_all_steps() {
        let tx = tx(100);
        let undone = Arc::new(AtomicBool::new(false));

        let u = undone.clone();
        tx.run(
            |_| async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok(())
            },
            StepOptions::new().compensate(move |_: ()| async move {
                u.store(true, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await
        .unwrap();

        let err = tx
            .run(
                |_| async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok(())
                },
                StepOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LocalFirstError::TransactionTimeout { .. }));
        assert!(undone.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_step_token_is_cancelled_on_timeout() {
        let tx = tx(50);
        let handed_out = Arc::new(Mutex::new(None::<CancellationToken>));

        let slot = handed_out.clone();
        let err = tx
            .run(
                move |token: CancellationToken| {
                    *slot.lock() = Some(token);
                    async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    }
                },
                StepOptions::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LocalFirstError::TransactionTimeout { .. }));
        let token = handed_out.lock().clone().unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let tx = tx(5_000);
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let value = tx
            .run(
                move |_| {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(step_error("flaky"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                StepOptions::new().retry(RetryConfig::exponential(3, 5)),
            )
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_collects_errors() {
        let tx = tx(5_000);
        let err = tx
            .run(
                |_| async { Err::<(), _>(step_error("down")) },
                StepOptions::new().retry(RetryConfig::linear(3, 1)),
            )
            .await
            .unwrap_err();

        match err {
            LocalFirstError::RetryExhausted { attempts, errors } => {
                assert_eq!(attempts, 3);
                assert_eq!(errors.len(), 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_attempt_keeps_original_error() {
        let tx = tx(5_000);
        let err = tx
            .run(|_| async { Err::<(), _>(step_error("once")) }, StepOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LocalFirstError::Fetch(ref m) if m == "once"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_delay() {
        let tx = Arc::new(tx(0));
        let canceller = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel("user navigated away");
        });

        let started = Instant::now();
        let err = tx
            .run(
                |_| async { Err::<(), _>(step_error("retry me")) },
                StepOptions::new().retry(RetryConfig::linear(5, 10_000)),
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, LocalFirstError::TransactionAborted { ref reason, .. } if reason == "user navigated away"));
    }

    #[tokio::test]
    async fn test_external_signal_aborts_transaction() {
        let signal = CancellationToken::new();
        let tx = Transaction::start(TransactionOptions::new().signal(signal.clone()), None);

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = tx
            .run(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                StepOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LocalFirstError::TransactionAborted { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_step_signal_aborts_only_that_step() {
        let tx = tx(5_000);
        let step_signal = CancellationToken::new();
        step_signal.cancel();

        let err = tx
            .run(|_| async { Ok(()) }, StepOptions::new().signal(step_signal))
            .await
            .unwrap_err();
        assert!(matches!(err, LocalFirstError::TransactionAborted { ref reason, .. } if reason == "step signal cancelled"));
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let tx = tx(5_000);
        let slow = tx.run(
            |_| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(1u32)
            },
            StepOptions::new(),
        );
        tokio::pin!(slow);
        assert!(futures::poll!(&mut slow).is_pending());

        let fast = tx.run(|_| async { Ok(2u32) }, StepOptions::new()).await;
        assert!(matches!(fast, Err(LocalFirstError::TransactionState { .. })));
        assert_eq!(slow.await.unwrap(), 1);
        // 被拒绝的调用不影响事务本身
        assert_eq!(tx.status(), TransactionStatus::Running);
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let events = Arc::new(EventManager::new(64));
        let mut receiver = events.subscribe();
        let tx = Transaction::start(TransactionOptions::new().id("tx-events"), Some(events));

        tx.run(|_| async { Ok(()) }, StepOptions::new()).await.unwrap();
        tx.commit().unwrap();

        let mut types = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            assert_eq!(event.data["transactionId"], "tx-events");
            types.push(event.event_type);
        }
        assert_eq!(types, vec!["start", "step-start", "step-success", "commit"]);
    }
}
