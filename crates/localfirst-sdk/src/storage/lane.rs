//! 写入通道 - 单模型串行写入 Actor
//!
//! 核心设计：
//! - 每个模型一条通道，所有 patch / replace / delete 都作为任务入队
//! - 入队在调用 `enqueue` 时同步完成，执行顺序即提交顺序（FIFO）
//! - 任务在通道自己的 tokio 任务上执行：调用方放弃等待不会中断已开始的写入
//! - 某个任务失败（包括 panic）只影响它自己的调用方，后续任务照常执行

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{LocalFirstError, Result};

type Job = BoxFuture<'static, ()>;

pub struct WriteLane {
    name: String,
    sender: mpsc::UnboundedSender<Job>,
    /// 首次入队时取走并启动执行任务
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
}

impl std::fmt::Debug for WriteLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLane").field("name", &self.name).finish()
    }
}

impl WriteLane {
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// 提交一个写入任务，返回等待其结果的 future
    ///
    /// 必须在 tokio 运行时中调用。
    pub fn enqueue<F, R>(&self, op: F) -> impl Future<Output = Result<R>> + Send + 'static
    where
        F: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        self.ensure_worker();

        let (tx, rx) = oneshot::channel();
        let lane = self.name.clone();
        let job: Job = async move {
            let result = match AssertUnwindSafe(op).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    error!("写入任务 panic (lane={})", lane);
                    Err(LocalFirstError::Other(format!("写入任务 panic: {}", lane)))
                }
            };
            if let Err(ref e) = result {
                warn!("写入任务失败 (lane={}): {}", lane, e);
            }
            // 调用方已放弃等待时忽略
            let _ = tx.send(result);
        }
        .boxed();

        let submitted = self.sender.send(job).is_ok();
        let name = self.name.clone();

        async move {
            if !submitted {
                return Err(LocalFirstError::Other(format!("写入通道已关闭: {}", name)));
            }
            rx.await
                .map_err(|_| LocalFirstError::Other(format!("写入通道任务被中断: {}", name)))?
        }
    }

    fn ensure_worker(&self) {
        let receiver = self.receiver.lock().take();
        if let Some(mut receiver) = receiver {
            let name = self.name.clone();
            debug!("启动写入通道: {}", name);
            tokio::spawn(async move {
                while let Some(job) = receiver.recv().await {
                    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                        error!("写入通道任务 panic，继续处理后续任务: {}", name);
                    }
                }
                debug!("写入通道已退出: {}", name);
            });
        }
    }
}
