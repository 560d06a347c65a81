//! 常驻工作线程池
//!
//! N 个 worker 空闲时把自己的任务发送端登记到容量为 N 的 ready 通道；调度任务从容量为 2N 的
//! 任务队列取出任务，交给下一个登记的 worker。队列满时按 QueueFullPolicy 阻塞或拒绝。
//! 调用方在结果返回前被 drop（超时、取消）时，DropGuard 会取消该任务的 token。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{Result, WorkflowError};
use crate::tools::registry::{Tool, ToolInput};

/// 任务队列已满时的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// 等待队列出现空位（可被取消）
    #[default]
    Block,
    /// 立即返回 PoolSaturated
    Reject,
}

struct PoolJob {
    tool: Arc<dyn Tool>,
    input: ToolInput,
    cancel: CancellationToken,
    reply: oneshot::Sender<std::result::Result<Value, String>>,
}

type WorkerSender = mpsc::Sender<PoolJob>;

pub struct WorkerPool {
    jobs_tx: mpsc::Sender<PoolJob>,
    policy: QueueFullPolicy,
    size: usize,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// 启动 `size` 个 worker 与一个调度任务；必须在 tokio 运行时内调用
    pub fn new(size: usize, policy: QueueFullPolicy) -> Self {
        let size = size.max(1);
        let (jobs_tx, jobs_rx) = mpsc::channel::<PoolJob>(size * 2);
        let (ready_tx, ready_rx) = mpsc::channel::<WorkerSender>(size);
        let shutdown = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(size + 1);
        for id in 0..size {
            handles.push(tokio::spawn(worker_loop(
                id,
                ready_tx.clone(),
                shutdown.clone(),
                Arc::clone(&active),
            )));
        }
        handles.push(tokio::spawn(dispatch_loop(jobs_rx, ready_rx, shutdown.clone())));
        tracing::info!(workers = size, queue = size * 2, ?policy, "worker pool started");

        Self {
            jobs_tx,
            policy,
            size,
            shutdown,
            active,
            handles: Mutex::new(handles),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 正在执行的任务数
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// 已入队尚未被调度的任务数
    pub fn queued(&self) -> usize {
        self.jobs_tx.max_capacity() - self.jobs_tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 提交任务并等待结果。外层 Err 为池级错误（饱和、关闭、取消），内层为工具自身的结果
    pub async fn submit(
        &self,
        tool: Arc<dyn Tool>,
        input: ToolInput,
        cancel: CancellationToken,
    ) -> Result<std::result::Result<Value, String>> {
        if self.shutdown.is_cancelled() {
            return Err(WorkflowError::PoolClosed);
        }
        let name = tool.metadata().name;
        let job_token = cancel.child_token();
        let (reply, rx) = oneshot::channel();
        let job = PoolJob {
            tool,
            input,
            cancel: job_token.clone(),
            reply,
        };

        match self.policy {
            QueueFullPolicy::Reject => self.jobs_tx.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WorkflowError::PoolSaturated(name.clone()),
                mpsc::error::TrySendError::Closed(_) => WorkflowError::PoolClosed,
            })?,
            QueueFullPolicy::Block => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(WorkflowError::Cancelled(name)),
                    sent = self.jobs_tx.send(job) => sent.map_err(|_| WorkflowError::PoolClosed)?,
                }
            }
        }

        let guard = job_token.drop_guard();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(WorkflowError::Cancelled(name)),
            reply = rx => reply.map_err(|_| WorkflowError::PoolClosed),
        };
        if result.is_ok() {
            guard.disarm();
        }
        result
    }

    /// 停止接收新任务，取消所有 worker 并等待其退出
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "pool task ended abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    id: usize,
    ready_tx: mpsc::Sender<WorkerSender>,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
) {
    let (tx, mut rx) = mpsc::channel::<PoolJob>(1);
    loop {
        // 空闲时先登记，再等任务
        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = ready_tx.send(tx.clone()) => if sent.is_err() { break },
        }
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let PoolJob {
            tool,
            input,
            cancel,
            reply,
        } = job;
        active.fetch_add(1, Ordering::Relaxed);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err("cancelled".to_string()),
            _ = shutdown.cancelled() => Err("worker pool shutting down".to_string()),
            r = tool.execute(input, cancel.clone()) => r,
        };
        active.fetch_sub(1, Ordering::Relaxed);
        let _ = reply.send(outcome);
    }
    tracing::debug!(worker = id, "worker exited");
}

async fn dispatch_loop(
    mut jobs_rx: mpsc::Receiver<PoolJob>,
    mut ready_rx: mpsc::Receiver<WorkerSender>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = jobs_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        if job.cancel.is_cancelled() {
            continue;
        }
        let worker = tokio::select! {
            _ = shutdown.cancelled() => break,
            w = ready_rx.recv() => match w {
                Some(w) => w,
                None => break,
            },
        };
        if worker.send(job).await.is_err() {
            tracing::warn!("worker went away before accepting a job");
        }
    }
    tracing::debug!("dispatcher exited");
}
