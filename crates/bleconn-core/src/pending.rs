//! 未完成请求槽位
//!
//! 底层协议栈同一类请求一次只能有一个在途，完成通知以回调方式异步到达。
//! `CallbackSlot` 把"是否有冲突请求在途"变成对一个具名槽位的存在性检查：
//! 槽位被占用时新请求立即失败（busy），不会排队。
//!
//! 槽位本身不加锁，由持有者（客户端状态锁）保证互斥；取出的
//! `PendingOperation` 必须在释放锁之后再 `resolve`，避免回调重入死锁。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{GattError, Operation};

/// 完成回调，恰好调用一次
pub type Sink<R> = Box<dyn FnOnce(Result<R, GattError>) + Send>;

/// 已决定结果、待锁外执行的回调
pub type Deferred = Box<dyn FnOnce() + Send>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// 一个在途请求
pub struct PendingOperation<K, R> {
    id: u64,
    key: Option<K>,
    sink: Sink<R>,
    created_at: Instant,
}

impl<K, R: Send + 'static> PendingOperation<K, R> {
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    pub fn into_key(self) -> (Option<K>, Sink<R>) {
        (self.key, self.sink)
    }

    pub fn resolve(self, result: Result<R, GattError>) {
        (self.sink)(result);
    }

    /// 把结果绑定到回调上，留待释放锁后执行
    pub fn defer(self, result: Result<R, GattError>) -> Deferred {
        let sink = self.sink;
        Box::new(move || sink(result))
    }
}

/// 单类操作的槽位，同一时刻至多一个 `PendingOperation`
pub struct CallbackSlot<K, R> {
    operation: Operation,
    timeout: Duration,
    pending: Option<PendingOperation<K, R>>,
}

impl<K, R: Send + 'static> CallbackSlot<K, R> {
    pub fn new(operation: Operation, timeout: Duration) -> Self {
        Self {
            operation,
            timeout,
            pending: None,
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn is_set(&self) -> bool {
        self.pending.is_some()
    }

    pub fn key(&self) -> Option<&K> {
        self.pending.as_ref().and_then(PendingOperation::key)
    }

    /// 占用槽位，返回请求 id；槽位已被占用时原样退回回调
    pub fn set(&mut self, key: Option<K>, sink: Sink<R>, now: Instant) -> Result<u64, Sink<R>> {
        if self.pending.is_some() {
            return Err(sink);
        }
        let id = next_id();
        self.pending = Some(PendingOperation {
            id,
            key,
            sink,
            created_at: now,
        });
        Ok(id)
    }

    pub fn take(&mut self) -> Option<PendingOperation<K, R>> {
        self.pending.take()
    }

    /// 仅当槽位中仍是指定 id 的请求时取出
    pub fn take_by_id(&mut self, id: u64) -> Option<PendingOperation<K, R>> {
        if self.pending.as_ref().is_some_and(|p| p.id == id) {
            self.pending.take()
        } else {
            None
        }
    }

    /// 仅当键满足条件时取出，用于按属性关联完成事件
    pub fn take_if(&mut self, matches: impl FnOnce(Option<&K>) -> bool) -> Option<PendingOperation<K, R>> {
        if self.pending.as_ref().is_some_and(|p| matches(p.key.as_ref())) {
            self.pending.take()
        } else {
            None
        }
    }

    /// 超时检查：请求存在时间超过 `timeout` 则取出
    pub fn take_expired(&mut self, now: Instant) -> Option<PendingOperation<K, R>> {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|p| now.saturating_duration_since(p.created_at) > self.timeout);
        if expired { self.pending.take() } else { None }
    }

    /// 超时检查并生成超时错误回调
    pub fn expire(&mut self, now: Instant) -> Option<Deferred> {
        let operation = self.operation;
        self.take_expired(now)
            .map(|p| p.defer(Err(GattError::Timeout(operation))))
    }

    /// 以错误结束当前请求（断开连接时清空）
    pub fn flush(&mut self, error: &GattError) -> Option<Deferred> {
        self.take().map(|p| p.defer(Err(error.clone())))
    }
}

/// 运行锁外回调
pub fn run_deferred(deferred: Vec<Deferred>) {
    for callback in deferred {
        callback();
    }
}

/// 以 oneshot 通道实现的回调，用于 async 形式的操作
pub fn oneshot_sink<R: Send + 'static>() -> (Sink<R>, oneshot::Receiver<Result<R, GattError>>) {
    let (tx, rx) = oneshot::channel();
    let sink: Sink<R> = Box::new(move |result| {
        // 等待方已放弃时静默丢弃
        let _ = tx.send(result);
    });
    (sink, rx)
}

/// 等待 oneshot 回调结果
pub async fn wait<R>(
    rx: oneshot::Receiver<Result<R, GattError>>,
    operation: Operation,
) -> Result<R, GattError> {
    rx.await.unwrap_or_else(|_| {
        Err(GattError::InvalidState(format!(
            "{operation} completion was dropped"
        )))
    })
}
