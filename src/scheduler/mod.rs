// 有界并发任务队列
//
// 并行上传的派发引擎：任意数量的任务入队，但同时在跑的任务数
// 永不超过并发上限。队列封口（seal）后不再接受新任务；完成通知
// 只在「已封口 + 无在跑任务 + 队列为空」同时成立时触发，且恰好
// 触发一次。空跑间隙（上一批任务全部结束、下一批尚未入队）不会
// 误判为完成。

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// 队列任务
pub type QueueTask = BoxFuture<'static, Result<()>>;

/// 完成通知回调
type OnComplete = Box<dyn FnOnce() + Send>;

struct QueueState {
    /// 在跑任务数
    running: usize,
    /// 待派发任务
    pending: VecDeque<QueueTask>,
    /// 是否已封口
    sealed: bool,
    /// 完成通知是否已触发
    finished: bool,
    /// 首个任务错误，join 时取出
    first_error: Option<anyhow::Error>,
    on_complete: Option<OnComplete>,
}

/// 有界并发任务队列
pub struct TaskQueue {
    concurrency: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    /// 创建任务队列，`concurrency` 为同时在跑任务数上限（至少 1）
    pub fn new(concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            concurrency: concurrency.max(1),
            state: Mutex::new(QueueState {
                running: 0,
                pending: VecDeque::new(),
                sealed: false,
                finished: false,
                first_error: None,
                on_complete: None,
            }),
            notify: Notify::new(),
        })
    }

    /// 注册完成通知回调，随完成条件成立恰好调用一次
    pub fn on_complete(self: &Arc<Self>, hook: OnComplete) {
        let mut state = self.state.lock();
        state.on_complete = Some(hook);
    }

    /// 任务入队
    ///
    /// 队列已封口时拒绝入队。
    pub fn push(self: &Arc<Self>, task: QueueTask) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.sealed {
                return Err(anyhow!("任务队列已封口，拒绝新任务"));
            }
            state.pending.push_back(task);
        }
        self.dispatch();
        Ok(())
    }

    /// 封口：不再接受新任务，存量任务跑完后触发完成通知
    pub fn seal(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.sealed = true;
        }
        // 封口时队列可能已经静止，需要立即判定完成
        self.try_finish();
    }

    /// 等待队列完成
    ///
    /// 返回首个任务错误（若有）。须先 `seal`，否则会一直等待。
    pub async fn join(self: &Arc<Self>) -> Result<()> {
        loop {
            // 先注册再检查，避免错过唤醒
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.finished {
                    return match state.first_error.take() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
            }
            notified.await;
        }
    }

    /// 当前在跑任务数
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// 把待派发任务填充到并发上限
    fn dispatch(self: &Arc<Self>) {
        loop {
            let task = {
                let mut state = self.state.lock();
                if state.running >= self.concurrency {
                    return;
                }
                match state.pending.pop_front() {
                    Some(task) => {
                        state.running += 1;
                        task
                    }
                    None => return,
                }
            };

            let queue = self.clone();
            tokio::spawn(async move {
                let result = task.await;

                {
                    let mut state = queue.state.lock();
                    state.running -= 1;
                    if let Err(e) = result {
                        warn!("队列任务失败: {:#}", e);
                        if state.first_error.is_none() {
                            state.first_error = Some(e);
                        }
                    }
                }

                queue.dispatch();
                queue.try_finish();
            });
        }
    }

    /// 完成条件判定：已封口 + 无在跑任务 + 队列为空
    fn try_finish(self: &Arc<Self>) {
        let hook = {
            let mut state = self.state.lock();
            if state.finished
                || !state.sealed
                || state.running > 0
                || !state.pending.is_empty()
            {
                return;
            }
            state.finished = true;
            state.on_complete.take()
        };

        debug!("任务队列完成");
        if let Some(hook) = hook {
            hook();
        }
        self.notify.notify_waiters();
    }
}
