//! 固定大小的转换线程池
//!
//! - `start`：按配置启动 N 个常驻工作线程，共享一个有界任务队列
//! - `submit`：入队；队列已满时挂起提交方（背压），不丢弃、不扩容
//! - `shutdown`：停止接收新任务，排空已入队任务后等待全部工作线程退出
//!
//! 工作线程是普通 OS 线程，CPU 密集的转换不会占用 tokio 的异步 worker。

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 线程池执行的最小工作单元。
///
/// 线程池不观察返回值：任务自己持有输入与结果投递通道。
pub trait Job: Send + 'static {
    fn run(self: Box<Self>);
}

impl<F> Job for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

type BoxedJob = Box<dyn Job>;
type SharedQueue = Arc<Mutex<mpsc::Receiver<BoxedJob>>>;

/// 线程池错误
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("线程池已关闭，不再接收任务")]
    Closed,

    #[error("工作线程启动失败: {0}")]
    Spawn(#[from] std::io::Error),
}

/// 有界队列 + 固定工作线程的转换线程池
#[derive(Debug)]
pub struct WorkerPool {
    max_workers: usize,
    queue_capacity: usize,
    /// 关闭后置为 None；提交方克隆一份发送端后再等待队列空位
    sender: Mutex<Option<mpsc::Sender<BoxedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    live: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// 启动线程池
    ///
    /// `workers` 与 `queue_capacity` 均至少为 1。
    pub fn start(workers: usize, queue_capacity: usize) -> Result<Self, PoolError> {
        let max_workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<BoxedJob>(queue_capacity);
        let queue: SharedQueue = Arc::new(Mutex::new(rx));
        let live = Arc::new(AtomicUsize::new(0));

        let pool = Self {
            max_workers,
            queue_capacity,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::with_capacity(max_workers)),
            live,
        };

        for id in 0..max_workers {
            let queue = queue.clone();
            let live = pool.live.clone();
            live.fetch_add(1, Ordering::SeqCst);
            let spawned = thread::Builder::new()
                .name(format!("rune-worker-{id}"))
                .spawn(move || worker_loop(id, queue, live));
            match spawned {
                Ok(handle) => lock(&pool.workers).push(handle),
                Err(e) => {
                    pool.live.fetch_sub(1, Ordering::SeqCst);
                    // 已启动的线程随发送端关闭自然退出
                    pool.shutdown();
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        info!(workers = max_workers, queue_capacity, "转换线程池已启动");
        Ok(pool)
    }

    /// 异步提交：队列满时挂起当前任务直到有空位
    pub async fn submit<J: Job>(&self, job: J) -> Result<(), PoolError> {
        let tx = self.sender()?;
        tx.send(Box::new(job)).await.map_err(|_| PoolError::Closed)
    }

    /// 阻塞提交：供非异步上下文使用，队列满时阻塞当前线程
    ///
    /// 不可在 tokio 运行时的异步上下文中调用。
    pub fn submit_blocking<J: Job>(&self, job: J) -> Result<(), PoolError> {
        let tx = self.sender()?;
        tx.blocking_send(Box::new(job)).map_err(|_| PoolError::Closed)
    }

    /// 停止接收新任务，排空队列并等待所有工作线程退出（可重复调用）
    ///
    /// 会阻塞当前线程；异步上下文请使用 [`WorkerPool::shutdown_gracefully`]。
    pub fn shutdown(&self) {
        let closed = lock(&self.sender).take().is_some();
        if closed {
            info!(queued = self.queued_jobs(), "线程池停止接收任务，开始排空队列");
        }

        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                warn!(worker = ?name, "工作线程异常退出");
            }
        }

        if closed {
            info!("线程池已关闭");
        }
    }

    /// 在阻塞线程上执行 [`WorkerPool::shutdown`]，超时后放弃等待（线程仍会自行排空）
    pub async fn shutdown_gracefully(self: Arc<Self>, timeout: Duration) -> bool {
        let pool = self.clone();
        let drained = tokio::task::spawn_blocking(move || pool.shutdown());
        match tokio::time::timeout(timeout, drained).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("线程池关闭任务失败: {}", e);
                false
            }
            Err(_) => {
                warn!(?timeout, "线程池排空超时");
                false
            }
        }
    }

    /// 是否已停止接收新任务
    pub fn is_closed(&self) -> bool {
        lock(&self.sender).is_none()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// 仍在运行的工作线程数
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// 当前排队（尚未被工作线程取走）的任务数
    pub fn queued_jobs(&self) -> usize {
        lock(&self.sender)
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    fn sender(&self) -> Result<mpsc::Sender<BoxedJob>, PoolError> {
        lock(&self.sender).clone().ok_or(PoolError::Closed)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // 只关闭队列，不在 drop 中 join；工作线程排空后自行退出
        lock(&self.sender).take();
    }
}

fn worker_loop(id: usize, queue: SharedQueue, live: Arc<AtomicUsize>) {
    debug!(worker_id = id, "工作线程启动");
    loop {
        // 持锁等待下一项任务；执行任务时不持锁
        let next = lock(&queue).blocking_recv();
        let Some(job) = next else {
            break;
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job.run())) {
            error!(
                worker_id = id,
                panic = %panic_message(payload.as_ref()),
                "转换任务 panic，工作线程继续服务队列"
            );
        }
    }
    live.fetch_sub(1, Ordering::SeqCst);
    debug!(worker_id = id, "工作线程退出");
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 提取 panic 负载中的可读信息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
