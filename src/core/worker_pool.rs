//! 有界并发的 fan-out / fan-in
//!
//! GENERATE / SCORE 阶段按测试用例并行：Semaphore 限制同时进行的 Oracle 调用数，
//! 每个任务开始前检查取消信号；单个用例失败不会让整个阶段失败，结果按输入顺序收集。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::EvolutionError;

/// 单个任务的结果，带输入序号
#[derive(Debug)]
pub struct TaskResult<T> {
    pub index: usize,
    pub result: Result<T, EvolutionError>,
}

/// 有界工作池
#[derive(Debug, Clone)]
pub struct WorkerPool {
    /// 并发上限（默认 4，对应 Oracle 限流）
    semaphore: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// 对每个输入并行执行 f，返回按输入顺序排列的结果。
    ///
    /// 取消后尚未拿到许可的任务直接以 `Cancelled` 结束；已在运行的任务由 f 自身响应同一 token。
    pub async fn fan_out<I, T, F, Fut>(
        &self,
        inputs: Vec<I>,
        cancel: &CancellationToken,
        f: F,
    ) -> Vec<TaskResult<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(usize, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, EvolutionError>> + Send + 'static,
    {
        let total = inputs.len();
        let f = Arc::new(f);
        let mut set = JoinSet::new();

        for (index, input) in inputs.into_iter().enumerate() {
            let semaphore = self.semaphore.clone();
            let cancel = cancel.clone();
            let f = f.clone();
            set.spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => None,
                    p = semaphore.acquire_owned() => p.ok(),
                };
                let Some(_permit) = permit else {
                    return TaskResult {
                        index,
                        result: Err(EvolutionError::Cancelled),
                    };
                };
                if cancel.is_cancelled() {
                    return TaskResult {
                        index,
                        result: Err(EvolutionError::Cancelled),
                    };
                }
                let result = f(index, input).await;
                TaskResult { index, result }
            });
        }

        let mut slots: Vec<Option<TaskResult<T>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(task) => {
                    let index = task.index;
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(task);
                    }
                }
                Err(e) => {
                    tracing::warn!("Worker task panicked or was aborted: {}", e);
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| TaskResult {
                    index,
                    result: Err(EvolutionError::transient("worker_pool", "task did not complete")),
                })
            })
            .collect()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let pool = WorkerPool::new(3);
        let token = CancellationToken::new();
        let results = pool
            .fan_out(vec![30u64, 10, 20], &token, |_, ms| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms * 2)
            })
            .await;

        let values: Vec<u64> = results.into_iter().map(|r| r.result.unwrap()).collect();
        assert_eq!(values, vec![60, 20, 40]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let token = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (r, p) = (running.clone(), peak.clone());
        let results = pool
            .fan_out((0..6).collect::<Vec<_>>(), &token, move |_, i: i32| {
                let (r, p) = (r.clone(), p.clone());
                async move {
                    let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    r.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }
            })
            .await;

        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_partial_failures_are_collected() {
        let pool = WorkerPool::default();
        let token = CancellationToken::new();
        let results = pool
            .fan_out(vec![1, 2, 3], &token, |_, n: i32| async move {
                if n == 2 {
                    Err(EvolutionError::transient("gen", "boom"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert!(results[0].result.is_ok());
        assert!(results[1].result.is_err());
        assert!(results[2].result.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_pool_skips_work() {
        let pool = WorkerPool::new(1);
        let token = CancellationToken::new();
        token.cancel();
        let results = pool
            .fan_out(vec![1, 2], &token, |_, n: i32| async move { Ok(n) })
            .await;
        assert!(results
            .iter()
            .all(|r| matches!(r.result, Err(EvolutionError::Cancelled))));
    }
}
