// 任务池（有界并发调度）
//
// 通用的固定并发上限调度器：
// - 接收未启动的延迟任务，保证并发真正受限
// - worker 循环按共享索引领取下一个任务，直到领完
// - 结果按入参顺序返回，与完成顺序无关
// - 第一个失败作为整体失败返回，观察到失败后停止派发
// - 在途任务不被强行中止（取消由调用方的令牌负责）

use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// 以并发上限 `concurrency` 执行一组延迟任务，按入参顺序返回全部结果
///
/// # 边界行为
/// - 空任务列表立即返回空结果
/// - `concurrency` >= 任务数时等价于全并行
/// - `concurrency` = 1 时严格顺序执行
/// - `concurrency` = 0 按 1 处理
pub async fn run_pool<T>(
    thunks: Vec<BoxFuture<'static, Result<T>>>,
    concurrency: usize,
) -> Result<Vec<T>>
where
    T: Send + 'static,
{
    let total = thunks.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let concurrency = concurrency.max(1);
    let worker_count = concurrency.min(total);

    debug!("[任务池] 启动: 任务数={}, 并发数={}", total, worker_count);

    // 任务槽位（worker 按索引取走后置 None）
    let slots: Arc<Mutex<Vec<Option<BoxFuture<'static, Result<T>>>>>> =
        Arc::new(Mutex::new(thunks.into_iter().map(Some).collect()));

    // 结果槽位（按原始索引写入）
    let results: Arc<Mutex<Vec<Option<T>>>> =
        Arc::new(Mutex::new((0..total).map(|_| None).collect()));

    // 下一个待领取的任务索引
    let next_index = Arc::new(AtomicUsize::new(0));

    // 观察到失败后置位，worker 不再领取新任务
    let stopped = Arc::new(AtomicBool::new(false));

    // 最先观察到的失败
    let first_err: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));

    let mut join_set = JoinSet::new();

    for _ in 0..worker_count {
        let slots = slots.clone();
        let results = results.clone();
        let next_index = next_index.clone();
        let stopped = stopped.clone();
        let first_err = first_err.clone();

        join_set.spawn(async move {
            loop {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }

                let index = next_index.fetch_add(1, Ordering::SeqCst);
                if index >= total {
                    break;
                }

                // 取走任务，锁在 await 之前释放
                let thunk = {
                    let mut slots = slots.lock();
                    slots[index].take()
                };

                let thunk = match thunk {
                    Some(t) => t,
                    None => break,
                };

                match thunk.await {
                    Ok(value) => {
                        results.lock()[index] = Some(value);
                    }
                    Err(e) => {
                        stopped.store(true, Ordering::SeqCst);
                        let mut first = first_err.lock();
                        if first.is_none() {
                            *first = Some(e);
                        }
                        break;
                    }
                }
            }
        });
    }

    // 等待全部 worker 退出（在途任务自然收尾，不中止）
    while let Some(joined) = join_set.join_next().await {
        if let Err(e) = joined {
            stopped.store(true, Ordering::SeqCst);
            let mut first = first_err.lock();
            if first.is_none() {
                *first = Some(anyhow::anyhow!("并发任务异常退出: {}", e));
            }
        }
    }

    if let Some(err) = first_err.lock().take() {
        warn!("[任务池] 任务失败，停止派发: {}", err);
        return Err(err);
    }

    let collected: Vec<Option<T>> = results.lock().drain(..).collect();
    let mut ordered = Vec::with_capacity(total);
    for (index, slot) in collected.into_iter().enumerate() {
        match slot {
            Some(value) => ordered.push(value),
            None => anyhow::bail!("任务池内部错误: 任务 {} 缺少结果", index),
        }
    }

    Ok(ordered)
}
