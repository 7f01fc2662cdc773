//! 同時に1つだけ実行する更新処理（single-flight）
//!
//! 実行中に来た呼び出しは同じ結果を待つ。処理本体は tokio タスクとして
//! 起動するので、待っている呼び出し側がすべて切断されても最後まで走り、
//! ブラウザは必ず閉じられる。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::UsageError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, UsageError>>>;

struct InFlight<T> {
    shared: SharedResult<T>,
    /// タスク本体が終了したら true（結果を誰も受け取っていなくても）
    done: Arc<AtomicBool>,
}

impl<T> InFlight<T> {
    fn is_pending(&self) -> bool {
        !self.done.load(Ordering::SeqCst)
    }
}

pub struct SingleFlight<T> {
    inflight: Mutex<Option<InFlight<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(None),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 実行中の処理があれば合流し、なければ `start` で新しく起動する
    pub async fn run<F, Fut>(&self, start: F) -> Result<T, UsageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, UsageError>> + Send + 'static,
    {
        let shared = {
            let mut slot = self.inflight.lock().await;
            match slot.as_ref().filter(|existing| existing.is_pending()) {
                Some(existing) => {
                    debug!("Joining in-flight refresh");
                    existing.shared.clone()
                }
                None => {
                    let done = Arc::new(AtomicBool::new(false));
                    let work = start();
                    let flag = done.clone();
                    let handle = tokio::spawn(async move {
                        let result = work.await;
                        flag.store(true, Ordering::SeqCst);
                        result
                    });
                    let shared = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(UsageError::Internal(format!("更新タスク異常終了: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        shared: shared.clone(),
                        done,
                    });
                    shared
                }
            }
        };

        let result = shared.clone().await;

        let mut slot = self.inflight.lock().await;
        if slot
            .as_ref()
            .map_or(false, |current| current.shared.ptr_eq(&shared))
        {
            *slot = None;
        }

        result
    }
}
