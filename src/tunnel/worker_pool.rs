use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

pub const DEFAULT_MAX_WORKERS: usize = 2000;
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(2 * 60);

type Handler<T> = Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct IdleWorker<T> {
    id: u64,
    tx: mpsc::Sender<T>,
}

struct State<T> {
    ready: Vec<IdleWorker<T>>,
    workers: usize,
    next_id: u64,
    stopped: bool,
}

struct Inner<T> {
    handler: Handler<T>,
    max_workers: usize,
    max_idle: Duration,
    state: Mutex<State<T>>,
}

/// Bounded set of long-lived tasks. Idle workers are reused most-recent
/// first and retire after `max_idle` without work.
pub struct WorkerPool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        WorkerPool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F, Fut>(max_workers: usize, max_idle: Duration, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler<T> = Arc::new(move |item| Box::pin(handler(item)));
        WorkerPool {
            inner: Arc::new(Inner {
                handler,
                max_workers: max_workers.max(1),
                max_idle,
                state: Mutex::new(State {
                    ready: Vec::new(),
                    workers: 0,
                    next_id: 0,
                    stopped: false,
                }),
            }),
        }
    }

    /// Hands `item` to an idle worker or a new one. Gives the item back
    /// when the pool is saturated or stopped.
    pub fn serve(&self, item: T) -> Result<(), T> {
        let mut item = item;
        loop {
            let mut state = self.lock();
            if state.stopped {
                return Err(item);
            }
            if let Some(worker) = state.ready.pop() {
                drop(state);
                match worker.tx.try_send(item) {
                    Ok(()) => return Ok(()),
                    // worker retired between pop and send
                    Err(mpsc::error::TrySendError::Closed(back))
                    | Err(mpsc::error::TrySendError::Full(back)) => {
                        item = back;
                        continue;
                    }
                }
            }
            if state.workers >= self.inner.max_workers {
                return Err(item);
            }
            state.workers += 1;
            let id = state.next_id;
            state.next_id += 1;
            drop(state);
            tokio::spawn(run_worker(self.inner.clone(), id, item));
            return Ok(());
        }
    }

    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        state.ready.clear();
    }

    pub fn workers(&self) -> usize {
        self.lock().workers
    }

    pub fn idle(&self) -> usize {
        self.lock().ready.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_worker<T: Send + 'static>(inner: Arc<Inner<T>>, id: u64, first: T) {
    let (tx, mut rx) = mpsc::channel::<T>(1);
    let mut next = Some(first);
    while let Some(item) = next.take() {
        (inner.handler)(item).await;

        {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.stopped {
                break;
            }
            state.ready.push(IdleWorker { id, tx: tx.clone() });
        }

        loop {
            match tokio::time::timeout(inner.max_idle, rx.recv()).await {
                Ok(Some(item)) => {
                    next = Some(item);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(pos) = state.ready.iter().position(|w| w.id == id) {
                        state.ready.remove(pos);
                        break;
                    }
                    if state.stopped {
                        // `stop` emptied the stack; take whatever was sent before it
                        drop(state);
                        rx.close();
                        next = rx.try_recv().ok();
                        break;
                    }
                    // popped by `serve`; the item is on its way
                }
            }
        }
    }
    let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.workers -= 1;
    state.ready.retain(|w| w.id != id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn reuses_idle_workers() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let pool = WorkerPool::new(4, Duration::from_secs(60), move |n: usize| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(n, Ordering::SeqCst);
            }
        });
        assert!(pool.serve(1).is_ok());
        while pool.idle() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(pool.serve(2).is_ok());
        while done.load(Ordering::SeqCst) != 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.workers(), 1);
    }

    #[tokio::test]
    async fn saturated_pool_returns_item() {
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let pool = WorkerPool::new(1, Duration::from_secs(60), move |_: u8| {
            let mut rx = release_rx.clone();
            async move {
                let _ = rx.wait_for(|v| *v).await;
            }
        });
        assert!(pool.serve(1).is_ok());
        assert_eq!(pool.serve(2), Err(2));
        release_tx.send(true).unwrap();
        pool.stop();
        assert_eq!(pool.serve(3), Err(3));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_retire() {
        let pool = WorkerPool::new(2, Duration::from_millis(50), |_: u8| async {});
        pool.serve(1).unwrap();
        while pool.idle() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.workers(), 0);
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_pool_retires_idle_workers() {
        let pool = WorkerPool::new(4, Duration::from_millis(50), |_: u8| async {});
        pool.serve(1).unwrap();
        while pool.idle() == 0 {
            tokio::task::yield_now().await;
        }
        pool.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(pool.workers(), 0);
        assert_eq!(pool.serve(2), Err(2));
    }
}
