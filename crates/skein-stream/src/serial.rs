use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::warn;

use crate::error::SkeinError;

type Job = Pin<Box<dyn Future<Output = Result<(), SkeinError>> + Send + 'static>>;

struct QueuedJob {
    job: Job,
    started: oneshot::Sender<()>,
}

struct ExecutorInner {
    queue: VecDeque<QueuedJob>,
    draining: bool,
}

/// Runs queued jobs one at a time, FIFO.
///
/// `run` resolves the instant its job starts, not when it finishes; callers
/// relying on completion must carry their own signal inside the job. Job
/// failures and panics are logged and never break the queue.
#[derive(Clone)]
pub struct SerialJobExecutor {
    inner: Arc<Mutex<ExecutorInner>>,
}

impl SerialJobExecutor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ExecutorInner {
                queue: VecDeque::new(),
                draining: false,
            })),
        }
    }

    pub async fn run<F>(&self, job: F)
    where
        F: Future<Output = Result<(), SkeinError>> + Send + 'static,
    {
        let (started_sender, started_receiver) = oneshot::channel();
        {
            let mut inner = self.inner.lock().expect("executor mutex poisoned");
            inner.queue.push_back(QueuedJob {
                job: Box::pin(job),
                started: started_sender,
            });
            if !inner.draining {
                inner.draining = true;
                tokio::spawn(drain(Arc::clone(&self.inner)));
            }
        }
        let _ = started_receiver.await;
    }
}

impl Default for SerialJobExecutor {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain(inner: Arc<Mutex<ExecutorInner>>) {
    loop {
        let next = {
            let mut guard = inner.lock().expect("executor mutex poisoned");
            match guard.queue.pop_front() {
                Some(queued) => queued,
                None => {
                    guard.draining = false;
                    return;
                }
            }
        };

        let _ = next.started.send(());
        match tokio::spawn(next.job).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(error = %error, "serial job failed"),
            Err(join_error) => warn!(error = %join_error, "serial job panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_submission_order_without_overlap() {
        let executor = SerialJobExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));

        for index in 0..5u32 {
            let log = Arc::clone(&log);
            let busy = Arc::clone(&busy);
            executor
                .run(async move {
                    assert!(!busy.swap(true, Ordering::SeqCst), "job bodies overlapped");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    log.lock().unwrap().push(index);
                    busy.store(false, Ordering::SeqCst);
                    Ok(())
                })
                .await;
        }

        // The last `run` resolved at job start; give the tail time to finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn a_failing_job_does_not_break_the_queue() {
        let executor = SerialJobExecutor::new();
        let ran = Arc::new(AtomicBool::new(false));

        executor
            .run(async {
                Err(SkeinError::new(
                    crate::error::SkeinErrorCode::Protocol,
                    "boom",
                ))
            })
            .await;

        let ran_in_job = Arc::clone(&ran);
        executor
            .run(async move {
                ran_in_job.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn run_resolves_when_the_job_starts_not_when_it_finishes() {
        let executor = SerialJobExecutor::new();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_in_job = Arc::clone(&finished);

        executor
            .run(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                finished_in_job.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        // We are past `run`, but the job body is still sleeping.
        assert!(!finished.load(Ordering::SeqCst));
    }
}
