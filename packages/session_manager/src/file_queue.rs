//! File Operation Queue
//!
//! Single-flight FIFO executor for disk writes. Every operation submitted by
//! any session is run by one worker task, strictly in submission order, so
//! slow or antivirus-scanned storage never sees concurrent writes from us.
//!
//! Each operation races a fixed timeout. When the timeout wins the caller
//! gets [`FileOpError::TimedOut`] and the worker moves on; blocking I/O that
//! was already handed to the runtime may still finish in the background.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum FileOpError {
    #[error("{label}: timed out after {after:?} (slow disk or antivirus scan?)")]
    TimedOut { label: String, after: Duration },

    #[error("{label}: {source}")]
    Io {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("file operation queue is shut down")]
    QueueClosed,
}

struct QueuedOp {
    label: String,
    job: BoxFuture<'static, ()>,
}

/// Handle to the queue worker. Cheap to share behind an `Arc`.
pub struct FileOpQueue {
    sender: mpsc::UnboundedSender<QueuedOp>,
    timeout: Duration,
}

impl FileOpQueue {
    /// Start the worker task. Must be called from within a tokio runtime.
    pub fn new(timeout: Duration) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueuedOp>();

        tokio::spawn(async move {
            while let Some(op) = receiver.recv().await {
                debug!("File operation started: {}", op.label);
                op.job.await;
                debug!("File operation finished: {}", op.label);
            }
            debug!("File operation queue worker exiting");
        });

        Self { sender, timeout }
    }

    /// Enqueue `op` immediately and return a receiver for its result.
    ///
    /// Queue position is fixed at call time, not when the receiver is awaited.
    pub fn submit<T, F>(
        &self,
        label: impl Into<String>,
        op: F,
    ) -> oneshot::Receiver<Result<T, FileOpError>>
    where
        T: Send + 'static,
        F: Future<Output = std::io::Result<T>> + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = oneshot::channel();
        let timeout = self.timeout;
        let job_label = label.clone();

        let job = async move {
            let result = match tokio::time::timeout(timeout, op).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(source)) => Err(FileOpError::Io {
                    label: job_label,
                    source,
                }),
                Err(_) => {
                    warn!("File operation '{}' timed out after {:?}", job_label, timeout);
                    Err(FileOpError::TimedOut {
                        label: job_label,
                        after: timeout,
                    })
                }
            };
            // The caller may have gone away (e.g. session killed); drop the result
            let _ = tx.send(result);
        }
        .boxed();

        if let Err(mpsc::error::SendError(op)) = self.sender.send(QueuedOp { label, job }) {
            warn!("File operation '{}' rejected: queue closed", op.label);
        }
        rx
    }

    /// Enqueue `op` and wait for its own completion
    pub async fn run<T, F>(&self, label: impl Into<String>, op: F) -> Result<T, FileOpError>
    where
        T: Send + 'static,
        F: Future<Output = std::io::Result<T>> + Send + 'static,
    {
        self.submit(label, op)
            .await
            .map_err(|_| FileOpError::QueueClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn test_runs_in_submission_order_one_at_a_time() {
        let queue = FileOpQueue::new(Duration::from_secs(3));
        let order = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let receivers: Vec<_> = (0..12u64)
            .map(|i| {
                let order = order.clone();
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                queue.submit(format!("op-{i}"), async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    // Later ops are faster; ordering must still hold
                    tokio::time::sleep(Duration::from_millis(120 - i * 10)).await;
                    order.lock().unwrap().push(i);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(i)
                })
            })
            .collect();

        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap().unwrap(), i as u64);
        }
        assert_eq!(*order.lock().unwrap(), (0..12).collect::<Vec<_>>());
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_op_and_worker_continues() {
        let queue = FileOpQueue::new(Duration::from_secs(3));

        let slow = queue.submit("slow", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, std::io::Error>(())
        });
        let fast = queue.submit("fast", async { Ok::<_, std::io::Error>("done") });

        let err = slow.await.unwrap().unwrap_err();
        assert!(matches!(err, FileOpError::TimedOut { ref label, .. } if label == "slow"));
        assert_eq!(fast.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_io_errors_carry_label() {
        let queue = FileOpQueue::new(Duration::from_secs(3));
        let err = queue
            .run("read missing", async {
                tokio::fs::read("/definitely/not/here").await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FileOpError::Io { .. }));
        assert!(err.to_string().starts_with("read missing:"));
    }

    #[tokio::test]
    async fn test_run_returns_value() {
        let queue = FileOpQueue::new(Duration::from_secs(3));
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.txt");
        let p = path.clone();
        queue
            .run("write", async move { tokio::fs::write(p, b"abc").await })
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }
}
