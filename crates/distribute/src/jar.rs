use exn::OptionExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, Result};
use crate::task::Task;

/// Capacity of [`TaskJar::default`].
pub const DEFAULT_CAPACITY: usize = 1024;

/// Bounded, first-in first-out queue of tasks shared by producers and
/// consumers on one node.
///
/// Cloning is cheap and every clone refers to the same queue. Any number of
/// callers may [`push`](Self::push) and [`pull`](Self::pull) concurrently;
/// each task is delivered to exactly one puller, in the order it was pushed.
#[derive(Debug, Clone)]
pub struct TaskJar {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: mpsc::Sender<Task>,
    // Pullers queue fairly on this lock, one of them waits on the channel.
    rx: Mutex<mpsc::Receiver<Task>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for TaskJar {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TaskJar {
    /// Create a jar that buffers up to `capacity` tasks (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(Inner { tx, rx: Mutex::new(rx), next_id: AtomicU64::new(0), capacity }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffered tasks. Advisory only: it may be stale by the time
    /// the caller looks at it.
    pub fn len(&self) -> usize {
        self.inner.tx.max_capacity() - self.inner.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assign the next id to `task` and enqueue it, waiting while the jar is
    /// full. Returns the assigned id.
    pub async fn push(&self, mut task: Task) -> Result<u64> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        task.id = id;
        self.enqueue(task).await?;
        tracing::trace!(task = id, "pushed task");
        Ok(id)
    }

    /// Wait for the oldest task and take it.
    pub async fn pull(&self) -> Result<Task> {
        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or_raise(|| ErrorKind::Closed)
    }

    /// Take the oldest task if one is buffered, without waiting for one to
    /// arrive.
    pub async fn try_pull(&self) -> Option<Task> {
        self.inner.rx.lock().await.try_recv().ok()
    }

    /// Like [`pull`](Self::pull), but gives up with [`ErrorKind::Cancelled`]
    /// once `token` is cancelled. A task is never lost to a cancelled wait.
    pub async fn pull_until(&self, token: &CancellationToken) -> Result<Task> {
        tokio::select! {
            biased;
            () = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
            task = self.pull() => task,
        }
    }

    /// Like [`pull`](Self::pull), but gives up with [`ErrorKind::TimedOut`]
    /// after `timeout`.
    pub async fn pull_timeout(&self, timeout: Duration) -> Result<Task> {
        match tokio::time::timeout(timeout, self.pull()).await {
            Ok(task) => task,
            Err(_) => exn::bail!(ErrorKind::TimedOut),
        }
    }

    /// Master side: take the next task to hand to a remote worker.
    /// `workers` is the number of currently connected workers.
    pub async fn send(&self, workers: usize) -> Result<Task> {
        let task = self.pull().await?;
        tracing::debug!(task = task.id, rule = %task.rule, workers, "dispatching task");
        Ok(task)
    }

    /// Worker side: enqueue a task that arrived from the master, keeping the
    /// id the master assigned.
    pub async fn receive(&self, task: Task) -> Result<()> {
        let id = task.id;
        self.enqueue(task).await?;
        tracing::debug!(task = id, "received task");
        Ok(())
    }

    async fn enqueue(&self, task: Task) -> Result<()> {
        if self.inner.tx.send(task).await.is_err() {
            exn::bail!(ErrorKind::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn task(rule: &str) -> Task {
        Task::new(rule, json!(null))
    }

    #[tokio::test]
    async fn test_try_pull_takes_only_what_is_buffered() {
        let jar = TaskJar::new(4);
        assert!(jar.try_pull().await.is_none());
        jar.push(task("a")).await.unwrap();
        jar.push(task("b")).await.unwrap();
        assert_eq!(jar.try_pull().await.unwrap().rule, "a");
        assert_eq!(jar.try_pull().await.unwrap().rule, "b");
        assert!(jar.try_pull().await.is_none());
        assert!(jar.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_order_and_monotonic_ids() {
        let jar = TaskJar::new(8);
        for rule in ["a", "b", "c"] {
            jar.push(task(rule)).await.unwrap();
        }
        assert_eq!(jar.len(), 3);
        let pulled: Vec<_> = [jar.pull().await, jar.pull().await, jar.pull().await]
            .into_iter()
            .map(|task| task.unwrap())
            .map(|task| (task.id, task.rule))
            .collect();
        assert_eq!(pulled, vec![(0, "a".to_string()), (1, "b".to_string()), (2, "c".to_string())]);
        assert!(jar.is_empty());

        // Ids keep increasing after the queue drains.
        assert_eq!(jar.push(task("d")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_push_waits_while_full_without_dropping() {
        let jar = TaskJar::new(1);
        jar.push(task("first")).await.unwrap();

        let producer = {
            let jar = jar.clone();
            tokio::spawn(async move { jar.push(task("second")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(jar.len(), 1);

        assert_eq!(jar.pull().await.unwrap().rule, "first");
        assert_eq!(producer.await.unwrap().unwrap(), 1);
        assert_eq!(jar.pull().await.unwrap().rule, "second");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_concurrent_pullers_each_get_a_distinct_task() {
        let jar = TaskJar::default();
        let pullers: Vec<_> = (0..3)
            .map(|_| {
                let jar = jar.clone();
                tokio::spawn(async move { jar.pull().await })
            })
            .collect();
        for rule in ["x", "y", "z"] {
            jar.push(task(rule)).await.unwrap();
        }
        let mut ids = BTreeSet::new();
        for puller in pullers {
            ids.insert(puller.await.unwrap().unwrap().id);
        }
        assert_eq!(ids, BTreeSet::from([0, 1, 2]));
        assert!(jar.is_empty());
    }

    #[tokio::test]
    async fn test_pull_timeout_is_distinguishable() {
        let jar = TaskJar::new(4);
        let err = jar.pull_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn test_pull_until_cancelled_keeps_later_tasks() {
        let jar = TaskJar::new(4);
        let token = CancellationToken::new();
        let waiter = {
            let jar = jar.clone();
            let token = token.clone();
            tokio::spawn(async move { jar.pull_until(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Cancelled));

        jar.push(task("after")).await.unwrap();
        assert_eq!(jar.pull().await.unwrap().rule, "after");
    }

    #[tokio::test]
    async fn test_receive_preserves_id() {
        let jar = TaskJar::new(4);
        let mut remote = task("remote");
        remote.id = 41;
        jar.receive(remote).await.unwrap();
        assert_eq!(jar.pull().await.unwrap().id, 41);
        // A received task does not consume a local id.
        assert_eq!(jar.push(task("local")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_behaves_like_pull() {
        let jar = TaskJar::new(4);
        jar.push(task("a")).await.unwrap();
        let sent = jar.send(2).await.unwrap();
        assert_eq!((sent.id, sent.rule.as_str()), (0, "a"));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(TaskJar::new(0).capacity(), 1);
        assert_eq!(TaskJar::default().capacity(), DEFAULT_CAPACITY);
    }
}
