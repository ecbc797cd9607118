//! Task dispatch for observer notifications.
//!
//! The model never calls observers while holding a lock; it hands a closure
//! to a `TaskRunner` instead. Hosts choose whether tasks run inline or on a
//! queue drained by a task of their own.

use tokio::sync::mpsc;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskRunner: Send + Sync {
    /// Schedules `task`. `name` only shows up in logs.
    fn execute(&self, name: &'static str, task: Task);
}

/// Runs every task immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineRunner;

impl TaskRunner for InlineRunner {
    fn execute(&self, name: &'static str, task: Task) {
        log::trace!("running task name={}", name);
        task();
    }
}

/// Queues tasks for a `TaskQueue` to run in submission order.
#[derive(Debug, Clone)]
pub struct QueueRunner {
    sender: mpsc::UnboundedSender<(&'static str, Task)>,
}

pub struct TaskQueue {
    receiver: mpsc::UnboundedReceiver<(&'static str, Task)>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").finish_non_exhaustive()
    }
}

impl QueueRunner {
    pub fn new() -> (Self, TaskQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, TaskQueue { receiver })
    }
}

impl TaskRunner for QueueRunner {
    fn execute(&self, name: &'static str, task: Task) {
        if self.sender.send((name, task)).is_err() {
            log::warn!("task queue closed, dropping task name={}", name);
        }
    }
}

impl TaskQueue {
    /// Runs queued tasks until every `QueueRunner` handle is dropped.
    pub async fn run(mut self) {
        while let Some((name, task)) = self.receiver.recv().await {
            log::trace!("running queued task name={}", name);
            task();
        }
        log::debug!("task queue drained");
    }

    /// Runs whatever is queued right now without waiting. Returns the count.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok((name, task)) = self.receiver.try_recv() {
            log::trace!("running queued task name={}", name);
            task();
            ran += 1;
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    #[test]
    fn inline_runs_immediately() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        InlineRunner.execute("push", Box::new(move || sink.lock().push(1)));
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn queue_defers_until_drained_in_order() {
        let (runner, mut queue) = QueueRunner::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let sink = seen.clone();
            runner.execute("push", Box::new(move || sink.lock().push(i)));
        }
        assert!(seen.lock().is_empty());

        assert_eq!(queue.run_pending(), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(queue.run_pending(), 0);
    }

    #[test]
    fn closed_queue_drops_tasks() {
        let (runner, queue) = QueueRunner::new();
        drop(queue);
        runner.execute("noop", Box::new(|| {}));
    }

    #[tokio::test]
    async fn run_drains_until_runners_dropped() {
        let (runner, queue) = QueueRunner::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(queue.run());

        runner.execute(
            "signal",
            Box::new(move || {
                let _ = done_tx.send(42u32);
            }),
        );
        let value = timeout(Duration::from_millis(500), done_rx)
            .await
            .expect("timeout")
            .expect("recv");
        assert_eq!(value, 42);

        drop(runner);
        timeout(Duration::from_millis(500), handle)
            .await
            .expect("timeout")
            .expect("join");
    }
}
