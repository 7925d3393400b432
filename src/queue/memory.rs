use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{JobDescriptor, JobQueue};
use crate::error::QueueError;

/// In-process queue for tests and standalone runs.
///
/// Stores the serialized payloads so callers see exactly what a worker
/// would pop. `set_unavailable(true)` makes every call fail like an
/// unreachable broker.
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<VecDeque<String>>,
    unavailable: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Pop the oldest descriptor, as the worker would.
    pub fn pop(&self) -> Option<JobDescriptor> {
        let payload = self.jobs.lock().pop_front()?;
        serde_json::from_str(&payload).ok()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory queue switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &JobDescriptor) -> Result<(), QueueError> {
        self.check_available()?;
        let payload = serde_json::to_string(job)?;
        self.jobs.lock().push_back(payload);
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        self.check_available()?;
        Ok(self.jobs.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::tests::sample_order;
    use std::path::Path;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryJobQueue::new();
        let mut first = JobDescriptor::format_order(&sample_order(None), Path::new("out"));
        first.order_ref = "ORD-1".into();
        let mut second = first.clone();
        second.order_ref = "ORD-2".into();

        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), 2);
        assert_eq!(queue.pop().unwrap().order_ref, "ORD-1");
        assert_eq!(queue.pop().unwrap().order_ref, "ORD-2");
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_queue_rejects_jobs() {
        let queue = InMemoryJobQueue::new();
        queue.set_unavailable(true);

        let job = JobDescriptor::format_order(&sample_order(None), Path::new("out"));
        assert!(matches!(queue.enqueue(&job).await, Err(QueueError::Unavailable(_))));
        assert_eq!(queue.len(), 0);
    }
}
