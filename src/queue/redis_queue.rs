use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, info};

use super::{JobDescriptor, JobQueue};
use crate::error::QueueError;

/// Redis list used as the worker's FIFO queue (`RPUSH` here, `LPOP` in the worker).
pub struct RedisJobQueue {
    conn: ConnectionManager,
    queue_name: String,
}

impl RedisJobQueue {
    pub async fn new(url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(queue = %queue_name, "Connected to Redis job queue");

        Ok(Self {
            conn,
            queue_name: queue_name.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &JobDescriptor) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();

        let depth: u64 = conn.rpush(&self.queue_name, payload).await?;

        debug!(order_ref = %job.order_ref, depth, "Job descriptor enqueued");
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn.llen(&self.queue_name).await?;
        Ok(depth)
    }
}
