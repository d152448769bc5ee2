//! Job → client correlation stored in Redis.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::instrument;

use jobflow_core::{ClientId, JobId};
use jobflow_events::{ClientResolver, ResolveError};

/// Reads the submitting client of a job from a Redis hash (`HGET <key> <jobId>`).
///
/// Producers record the mapping with [`RedisClientResolver::record`] (or their own
/// `HSET`) when they enqueue the job.
#[derive(Clone)]
pub struct RedisClientResolver {
    conn: MultiplexedConnection,
    key: String,
}

impl RedisClientResolver {
    pub fn new(conn: MultiplexedConnection, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }

    pub async fn record(&self, job_id: &JobId, client_id: &ClientId) -> Result<(), ResolveError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(&self.key)
            .arg(job_id.as_str())
            .arg(client_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| ResolveError::Lookup(format!("HSET failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ClientResolver for RedisClientResolver {
    #[instrument(skip(self), fields(key = %self.key), err)]
    async fn resolve(&self, job_id: &JobId) -> Result<Option<ClientId>, ResolveError> {
        let mut conn = self.conn.clone();
        let client: Option<String> = redis::cmd("HGET")
            .arg(&self.key)
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| ResolveError::Lookup(format!("HGET failed: {e}")))?;

        Ok(client.filter(|c| !c.is_empty()).map(ClientId::new))
    }
}

impl std::fmt::Debug for RedisClientResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClientResolver")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
