//! Redis-backed job store.
//!
//! ## Layout (per channel)
//!
//! - `echoboard:{channel}:jobs`: HASH of job id → job JSON
//! - `echoboard:{channel}:waiting`: LIST, pushed left, claimed from the right
//! - `echoboard:{channel}:active`: LIST of claimed ids
//! - `echoboard:{channel}:delayed`: ZSET scored by ready time (epoch ms)
//! - `echoboard:{channel}:completed` / `:failed`: LIST, newest first, trimmed
//!
//! Every state move that must be atomic (claim, finish, reschedule) runs as a
//! Lua script, so a job id is in at most one state list at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::store::{JobStore, StoreError};
use super::types::{Channel, Job, JobCounts, JobId, JobState};

/// Default key prefix.
const DEFAULT_PREFIX: &str = "echoboard";

const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
return redis.call('LMOVE', KEYS[2], KEYS[3], 'RIGHT', 'LEFT')
"#;

const FINISH_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return -1
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('LPUSH', KEYS[3], ARGV[1])
local keep = tonumber(ARGV[3])
local evicted = redis.call('LRANGE', KEYS[3], keep, -1)
for _, old in ipairs(evicted) do
  redis.call('HDEL', KEYS[2], old)
end
if keep == 0 then
  redis.call('DEL', KEYS[3])
else
  redis.call('LTRIM', KEYS[3], 0, keep - 1)
end
return #evicted
"#;

const RESCHEDULE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return -1
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 0
"#;

const REQUEUE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return -1
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('RPUSH', KEYS[3], ARGV[1])
return 0
"#;

/// Connection settings for [`RedisJobStore`].
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub key_prefix: String,
    pub connect_timeout: Duration,
}

impl RedisSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: DEFAULT_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

struct Keys {
    jobs: String,
    waiting: String,
    active: String,
    delayed: String,
    completed: String,
    failed: String,
}

impl Keys {
    fn new(prefix: &str, channel: Channel) -> Self {
        let base = format!("{prefix}:{}", channel.as_str());
        Self {
            jobs: format!("{base}:jobs"),
            waiting: format!("{base}:waiting"),
            active: format!("{base}:active"),
            delayed: format!("{base}:delayed"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
        }
    }
}

/// Job store on a single multiplexed Redis connection, rebuilt on
/// [`reconnect`](JobStore::reconnect).
pub struct RedisJobStore {
    client: Arc<redis::Client>,
    settings: RedisSettings,
    conn: RwLock<Option<MultiplexedConnection>>,
    claim_script: redis::Script,
    finish_script: redis::Script,
    reschedule_script: redis::Script,
    requeue_script: redis::Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("key_prefix", &self.settings.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisJobStore {
    /// Create the store. The connection is established lazily.
    pub fn new(settings: RedisSettings) -> Result<Self, StoreError> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            settings,
            conn: RwLock::new(None),
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            finish_script: redis::Script::new(FINISH_SCRIPT),
            reschedule_script: redis::Script::new(RESCHEDULE_SCRIPT),
            requeue_script: redis::Script::new(REQUEUE_SCRIPT),
        })
    }

    /// Create the store and verify connectivity.
    pub async fn connect(settings: RedisSettings) -> Result<Self, StoreError> {
        let store = Self::new(settings)?;
        store.reconnect().await?;
        Ok(store)
    }

    fn keys(&self, channel: Channel) -> Keys {
        Keys::new(&self.settings.key_prefix, channel)
    }

    async fn open(&self) -> Result<MultiplexedConnection, StoreError> {
        let connect = self.client.get_multiplexed_tokio_connection();
        match tokio::time::timeout(self.settings.connect_timeout, connect).await {
            Ok(result) => result.map_err(map_redis_err),
            Err(_) => Err(StoreError::Unavailable(format!(
                "connect timed out after {}s",
                self.settings.connect_timeout.as_secs()
            ))),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut guard = self.conn.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.open().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &Keys,
        id: &str,
    ) -> Result<Option<Job>, StoreError> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&keys.jobs)
            .arg(id)
            .query_async(conn)
            .await
            .map_err(map_redis_err)?;
        raw.map(|json| decode(&json)).transpose()
    }

    async fn load_many(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &Keys,
        ids: &[String],
    ) -> Result<Vec<Job>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&keys.jobs)
            .arg(ids)
            .query_async(conn)
            .await
            .map_err(map_redis_err)?;
        raw.into_iter().flatten().map(|json| decode(&json)).collect()
    }

    async fn finish(&self, job: &Job, list: &str, keep: usize) -> Result<(), StoreError> {
        let keys = self.keys(job.channel);
        let mut conn = self.connection().await?;
        let evicted: i64 = self
            .finish_script
            .key(&keys.active)
            .key(&keys.jobs)
            .key(list)
            .arg(job.id.to_string())
            .arg(encode(job)?)
            .arg(keep)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        if evicted < 0 {
            return Err(StoreError::NotActive(job.id));
        }
        if evicted > 0 {
            debug!(channel = %job.channel, evicted, list, "trimmed retained jobs");
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(channel = %job.channel, job_id = %job.id), err)]
    async fn push(&self, job: Job) -> Result<(), StoreError> {
        let keys = self.keys(job.channel);
        let id = job.id.to_string();
        let json = encode(&job)?;
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("HSET").arg(&keys.jobs).arg(&id).arg(json).ignore();
        match (job.state, job.ready_at) {
            (JobState::Delayed, Some(ready_at)) => {
                pipe.cmd("ZADD")
                    .arg(&keys.delayed)
                    .arg(ready_at.timestamp_millis())
                    .arg(&id)
                    .ignore();
            }
            _ => {
                pipe.cmd("LPUSH").arg(&keys.waiting).arg(&id).ignore();
            }
        }

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_err)
    }

    async fn claim_next(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let keys = self.keys(channel);
        let mut conn = self.connection().await?;

        let claimed: Option<String> = self
            .claim_script
            .key(&keys.delayed)
            .key(&keys.waiting)
            .key(&keys.active)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        let Some(id) = claimed else {
            return Ok(None);
        };

        let Some(mut job) = self.load(&mut conn, &keys, &id).await? else {
            warn!(%channel, job_id = %id, "claimed id has no job record; dropping");
            let _: i64 = redis::cmd("LREM")
                .arg(&keys.active)
                .arg(1)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            return Ok(None);
        };

        job.mark_active(now);
        let _: i64 = redis::cmd("HSET")
            .arg(&keys.jobs)
            .arg(&id)
            .arg(encode(&job)?)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(Some(job))
    }

    async fn complete(&self, job: &Job, keep: usize) -> Result<(), StoreError> {
        let keys = self.keys(job.channel);
        self.finish(job, &keys.completed, keep).await
    }

    async fn reschedule(&self, job: &Job) -> Result<(), StoreError> {
        let keys = self.keys(job.channel);
        let mut conn = self.connection().await?;
        let ready_at = job.ready_at.unwrap_or(job.updated_at).timestamp_millis();

        let moved: i64 = self
            .reschedule_script
            .key(&keys.active)
            .key(&keys.jobs)
            .key(&keys.delayed)
            .arg(job.id.to_string())
            .arg(encode(job)?)
            .arg(ready_at)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        if moved < 0 {
            return Err(StoreError::NotActive(job.id));
        }
        Ok(())
    }

    async fn fail(&self, job: &Job, keep: usize) -> Result<(), StoreError> {
        let keys = self.keys(job.channel);
        self.finish(job, &keys.failed, keep).await
    }

    async fn get(&self, channel: Channel, id: JobId) -> Result<Option<Job>, StoreError> {
        let keys = self.keys(channel);
        let mut conn = self.connection().await?;
        self.load(&mut conn, &keys, &id.to_string()).await
    }

    async fn counts(&self, channel: Channel) -> Result<JobCounts, StoreError> {
        let keys = self.keys(channel);
        let mut conn = self.connection().await?;

        let (waiting, active, completed, failed, delayed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .cmd("LLEN")
                .arg(&keys.waiting)
                .cmd("LLEN")
                .arg(&keys.active)
                .cmd("LLEN")
                .arg(&keys.completed)
                .cmd("LLEN")
                .arg(&keys.failed)
                .cmd("ZCARD")
                .arg(&keys.delayed)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;

        Ok(JobCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn list(
        &self,
        channel: Channel,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = self.keys(channel);
        let mut conn = self.connection().await?;
        let stop = limit as isize - 1;

        let ids: Vec<String> = match state {
            JobState::Waiting => {
                // Oldest first: the claim end is the right.
                let mut ids: Vec<String> = redis::cmd("LRANGE")
                    .arg(&keys.waiting)
                    .arg(-(limit as isize))
                    .arg(-1)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_err)?;
                ids.reverse();
                ids
            }
            JobState::Delayed => redis::cmd("ZRANGE")
                .arg(&keys.delayed)
                .arg(0)
                .arg(stop)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?,
            JobState::Active | JobState::Completed | JobState::Failed => {
                let list = match state {
                    JobState::Active => &keys.active,
                    JobState::Completed => &keys.completed,
                    _ => &keys.failed,
                };
                redis::cmd("LRANGE")
                    .arg(list)
                    .arg(0)
                    .arg(stop)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_err)?
            }
        };

        self.load_many(&mut conn, &keys, &ids).await
    }

    async fn requeue_active(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let keys = self.keys(channel);
        let mut conn = self.connection().await?;

        // Newest claim on the left; pushing right-to-claim-end keeps the
        // oldest stalled job first in line.
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(&keys.active)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        let mut recovered = 0;
        for id in &ids {
            let Some(mut job) = self.load(&mut conn, &keys, id).await? else {
                continue;
            };
            job.mark_stalled(now);

            let moved: i64 = self
                .requeue_script
                .key(&keys.active)
                .key(&keys.jobs)
                .key(&keys.waiting)
                .arg(id)
                .arg(encode(&job)?)
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            if moved >= 0 {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn retry_failed(
        &self,
        channel: Channel,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let keys = self.keys(channel);
        let mut conn = self.connection().await?;
        let raw_id = id.to_string();

        let removed: i64 = redis::cmd("LREM")
            .arg(&keys.failed)
            .arg(1)
            .arg(&raw_id)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        let job = self.load(&mut conn, &keys, &raw_id).await?;
        let mut job = match (removed, job) {
            (0, Some(_)) => return Err(StoreError::NotFailed(id)),
            (_, None) => return Err(StoreError::NotFound(id)),
            (_, Some(job)) => job,
        };

        job.reset_for_replay(now);
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&keys.jobs)
            .arg(&raw_id)
            .arg(encode(&job)?)
            .ignore()
            .cmd("LPUSH")
            .arg(&keys.waiting)
            .arg(&raw_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(job)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn reconnect(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.write().await;
        *guard = None;

        let mut conn = self.open().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        *guard = Some(conn);
        info!("redis connection established");
        Ok(())
    }
}

fn encode(job: &Job) -> Result<String, StoreError> {
    serde_json::to_string(job).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(json: &str) -> Result<Job, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn map_redis_err(err: redis::RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Storage(err.to_string())
    }
}
