//! Redis-backed job store (sorted-set queue, Lua-atomic claim).
//!
//! ## Layout
//!
//! - `{prefix}:job:{id}`: job JSON
//! - `{prefix}:status`: hash id → status (authoritative for dedup/stats)
//! - `{prefix}:ready`: zset of claimable ids, score `rank * 1e13 + sequence`
//! - `{prefix}:delayed`: zset of DELAYED ids, score `next_retry_at` (ms)
//! - `{prefix}:active`: zset of ACTIVE ids, score lease expiry (ms)
//! - `{prefix}:owner`: hash id → `worker#attempt` claim token
//! - `{prefix}:score`: hash id → ready score
//! - `{prefix}:attempts`: hash id → attempts counter
//! - `{prefix}:all`: zset of every id by sequence (listing)
//! - `{prefix}:seq`: sequence counter
//!
//! Claim, finish, expired-lease release, lease extension and enqueue are Lua scripts, so they are
//! atomic on the server regardless of how many processes run workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;

use super::store::{Enqueued, JobStats, JobStore, JobStoreError};
use super::types::{Job, JobId, JobStatus, WorkerId, instant_after};

const DEFAULT_PREFIX: &str = "devpulse:jobs";

/// Leaves room for 10^13 sequences per priority tier.
const TIER_WIDTH: f64 = 1e13;

const ENQUEUE_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[2], ARGV[1])
if current and current ~= 'COMPLETED' and current ~= 'FAILED' then
  return redis.call('GET', KEYS[1])
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
redis.call('HSET', KEYS[6], ARGV[1], ARGV[4])
redis.call('HSET', KEYS[7], ARGV[1], 0)
redis.call('HDEL', KEYS[8], ARGV[1])
redis.call('ZREM', KEYS[9], ARGV[1])
redis.call('ZADD', KEYS[5], ARGV[6], ARGV[1])
if ARGV[3] == 'DELAYED' then
  redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
else
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
end
return false
";

const CLAIM_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('ZADD', KEYS[1], redis.call('HGET', KEYS[6], id), id)
end
local head = redis.call('ZPOPMIN', KEYS[1])
if #head == 0 then
  return false
end
local id = head[1]
local attempt = redis.call('HINCRBY', KEYS[7], id, 1)
redis.call('ZADD', KEYS[3], ARGV[3], id)
redis.call('HSET', KEYS[4], id, ARGV[2] .. '#' .. attempt)
redis.call('HSET', KEYS[5], id, 'ACTIVE')
return {id, attempt}
";

const FINISH_SCRIPT: &str = r"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HSET', KEYS[4], ARGV[1], ARGV[4])
if ARGV[4] == 'DELAYED' then
  redis.call('ZADD', KEYS[5], ARGV[5], ARGV[1])
end
return 1
";

const RELEASE_SCRIPT: &str = r"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
local expires = redis.call('ZSCORE', KEYS[2], ARGV[1])
if not expires or tonumber(expires) >= tonumber(ARGV[6]) then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HSET', KEYS[4], ARGV[1], ARGV[4])
if ARGV[4] == 'DELAYED' then
  redis.call('ZADD', KEYS[5], ARGV[5], ARGV[1])
end
return 1
";

const EXTEND_SCRIPT: &str = r"
local owner = redis.call('HGET', KEYS[1], ARGV[1])
if not owner or string.sub(owner, 1, #ARGV[2]) ~= ARGV[2] then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
";

#[derive(Clone)]
pub struct RedisJobStore {
    client: Arc<redis::Client>,
    prefix: String,
    enqueue: Arc<redis::Script>,
    claim: Arc<redis::Script>,
    finish: Arc<redis::Script>,
    release: Arc<redis::Script>,
    extend: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore").field("prefix", &self.prefix).finish()
    }
}

fn redis_err(e: redis::RedisError) -> JobStoreError {
    JobStoreError::Storage(format!("redis: {e}"))
}

fn decode(id: &str, raw: &str) -> Result<Job, JobStoreError> {
    serde_json::from_str(raw)
        .map_err(|e| JobStoreError::Storage(format!("malformed job {id}: {e}")))
}

fn encode(job: &Job) -> Result<String, JobStoreError> {
    serde_json::to_string(job).map_err(|e| JobStoreError::Storage(e.to_string()))
}

fn ready_score(job: &Job) -> f64 {
    f64::from(job.priority.rank()) * TIER_WIDTH + job.sequence as f64
}

fn claim_token(worker: &WorkerId, attempt: u32) -> String {
    format!("{worker}#{attempt}")
}

impl RedisJobStore {
    /// Create a store on `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// `prefix` defaults to `devpulse:jobs`; tests use a unique one.
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(redis_err)?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            enqueue: Arc::new(redis::Script::new(ENQUEUE_SCRIPT)),
            claim: Arc::new(redis::Script::new(CLAIM_SCRIPT)),
            finish: Arc::new(redis::Script::new(FINISH_SCRIPT)),
            release: Arc::new(redis::Script::new(RELEASE_SCRIPT)),
            extend: Arc::new(redis::Script::new(EXTEND_SCRIPT)),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{name}", self.prefix)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{id}", self.prefix)
    }

    fn conn(&self) -> Result<redis::Connection, JobStoreError> {
        self.client.get_connection().map_err(redis_err)
    }

    fn load(&self, conn: &mut redis::Connection, id: &str) -> Result<Option<Job>, JobStoreError> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(id))
            .query(conn)
            .map_err(redis_err)?;
        raw.map(|r| decode(id, &r)).transpose()
    }

    fn load_many(&self, conn: &mut redis::Connection, ids: &[String]) -> Result<Vec<Job>, JobStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.job_key(id)).collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query(conn).map_err(redis_err)?;
        ids.iter()
            .zip(raws)
            .filter_map(|(id, raw)| raw.map(|r| decode(id, &r)))
            .collect()
    }
}

impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    fn enqueue(&self, mut job: Job) -> Result<Enqueued, JobStoreError> {
        let mut conn = self.conn()?;
        let sequence: u64 = redis::cmd("INCR")
            .arg(self.key("seq"))
            .query(&mut conn)
            .map_err(redis_err)?;
        job.sequence = sequence;

        let retry_ms = job.next_retry_at.map(|t| t.timestamp_millis()).unwrap_or(0);
        let existing: Option<String> = self
            .enqueue
            .key(self.job_key(job.id.as_str()))
            .key(self.key("status"))
            .key(self.key("ready"))
            .key(self.key("delayed"))
            .key(self.key("all"))
            .key(self.key("score"))
            .key(self.key("attempts"))
            .key(self.key("owner"))
            .key(self.key("active"))
            .arg(job.id.as_str())
            .arg(encode(&job)?)
            .arg(job.status.as_str())
            .arg(ready_score(&job))
            .arg(retry_ms)
            .arg(sequence)
            .invoke(&mut conn)
            .map_err(redis_err)?;

        match existing {
            Some(raw) => Ok(Enqueued::Existing(decode(job.id.as_str(), &raw)?)),
            None => Ok(Enqueued::New(job)),
        }
    }

    fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn()?;
        self.load(&mut conn, job_id.as_str())
    }

    #[instrument(skip(self, worker, lease_duration), fields(worker = %worker), err)]
    fn claim_next(
        &self,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn()?;
        let expires_at = instant_after(now, lease_duration);

        let claimed: Option<(String, u32)> = self
            .claim
            .key(self.key("ready"))
            .key(self.key("delayed"))
            .key(self.key("active"))
            .key(self.key("owner"))
            .key(self.key("status"))
            .key(self.key("score"))
            .key(self.key("attempts"))
            .arg(now.timestamp_millis())
            .arg(worker.as_str())
            .arg(expires_at.timestamp_millis())
            .invoke(&mut conn)
            .map_err(redis_err)?;

        let Some((id, attempt)) = claimed else {
            return Ok(None);
        };
        let mut job = self
            .load(&mut conn, &id)?
            .ok_or_else(|| JobStoreError::Storage(format!("claimed job {id} has no record")))?;
        job.claim(worker.clone(), lease_duration, now);
        job.attempts = attempt;

        // Only this claim token may write the record until the lease expires.
        let _: () = redis::cmd("SET")
            .arg(self.job_key(&id))
            .arg(encode(&job)?)
            .query(&mut conn)
            .map_err(redis_err)?;
        Ok(Some(job))
    }

    #[instrument(skip(self, job, worker), fields(job_id = %job.id, worker = %worker), err)]
    fn finish(&self, job: &Job, worker: &WorkerId) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let retry_ms = job.next_retry_at.map(|t| t.timestamp_millis()).unwrap_or(0);

        let written: i32 = self
            .finish
            .key(self.job_key(job.id.as_str()))
            .key(self.key("active"))
            .key(self.key("owner"))
            .key(self.key("status"))
            .key(self.key("delayed"))
            .arg(job.id.as_str())
            .arg(claim_token(worker, job.attempts))
            .arg(encode(job)?)
            .arg(job.status.as_str())
            .arg(retry_ms)
            .invoke(&mut conn)
            .map_err(redis_err)?;

        if written == 1 {
            Ok(())
        } else {
            Err(JobStoreError::LeaseLost(job.id.clone()))
        }
    }

    #[instrument(skip(self, job, worker), fields(job_id = %job.id, worker = %worker), err)]
    fn release_expired(&self, job: &Job, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut conn = self.conn()?;
        let retry_ms = job.next_retry_at.map(|t| t.timestamp_millis()).unwrap_or(0);

        let written: i32 = self
            .release
            .key(self.job_key(job.id.as_str()))
            .key(self.key("active"))
            .key(self.key("owner"))
            .key(self.key("status"))
            .key(self.key("delayed"))
            .arg(job.id.as_str())
            .arg(claim_token(worker, job.attempts))
            .arg(encode(job)?)
            .arg(job.status.as_str())
            .arg(retry_ms)
            .arg(now.timestamp_millis())
            .invoke(&mut conn)
            .map_err(redis_err)?;

        if written == 1 {
            Ok(())
        } else {
            Err(JobStoreError::LeaseLost(job.id.clone()))
        }
    }

    fn extend_lease(
        &self,
        job_id: &JobId,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, JobStoreError> {
        let mut conn = self.conn()?;
        let expires_at = instant_after(now, lease_duration);

        let extended: i32 = self
            .extend
            .key(self.key("owner"))
            .key(self.key("active"))
            .arg(job_id.as_str())
            .arg(format!("{worker}#"))
            .arg(expires_at.timestamp_millis())
            .invoke(&mut conn)
            .map_err(redis_err)?;

        if extended == 1 {
            Ok(expires_at)
        } else {
            Err(JobStoreError::LeaseLost(job_id.clone()))
        }
    }

    fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key("active"))
            .arg("-inf")
            .arg(format!("({}", now.timestamp_millis()))
            .query(&mut conn)
            .map_err(redis_err)?;

        // A record not yet rewritten by its claimer carries no lease; skip it.
        Ok(self
            .load_many(&mut conn, &ids)?
            .into_iter()
            .filter(|j| j.status == JobStatus::Active && j.lease.is_some())
            .collect())
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut conn = self.conn()?;
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.key("all"))
            .arg(0)
            .arg(-1)
            .query(&mut conn)
            .map_err(redis_err)?;

        let selected: Vec<String> = match status {
            None => ids.into_iter().take(limit).collect(),
            Some(wanted) => {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let statuses: Vec<Option<String>> = redis::cmd("HMGET")
                    .arg(self.key("status"))
                    .arg(&ids)
                    .query(&mut conn)
                    .map_err(redis_err)?;
                ids.into_iter()
                    .zip(statuses)
                    .filter(|(_, s)| s.as_deref() == Some(wanted.as_str()))
                    .map(|(id, _)| id)
                    .take(limit)
                    .collect()
            }
        };

        self.load_many(&mut conn, &selected)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut conn = self.conn()?;
        let statuses: Vec<String> = redis::cmd("HVALS")
            .arg(self.key("status"))
            .query(&mut conn)
            .map_err(redis_err)?;

        let mut stats = JobStats::default();
        for raw in statuses {
            let status: JobStatus = raw
                .parse()
                .map_err(|e: super::types::ParseError| JobStoreError::Storage(e.to_string()))?;
            stats.record(status);
        }
        Ok(stats)
    }
}
