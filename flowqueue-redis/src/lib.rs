//! A [`QueueStore`] backed by Redis.
//!
//! All keys live under a namespace:
//!
//! | key                   | type   | content                                   |
//! |-----------------------|--------|-------------------------------------------|
//! | `{ns}:pending`        | list   | ids of fresh jobs, oldest first           |
//! | `{ns}:processing`     | zset   | claimed ids, scored by lock deadline (ms) |
//! | `{ns}:retry`          | zset   | ids awaiting a retry, scored by due (ms)  |
//! | `{ns}:completed`      | zset   | completed ids, scored by expiry (ms)      |
//! | `{ns}:failed`         | set    | permanently failed ids                    |
//! | `{ns}:job:{id}`       | string | the JSON encoded job, with an `EX` TTL    |
//!
//! Reads go through a shared [`ConnectionManager`]. Every write runs as an optimistic
//! transaction (`WATCH`, reads, `MULTI`/`EXEC`) on a connection checked out exclusively for the
//! call, so the watch of one call never leaks into another. Transaction connections are kept in
//! a small idle pool and reused.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::TimeDelta;
use flowqueue::{
    clock::{Clock, SystemClock},
    job::{Job, JobId, JobStatus},
    store::{QueueStats, QueueStore, StoreConfig, StoreError},
};
use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    Client, Pipeline, RedisError, ToRedisArgs,
};
use tokio::sync::Mutex;

/// Upper bound of idle transaction connections kept for reuse.
pub const MAX_IDLE_TRANSACTION_CONNECTIONS: usize = 16;

#[derive(Clone)]
pub struct RedisQueueStore {
    client: Client,
    conn: ConnectionManager,
    transactions: Arc<Mutex<Vec<MultiplexedConnection>>>,
    namespace: NameSpace,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    closed: Arc<AtomicBool>,
}

fn map_err(error: RedisError) -> StoreError {
    tracing::warn!(?error, "Redis command failed: {error}");
    StoreError::Backend(error.to_string())
}

fn ttl_seconds(ttl: TimeDelta) -> u64 {
    ttl.num_seconds().max(1) as u64
}

/// Outcome of one attempt of an optimistic transaction.
enum Attempt<T> {
    Committed(T),
    /// A watched key changed before `EXEC`, nothing was written.
    Conflicted,
    /// An index entry pointing at an expired job was dropped, the operation should start over.
    Pruned,
}

async fn watch(conn: &mut MultiplexedConnection, keys: impl ToRedisArgs) -> Result<(), StoreError> {
    redis::cmd("WATCH")
        .arg(keys)
        .query_async::<_, ()>(conn)
        .await
        .map_err(map_err)
}

async fn exists(conn: &mut MultiplexedConnection, key: &NameSpacedKey<'_>) -> Result<bool, StoreError> {
    redis::cmd("EXISTS")
        .arg(key)
        .query_async(conn)
        .await
        .map_err(map_err)
}

/// Executes the atomic `pipe`, returning whether it was committed.
async fn exec(pipe: &Pipeline, conn: &mut MultiplexedConnection) -> Result<bool, StoreError> {
    let result: Option<redis::Value> = pipe.query_async(conn).await.map_err(map_err)?;
    Ok(result.is_some())
}

fn committed<T>(committed: bool, value: T) -> Attempt<T> {
    if committed {
        Attempt::Committed(value)
    } else {
        Attempt::Conflicted
    }
}

impl RedisQueueStore {
    pub async fn connect(redis_url: &str, namespace: impl ToString) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(map_err)?;

        Ok(Self {
            conn: ConnectionManager::new(client.clone())
                .await
                .map_err(map_err)?,
            transactions: Default::default(),
            client,
            namespace: NameSpace(namespace.to_string()),
            config: StoreConfig::default(),
            clock: Arc::new(SystemClock),
            closed: Default::default(),
        })
    }

    pub fn with_config(self, config: StoreConfig) -> Self {
        Self { config, ..self }
    }

    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    async fn checkout(&self) -> Result<MultiplexedConnection, StoreError> {
        self.ensure_open()?;
        if let Some(conn) = self.transactions.lock().await.pop() {
            return Ok(conn);
        }
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_err)
    }

    /// Returns `conn` to the idle pool and passes `result` through.
    ///
    /// Calls that bail out between `WATCH` and `EXEC` leave keys watched, so the connection is
    /// only reused once `UNWATCH` succeeded. Connections that saw a transport error are dropped.
    async fn checkin<T>(
        &self,
        mut conn: MultiplexedConnection,
        result: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let reusable = !matches!(result, Err(StoreError::Backend(_)))
            && redis::cmd("UNWATCH")
                .query_async::<_, ()>(&mut conn)
                .await
                .is_ok();
        if reusable {
            let mut idle = self.transactions.lock().await;
            if idle.len() < MAX_IDLE_TRANSACTION_CONNECTIONS {
                idle.push(conn);
            }
        }
        result
    }

    fn attempts(&self) -> u32 {
        self.config.max_transaction_retries.max(1)
    }

    fn deadline_ms(&self, ttl: TimeDelta) -> i64 {
        (self.clock.now() + ttl).timestamp_millis()
    }

    async fn try_enqueue(
        &self,
        conn: &mut MultiplexedConnection,
        id: JobId,
        data: &str,
    ) -> Result<Attempt<JobId>, StoreError> {
        let key = self.namespace.job(id);
        watch(conn, &key).await?;
        if exists(conn, &key).await? {
            return Err(StoreError::DuplicateJob(id));
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(&key)
            .arg(data)
            .arg("EX")
            .arg(ttl_seconds(self.config.job_ttl))
            .ignore()
            .cmd("RPUSH")
            .arg(self.namespace.pending())
            .arg(id.to_string())
            .ignore();
        Ok(committed(exec(&pipe, conn).await?, id))
    }

    async fn try_dequeue(&self, conn: &mut MultiplexedConnection) -> Result<Attempt<Job>, StoreError> {
        let pending = self.namespace.pending();
        let retry = self.namespace.retry();
        watch(conn, (&pending, &retry)).await?;

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&retry)
            .arg("-inf")
            .arg(self.clock.now().timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(conn)
            .await
            .map_err(map_err)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        let id = match due.into_iter().next() {
            Some(id) => {
                pipe.cmd("ZREM").arg(&retry).arg(&id).ignore();
                id
            }
            None => {
                let head: Option<String> = redis::cmd("LINDEX")
                    .arg(&pending)
                    .arg(0)
                    .query_async(conn)
                    .await
                    .map_err(map_err)?;
                let id = head.ok_or(StoreError::QueueEmpty)?;
                pipe.cmd("LREM").arg(&pending).arg(1).arg(&id).ignore();
                id
            }
        };

        let key = self.namespace.job(&id);
        watch(conn, &key).await?;
        let data: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(conn)
            .await
            .map_err(map_err)?;
        let Some(data) = data else {
            tracing::debug!(job_id = %id, "Dropping expired job {id} from the queue");
            return Ok(match exec(&pipe, conn).await? {
                true => Attempt::Pruned,
                false => Attempt::Conflicted,
            });
        };
        let job: Job = serde_json::from_str(&data)?;

        pipe.cmd("ZADD")
            .arg(self.namespace.processing())
            .arg(self.deadline_ms(self.config.processing_lock_ttl))
            .arg(&id)
            .ignore();
        Ok(committed(exec(&pipe, conn).await?, job))
    }

    async fn try_update(
        &self,
        conn: &mut MultiplexedConnection,
        job: &Job,
        data: &str,
    ) -> Result<Attempt<()>, StoreError> {
        let key = self.namespace.job(job.id);
        let pending = self.namespace.pending();
        let processing = self.namespace.processing();
        let retry = self.namespace.retry();
        let completed = self.namespace.completed();
        let failed = self.namespace.failed();
        let id = job.id.to_string();

        watch(conn, (&key, &pending)).await?;
        if !exists(conn, &key).await? {
            return Err(StoreError::JobNotFound(job.id));
        }
        let already_pending = job.status == JobStatus::Pending
            && redis::cmd("LPOS")
                .arg(&pending)
                .arg(&id)
                .query_async::<_, Option<i64>>(conn)
                .await
                .map_err(map_err)?
                .is_some();

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("SET").arg(&key).arg(data);
        // Failed jobs are kept, a plain SET clears any previous expiry.
        let ttl = match job.status {
            JobStatus::Completed => Some(self.config.completed_ttl),
            JobStatus::Failed => None,
            _ => Some(self.config.job_ttl),
        };
        if let Some(ttl) = ttl {
            pipe.arg("EX").arg(ttl_seconds(ttl));
        }
        pipe.ignore();

        if !already_pending {
            pipe.cmd("LREM").arg(&pending).arg(0).arg(&id).ignore();
        }
        if job.status != JobStatus::Running {
            pipe.cmd("ZREM").arg(&processing).arg(&id).ignore();
        }
        pipe.cmd("ZREM")
            .arg(&retry)
            .arg(&id)
            .ignore()
            .cmd("ZREM")
            .arg(&completed)
            .arg(&id)
            .ignore()
            .cmd("SREM")
            .arg(&failed)
            .arg(&id)
            .ignore();

        pipe.cmd("ZREMRANGEBYSCORE")
            .arg(&completed)
            .arg("-inf")
            .arg(self.clock.now().timestamp_millis())
            .ignore();

        match job.status {
            JobStatus::Pending if !already_pending => {
                pipe.cmd("RPUSH").arg(&pending).arg(&id).ignore();
            }
            JobStatus::Pending => {}
            JobStatus::Running => {
                // NX keeps the deadline of an existing claim.
                pipe.cmd("ZADD")
                    .arg(&processing)
                    .arg("NX")
                    .arg(self.deadline_ms(self.config.processing_lock_ttl))
                    .arg(&id)
                    .ignore();
            }
            JobStatus::Retrying => {
                if let Some(due) = job.next_retry_at {
                    pipe.cmd("ZADD")
                        .arg(&retry)
                        .arg(due.timestamp_millis())
                        .arg(&id)
                        .ignore();
                }
            }
            JobStatus::Completed => {
                pipe.cmd("ZADD")
                    .arg(&completed)
                    .arg(self.deadline_ms(self.config.completed_ttl))
                    .arg(&id)
                    .ignore();
            }
            JobStatus::Failed => {
                pipe.cmd("SADD").arg(&failed).arg(&id).ignore();
            }
        }
        Ok(committed(exec(&pipe, conn).await?, ()))
    }

    async fn try_delete(
        &self,
        conn: &mut MultiplexedConnection,
        id: JobId,
    ) -> Result<Attempt<()>, StoreError> {
        let key = self.namespace.job(id);
        watch(conn, &key).await?;
        if !exists(conn, &key).await? {
            return Err(StoreError::JobNotFound(id));
        }

        let member = id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .cmd("LREM")
            .arg(self.namespace.pending())
            .arg(0)
            .arg(&member)
            .ignore()
            .cmd("ZREM")
            .arg(self.namespace.processing())
            .arg(&member)
            .ignore()
            .cmd("ZREM")
            .arg(self.namespace.retry())
            .arg(&member)
            .ignore()
            .cmd("ZREM")
            .arg(self.namespace.completed())
            .arg(&member)
            .ignore()
            .cmd("SREM")
            .arg(self.namespace.failed())
            .arg(&member)
            .ignore();
        Ok(committed(exec(&pipe, conn).await?, ()))
    }

    async fn try_recover(
        &self,
        conn: &mut MultiplexedConnection,
        expired_only: bool,
    ) -> Result<Attempt<usize>, StoreError> {
        let now = self.clock.now();
        let pending = self.namespace.pending();
        let processing = self.namespace.processing();
        watch(conn, &processing).await?;

        let max_deadline = if expired_only {
            now.timestamp_millis().to_string()
        } else {
            "+inf".to_owned()
        };
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&processing)
            .arg("-inf")
            .arg(max_deadline)
            .query_async(conn)
            .await
            .map_err(map_err)?;
        if ids.is_empty() {
            return Ok(Attempt::Committed(0));
        }

        let keys: Vec<_> = ids.iter().map(|id| self.namespace.job(id)).collect();
        watch(conn, keys.as_slice()).await?;
        let records: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys.as_slice())
            .query_async(conn)
            .await
            .map_err(map_err)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut recovered = 0;
        // Pushed to the front in reverse so the longest claimed job ends up first.
        for (index, record) in records.into_iter().enumerate().rev() {
            let id = &ids[index];
            pipe.cmd("ZREM").arg(&processing).arg(id).ignore();
            let Some(record) = record else {
                continue;
            };
            let mut job: Job = serde_json::from_str(&record)?;
            job.reset_to_pending(now);
            pipe.cmd("SET")
                .arg(&keys[index])
                .arg(serde_json::to_string(&job)?)
                .arg("EX")
                .arg(ttl_seconds(self.config.job_ttl))
                .ignore()
                .cmd("LREM")
                .arg(&pending)
                .arg(0)
                .arg(id)
                .ignore()
                .cmd("LPUSH")
                .arg(&pending)
                .arg(id)
                .ignore();
            recovered += 1;
        }
        Ok(committed(exec(&pipe, conn).await?, recovered))
    }

    async fn recover_claimed(&self, expired_only: bool) -> Result<usize, StoreError> {
        let mut conn = self.checkout().await?;
        let result = async {
            for _ in 0..self.attempts() {
                match self.try_recover(&mut conn, expired_only).await? {
                    Attempt::Committed(recovered) => return Ok(recovered),
                    Attempt::Conflicted | Attempt::Pruned => {}
                }
            }
            Err(StoreError::Conflict(self.attempts()))
        }
        .await;
        self.checkin(conn, result).await
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, StoreError> {
        let data = serde_json::to_string(&job)?;
        let mut conn = self.checkout().await?;
        let result = async {
            for _ in 0..self.attempts() {
                if let Attempt::Committed(id) = self.try_enqueue(&mut conn, job.id, &data).await? {
                    return Ok(id);
                }
            }
            Err(StoreError::Conflict(self.attempts()))
        }
        .await;
        self.checkin(conn, result).await
    }

    async fn dequeue(&self) -> Result<Job, StoreError> {
        let mut conn = self.checkout().await?;
        let result = async {
            let mut conflicts = 0;
            while conflicts < self.attempts() {
                match self.try_dequeue(&mut conn).await? {
                    Attempt::Committed(job) => return Ok(job),
                    Attempt::Conflicted => conflicts += 1,
                    Attempt::Pruned => {}
                }
            }
            Err(StoreError::Conflict(conflicts))
        }
        .await;
        self.checkin(conn, result).await
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.ensure_open()?;
        let data: Option<String> = redis::cmd("GET")
            .arg(self.namespace.job(id))
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        let data = data.ok_or(StoreError::JobNotFound(id))?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        if job.status == JobStatus::Retrying && job.next_retry_at.is_none() {
            return Err(StoreError::InvalidJob {
                id: job.id,
                reason: "retrying job without a next retry time",
            });
        }
        let data = serde_json::to_string(job)?;
        let mut conn = self.checkout().await?;
        let result = async {
            for _ in 0..self.attempts() {
                if let Attempt::Committed(()) = self.try_update(&mut conn, job, &data).await? {
                    return Ok(());
                }
            }
            Err(StoreError::Conflict(self.attempts()))
        }
        .await;
        self.checkin(conn, result).await
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        let mut conn = self.checkout().await?;
        let result = async {
            for _ in 0..self.attempts() {
                if let Attempt::Committed(()) = self.try_delete(&mut conn, id).await? {
                    return Ok(());
                }
            }
            Err(StoreError::Conflict(self.attempts()))
        }
        .await;
        self.checkin(conn, result).await
    }

    async fn recover(&self) -> Result<usize, StoreError> {
        self.recover_claimed(false).await
    }

    async fn recover_expired(&self) -> Result<usize, StoreError> {
        self.recover_claimed(true).await
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.ensure_open()?;
        let completed_key = self.namespace.completed();
        let (pending, processing, retrying, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&completed_key)
            .arg("-inf")
            .arg(self.clock.now().timestamp_millis())
            .ignore()
            .cmd("LLEN")
            .arg(self.namespace.pending())
            .cmd("ZCARD")
            .arg(self.namespace.processing())
            .cmd("ZCARD")
            .arg(self.namespace.retry())
            .cmd("ZCARD")
            .arg(&completed_key)
            .cmd("SCARD")
            .arg(self.namespace.failed())
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Ok(QueueStats {
            pending,
            processing,
            retrying,
            completed,
            failed,
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct NameSpace(String);

impl NameSpace {
    fn key(&self, kind: KeyType) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind,
        }
    }

    fn pending(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Pending)
    }

    fn processing(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Processing)
    }

    fn retry(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Retry)
    }

    fn completed(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Completed)
    }

    fn failed(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Failed)
    }

    fn job(&self, id: impl ToString) -> NameSpacedKey<'_> {
        self.key(KeyType::Job(id.to_string()))
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType,
}

impl fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespace)?;
        match &self.kind {
            KeyType::Pending => write!(f, ":pending"),
            KeyType::Processing => write!(f, ":processing"),
            KeyType::Retry => write!(f, ":retry"),
            KeyType::Completed => write!(f, ":completed"),
            KeyType::Failed => write!(f, ":failed"),
            KeyType::Job(id) => write!(f, ":job:{id}"),
        }
    }
}

impl<'a> ToRedisArgs for NameSpacedKey<'a> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

enum KeyType {
    Pending,
    Processing,
    Retry,
    Completed,
    Failed,
    Job(String),
}
