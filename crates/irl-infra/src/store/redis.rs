//! Redis bucket store: the atomic consume runs as a server-side Lua script.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, RedisError, Script};
use tokio::sync::{Mutex, RwLock};

use irl_core::domain::{BucketRequest, ConsumeOutcome};
use irl_core::ports::{BucketStore, StoreError};

/// Read-refill-consume-write in one atomic script.
///
/// KEYS[1] = bucket key; ARGV = capacity, rate, amount, now (ms).
/// Returns `{allowed (0|1), remaining (string), retryAfterMs}`; `retryAfterMs`
/// is -1 when the bucket never refills. `remaining` is sent as a string because
/// Redis truncates Lua numbers to integers in replies.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local amount = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local function finite(v)
  return type(v) == 'number' and v == v and v ~= math.huge and v ~= -math.huge
end

local tokens = capacity
local last_refill = now

local data = redis.call('GET', key)
if data then
  local ok, t = pcall(cjson.decode, data)
  if ok and type(t) == 'table' and #t >= 4 and
     finite(t[1]) and finite(t[2]) and finite(t[3]) and finite(t[4]) and
     t[1] > 0 and t[2] >= 0 then
    tokens = math.max(0, math.min(capacity, t[3]))
    last_refill = t[4]
  end
end

if now > last_refill then
  local elapsed = (now - last_refill) / 1000
  tokens = math.min(capacity, tokens + elapsed * rate)
  last_refill = now
end

local allowed = 0
if tokens >= amount then
  tokens = tokens - amount
  allowed = 1
end

local ttl = 60
if rate > 0 then
  ttl = math.ceil(capacity / rate) + 60
end
redis.call('SET', key, cjson.encode({capacity, rate, tokens, last_refill}), 'EX', ttl)

local retry_after_ms = 0
if allowed == 0 then
  if rate > 0 then
    retry_after_ms = math.min(math.ceil((amount - tokens) / rate * 1000), 9007199254740991)
  else
    retry_after_ms = -1
  end
end

return {allowed, tostring(tokens), retry_after_ms}
"#;

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Timeout for each connection attempt
    pub connect_timeout: Duration,
    /// Timeout for each command round trip
    pub command_timeout: Duration,
    /// Extra connection attempts after the first one fails
    pub connect_retries: u32,
    /// Deadline for a whole store call, connection setup included
    pub operation_timeout: Duration,
    /// How long callers fail fast after a connection attempt starts
    pub reconnect_cooldown: Duration,
    /// Whether to fall back to the in-memory store if Redis is unavailable at startup
    pub fallback_to_memory: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(1000),
            connect_retries: 2,
            operation_timeout: Duration::from_millis(1500),
            reconnect_cooldown: Duration::from_secs(1),
            fallback_to_memory: false,
        }
    }
}

impl RedisConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("REDIS_URL").unwrap_or(defaults.url),
            connect_timeout: std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            command_timeout: std::env::var("REDIS_COMMAND_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.command_timeout),
            connect_retries: std::env::var("REDIS_CONNECT_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.connect_retries),
            operation_timeout: std::env::var("REDIS_OPERATION_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.operation_timeout),
            reconnect_cooldown: std::env::var("REDIS_RECONNECT_COOLDOWN_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_cooldown),
            fallback_to_memory: std::env::var("REDIS_FALLBACK_TO_MEMORY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.fallback_to_memory),
        }
    }
}

const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Redis-backed bucket store.
///
/// The connection is established lazily on first use, so a process can start
/// while Redis is down; calls made in the meantime fail with [`StoreError`]
/// and the caller applies its failure policy. Only one caller at a time tries
/// to connect; everyone else fails fast until that attempt succeeds or its
/// cooldown runs out.
pub struct RedisBucketStore {
    client: Client,
    conn: RwLock<Option<ConnectionManager>>,
    connecting: Mutex<()>,
    /// Milliseconds since `epoch` before which no new attempt starts; 0 = none.
    retry_at_ms: AtomicU64,
    epoch: Instant,
    config: RedisConfig,
    script: Script,
}

impl RedisBucketStore {
    pub fn new(config: RedisConfig) -> Result<Self, StoreError> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            conn: RwLock::new(None),
            connecting: Mutex::new(()),
            retry_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            config,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    /// Establish the connection now rather than on first use.
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.bounded("CONNECT", async { self.connection().await.map(|_| ()) })
            .await
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }
        if self.cooling_down() {
            return Err(StoreError::Connection(
                "Redis unavailable, waiting before reconnecting".to_string(),
            ));
        }
        let Ok(_attempt) = self.connecting.try_lock() else {
            return Err(StoreError::Connection(
                "Redis connection attempt in progress".to_string(),
            ));
        };
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }

        // Armed before connecting so an attempt cut short by a deadline still
        // holds other callers off.
        self.start_cooldown();
        let conn = self.establish().await?;
        *self.conn.write().await = Some(conn.clone());
        self.retry_at_ms.store(0, Ordering::Relaxed);
        Ok(conn)
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn cooling_down(&self) -> bool {
        let retry_at = self.retry_at_ms.load(Ordering::Relaxed);
        retry_at != 0 && self.elapsed_ms() < retry_at
    }

    fn start_cooldown(&self) {
        let cooldown = u64::try_from(self.config.reconnect_cooldown.as_millis()).unwrap_or(u64::MAX);
        let retry_at = self.elapsed_ms().saturating_add(cooldown).max(1);
        self.retry_at_ms.store(retry_at, Ordering::Relaxed);
    }

    /// Bounded retries apply to connection establishment only; commands,
    /// and the consume script in particular, are never re-sent.
    async fn establish(&self) -> Result<ConnectionManager, StoreError> {
        let mut attempt = 0;
        loop {
            // The manager's own reconnect loop is disabled; retries happen here.
            let manager_config = ConnectionManagerConfig::new()
                .set_number_of_retries(0)
                .set_connection_timeout(self.config.connect_timeout)
                .set_response_timeout(self.config.command_timeout);

            let result = tokio::time::timeout(
                self.config.connect_timeout,
                ConnectionManager::new_with_config(self.client.clone(), manager_config),
            )
            .await;

            let error = match result {
                Ok(Ok(conn)) => {
                    tracing::info!("Connected to Redis bucket store");
                    return Ok(conn);
                }
                Ok(Err(e)) => StoreError::Connection(e.to_string()),
                Err(_) => StoreError::Timeout(self.config.connect_timeout.as_millis() as u64),
            };

            if attempt >= self.config.connect_retries {
                tracing::warn!(error = %error, "Redis connection failed");
                return Err(error);
            }
            attempt += 1;
            tracing::warn!(attempt, error = %error, "Redis connection failed, retrying");
            tokio::time::sleep(CONNECT_BACKOFF * attempt).await;
        }
    }

    /// One deadline over a whole store call, connection setup included.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, "Redis store call exceeded its deadline");
                Err(StoreError::Timeout(
                    self.config.operation_timeout.as_millis() as u64
                ))
            }
        }
    }

    async fn run<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(operation, error = %e, "Redis command failed");
                Err(classify(e))
            }
            Err(_) => {
                tracing::warn!(operation, "Redis command timed out");
                Err(StoreError::Timeout(
                    self.config.command_timeout.as_millis() as u64
                ))
            }
        }
    }
}

fn classify(error: RedisError) -> StoreError {
    if error.is_timeout() {
        StoreError::Timeout(0)
    } else if error.is_io_error() || error.is_connection_refusal() || error.is_connection_dropped()
    {
        StoreError::Connection(error.to_string())
    } else {
        StoreError::Protocol(error.to_string())
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.bounded("GET", async {
            let mut conn = self.connection().await?;
            self.run("GET", conn.get::<_, Option<String>>(key)).await
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.bounded("SET", async {
            let mut conn = self.connection().await?;
            self.run("SET", conn.set_ex::<_, _, ()>(key, value, ttl_secs))
                .await
        })
        .await
    }

    async fn consume(
        &self,
        key: &str,
        request: BucketRequest,
    ) -> Result<ConsumeOutcome, StoreError> {
        self.bounded("EVALSHA", async {
            let mut conn = self.connection().await?;

            let mut invocation = self.script.key(key);
            invocation
                .arg(request.capacity)
                .arg(request.rate)
                .arg(request.amount)
                .arg(request.now_ms);

            let (allowed, remaining, retry_after_ms): (i64, f64, i64) = self
                .run("EVALSHA", invocation.invoke_async(&mut conn))
                .await?;

            Ok(ConsumeOutcome {
                allowed: allowed == 1,
                remaining,
                retry_after_ms,
            })
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.bounded("PING", async {
            let mut conn = self.connection().await?;
            let cmd = redis::cmd("PING");
            let _pong: String = self.run("PING", cmd.query_async(&mut conn)).await?;
            Ok(())
        })
        .await
    }
}
