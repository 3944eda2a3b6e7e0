//! A Redis-backed shared store for limiter coordination.
//!
//! Layout under the configured key prefix:
//!
//! - `{prefix}:instances`: hash of instance id to registration JSON
//! - `{prefix}:allocations`: hash of instance id to allocation JSON
//! - `{prefix}:usage:{model}:{dim}:{window}`: hash of instance id to
//!   committed usage, written with `HINCRBY`
//! - `{prefix}:inflight:{instance}`: hash of model id to in-flight count
//! - `{prefix}:config:models` and `{prefix}:config:mean`: configuration
//!   mirrored for operators
//! - `{prefix}:allocations:changed`: pub/sub channel for allocation pushes
//!
//! Registration, the stale-instance sweep and the pool recomputation run in
//! one server-evaluated script, so every instance observes either the old
//! allocation set or the new one, never a mix.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::json;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::window::{DAY_MS, MINUTE_MS};

use super::{
    AllocationCallback, AllocationInfo, DistributedBackend, GlobalLimits, InstanceRegistration,
    ReservationOutline, Subscription, UsageDelta, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_INSTANCE_TIMEOUT_MS,
};

impl From<redis::RedisError> for Error {
    fn from(error: redis::RedisError) -> Self {
        Error::Backend(error.to_string())
    }
}

/// Registration + sweep + recomputation, in one atomic step.
const REGISTER_SCRIPT: &str = r#"
local instances_key = KEYS[1]
local allocations_key = KEYS[2]
local instance_id = ARGV[1]
local now = tonumber(ARGV[2])
local timeout = tonumber(ARGV[3])
local models = cjson.decode(ARGV[5])
local mean = cjson.decode(ARGV[6])
local minute_window = ARGV[7]
local day_window = ARGV[8]
local prefix = ARGV[9]
local channel = ARGV[10]

redis.call('HSET', instances_key, instance_id, ARGV[4])

local live = {}
local entries = redis.call('HGETALL', instances_key)
for i = 1, #entries, 2 do
  local id = entries[i]
  local ok, record = pcall(cjson.decode, entries[i + 1])
  if not ok or now - tonumber(record.last_heartbeat) > timeout then
    redis.call('HDEL', instances_key, id)
    redis.call('HDEL', allocations_key, id)
  else
    live[#live + 1] = id
  end
end
local count = #live
if count == 0 then count = 1 end

local function window_usage(model_id, dim, window)
  local used = 0
  local vals = redis.call('HVALS', prefix .. ':usage:' .. model_id .. ':' .. dim .. ':' .. window)
  for _, v in ipairs(vals) do used = used + tonumber(v) end
  return used
end

local pools = {}
for model_id, limits in pairs(models) do
  local slots = nil
  local pool = {}
  local function share(limit, dim, window, per_job)
    if limit == nil or limit == cjson.null then return nil end
    local remaining = limit - window_usage(model_id, dim, window)
    if remaining < 0 then remaining = 0 end
    local instance_share = math.floor(limit / count)
    local remaining_share = math.floor(remaining / count)
    if remaining_share > instance_share then instance_share = remaining_share end
    if per_job ~= nil and per_job ~= cjson.null and per_job > 0 then
      local fit = math.floor(instance_share / per_job)
      if slots == nil or fit < slots then slots = fit end
    end
    return instance_share
  end
  pool.tokens_per_minute = share(limits.tokens_per_minute, 'tpm', minute_window, mean.tokens)
  pool.requests_per_minute = share(limits.requests_per_minute, 'rpm', minute_window, mean.requests)
  pool.tokens_per_day = share(limits.tokens_per_day, 'tpd', day_window, mean.tokens)
  pool.requests_per_day = share(limits.requests_per_day, 'rpd', day_window, mean.requests)
  if slots == nil then
    pool.total_slots = 0
  elseif slots < 1 then
    pool.total_slots = 1
  else
    pool.total_slots = slots
  end
  pools[model_id] = pool
end

local allocation
if next(pools) == nil then
  allocation = '{"pools":{},"dynamic_limits":true}'
else
  allocation = cjson.encode({ pools = pools, dynamic_limits = true })
end
for _, id in ipairs(live) do
  redis.call('HSET', allocations_key, id, allocation)
end
redis.call('PUBLISH', channel, allocation)
return allocation
"#;

/// Check every globally limited dimension, then debit them all, atomically.
const ACQUIRE_SCRIPT: &str = r#"
local prefix = ARGV[1]
local model = ARGV[2]
local instance = ARGV[3]
local dims = cjson.decode(ARGV[4])

for _, d in ipairs(dims) do
  if d.limit ~= nil and d.limit ~= cjson.null then
    local key = prefix .. ':usage:' .. model .. ':' .. d.dim .. ':' .. d.window
    local used = 0
    local vals = redis.call('HVALS', key)
    for _, v in ipairs(vals) do used = used + tonumber(v) end
    if used + d.amount > d.limit then return 0 end
  end
end
for _, d in ipairs(dims) do
  if d.amount > 0 then
    local key = prefix .. ':usage:' .. model .. ':' .. d.dim .. ':' .. d.window
    redis.call('HINCRBY', key, instance, d.amount)
    redis.call('PEXPIRE', key, d.ttl)
  end
end
redis.call('HINCRBY', prefix .. ':inflight:' .. instance, model, 1)
return 1
"#;

/// Connection settings for [`RedisBackend`].
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    /// Redis connection URL.
    pub url: String,
    /// Prefix for every key the backend touches.
    pub key_prefix: String,
    /// Instances silent for longer than this are evicted.
    pub instance_timeout_ms: u64,
    /// How often instances should re-register.
    pub heartbeat_interval_ms: u64,
    /// Global limits and mean estimates the pools are carved from.
    pub limits: GlobalLimits,
}

impl RedisBackendConfig {
    /// Settings with the default prefix, timeout and heartbeat.
    pub fn new(url: impl Into<String>, limits: GlobalLimits) -> Self {
        Self {
            url: url.into(),
            key_prefix: "admission".to_string(),
            instance_timeout_ms: DEFAULT_INSTANCE_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            limits,
        }
    }
}

/// A [`DistributedBackend`] storing the registry in Redis.
pub struct RedisBackend {
    config: RedisBackendConfig,
    client: redis::Client,
    connection: ConnectionManager,
    register_script: Script,
    acquire_script: Script,
    clock: Arc<dyn Clock>,
}

impl RedisBackend {
    /// Connect and mirror the configuration into the store.
    pub async fn connect(config: RedisBackendConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client.clone()).await?;

        let backend = Self {
            config,
            client,
            connection,
            register_script: Script::new(REGISTER_SCRIPT),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            clock: Arc::new(SystemClock),
        };
        backend.write_config().await?;
        Ok(backend)
    }

    /// Override the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.config.key_prefix)
    }

    fn channel(&self) -> String {
        self.key("allocations:changed")
    }

    async fn write_config(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        let models = encode(&self.config.limits.models)?;
        let mean = encode(&self.config.limits.mean_estimate)?;
        redis::pipe()
            .set(self.key("config:models"), models)
            .set(self.key("config:mean"), mean)
            .query_async::<_, ()>(&mut connection)
            .await?;
        Ok(())
    }

}

/// The per-dimension debit plan for one reservation, as the acquire script
/// consumes it. Unlimited dimensions carry no `limit` key so the script skips
/// their admission check.
fn debit_dims(limits: &GlobalLimits, outline: &ReservationOutline) -> serde_json::Value {
    let model = limits.models.get(&outline.model_id);
    let dim = |name: &str, window: u64, amount: u64, limit: Option<u64>, window_ms: u64| {
        let mut entry = json!({
            "dim": name,
            "window": window.to_string(),
            "amount": amount,
            "ttl": window_ms * 2,
        });
        if let Some(limit) = limit {
            entry["limit"] = json!(limit);
        }
        entry
    };

    json!([
        dim(
            "tpm",
            outline.minute_window,
            outline.estimate.tokens,
            model.and_then(|m| m.tokens_per_minute),
            MINUTE_MS,
        ),
        dim(
            "rpm",
            outline.minute_window,
            outline.estimate.requests,
            model.and_then(|m| m.requests_per_minute),
            MINUTE_MS,
        ),
        dim(
            "tpd",
            outline.day_window,
            outline.estimate.tokens,
            model.and_then(|m| m.tokens_per_day),
            DAY_MS,
        ),
        dim(
            "rpd",
            outline.day_window,
            outline.estimate.requests,
            model.and_then(|m| m.requests_per_day),
            DAY_MS,
        ),
    ])
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|error| Error::Backend(error.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_str(value).map_err(|error| Error::Backend(error.to_string()))
}

#[async_trait]
impl DistributedBackend for RedisBackend {
    async fn register(&self, registration: &InstanceRegistration) -> Result<AllocationInfo> {
        let mut connection = self.connection.clone();
        let now = self.clock.now_ms();

        let allocation: String = self
            .register_script
            .key(self.key("instances"))
            .key(self.key("allocations"))
            .arg(&registration.instance_id)
            .arg(now)
            .arg(self.config.instance_timeout_ms)
            .arg(encode(registration)?)
            .arg(encode(&self.config.limits.models)?)
            .arg(encode(&self.config.limits.mean_estimate)?)
            .arg(now / MINUTE_MS)
            .arg(now / DAY_MS)
            .arg(&self.config.key_prefix)
            .arg(self.channel())
            .invoke_async(&mut connection)
            .await?;

        decode(&allocation)
    }

    async fn unregister(&self, instance_id: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        redis::pipe()
            .hdel(self.key("instances"), instance_id)
            .hdel(self.key("allocations"), instance_id)
            .del(self.key(&format!("inflight:{instance_id}")))
            .query_async::<_, ()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn acquire(&self, outline: &ReservationOutline) -> Result<bool> {
        let mut connection = self.connection.clone();
        let admitted: i64 = self
            .acquire_script
            .arg(&self.config.key_prefix)
            .arg(&outline.model_id)
            .arg(&outline.instance_id)
            .arg(debit_dims(&self.config.limits, outline).to_string())
            .invoke_async(&mut connection)
            .await?;
        Ok(admitted == 1)
    }

    async fn release(&self, delta: &UsageDelta) -> Result<()> {
        let mut connection = self.connection.clone();
        let usage_key = |dim: &str, window: u64| {
            self.key(&format!("usage:{}:{dim}:{window}", delta.model_id))
        };
        let adjust = |estimated: u64, actual: u64| -> i64 {
            i64::try_from(actual).unwrap_or(i64::MAX) - i64::try_from(estimated).unwrap_or(i64::MAX)
        };

        let mut pipe = redis::pipe();
        let deltas = [
            ("tpm", delta.minute_window, delta.estimate.tokens, delta.actual_tokens),
            ("rpm", delta.minute_window, delta.estimate.requests, delta.actual_requests),
            ("tpd", delta.day_window, delta.estimate.tokens, delta.actual_tokens),
            ("rpd", delta.day_window, delta.estimate.requests, delta.actual_requests),
        ];
        for (dim, window, estimated, actual) in deltas {
            let adjustment = adjust(estimated, actual);
            if adjustment != 0 {
                pipe.hincr(usage_key(dim, window), &delta.instance_id, adjustment);
            }
        }
        pipe.hincr(
            self.key(&format!("inflight:{}", delta.instance_id)),
            &delta.model_id,
            -1,
        );
        pipe.query_async::<_, ()>(&mut connection).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        instance_id: &str,
        callback: AllocationCallback,
    ) -> Result<Subscription> {
        let client = self.client.clone();
        let channel = self.channel();
        let instance = instance_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                if let Err(error) = listen(&client, &channel, &callback).await {
                    warn!(
                        %error,
                        instance = %instance,
                        "allocation subscription lost, reconnecting"
                    );
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        Ok(Subscription::new(move || handle.abort()))
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_interval_ms)
    }
}

async fn listen(
    client: &redis::Client,
    channel: &str,
    callback: &AllocationCallback,
) -> Result<()> {
    let connection = client.get_async_connection().await?;
    let mut pubsub = connection.into_pubsub();
    pubsub.subscribe(channel).await?;

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let payload: String = message.get_payload()?;
        match decode::<AllocationInfo>(&payload) {
            Ok(allocation) => callback(allocation),
            Err(error) => warn!(%error, "ignoring malformed allocation push"),
        }
    }
    Err(Error::Backend("allocation push stream ended".to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::config::{ModelConfig, ResourceEstimate};

    use super::*;

    fn backend_config() -> RedisBackendConfig {
        let mut models = HashMap::new();
        models.insert(
            "m".to_string(),
            ModelConfig {
                tokens_per_minute: Some(100),
                requests_per_minute: None,
                ..ModelConfig::default()
            },
        );
        RedisBackendConfig::new(
            "redis://localhost:6379",
            GlobalLimits {
                models,
                mean_estimate: ResourceEstimate {
                    tokens: 10,
                    requests: 1,
                    memory_kb: 0,
                },
            },
        )
    }

    #[test]
    fn scripts_cover_the_store_layout() {
        for verb in ["HSET", "HDEL", "HGETALL", "HVALS", "PUBLISH"] {
            assert!(REGISTER_SCRIPT.contains(verb), "register script uses {verb}");
        }
        for verb in ["HVALS", "HINCRBY", "PEXPIRE"] {
            assert!(ACQUIRE_SCRIPT.contains(verb), "acquire script uses {verb}");
        }
    }

    #[test]
    fn debit_plan_omits_unconfigured_limits() {
        let config = backend_config();
        let outline = ReservationOutline {
            instance_id: "a".to_string(),
            model_id: "m".to_string(),
            estimate: ResourceEstimate {
                tokens: 10,
                requests: 1,
                memory_kb: 0,
            },
            minute_window: 7,
            day_window: 3,
        };

        let dims = debit_dims(&config.limits, &outline);
        let dims = dims.as_array().unwrap();
        assert_eq!(dims.len(), 4);

        let tpm = &dims[0];
        assert_eq!(tpm["dim"], "tpm");
        assert_eq!(tpm["window"], "7");
        assert_eq!(tpm["amount"], 10);
        assert_eq!(tpm["limit"], 100);

        let rpm = &dims[1];
        assert_eq!(rpm["dim"], "rpm");
        assert!(rpm.get("limit").is_none(), "unlimited dimension has no key");

        let tpd = &dims[2];
        assert_eq!(tpd["window"], "3");
        assert_eq!(tpd["ttl"], DAY_MS * 2);
    }
}
