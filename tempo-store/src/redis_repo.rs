use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tempo_core::channel::{ChannelError, DeadLetter, DelayedActionChannel, Delivery};
use tempo_core::ExpiryAction;
use tracing::{info, warn};

/// Pops due ids from the schedule into the in-flight set, after first
/// returning claims whose visibility deadline has passed. Each claim bumps
/// the delivery counter and yields `{id, payload, attempts}`. Ids whose
/// payload is gone were acked by a consumer whose claim had lapsed.
const CLAIM_SCRIPT: &str = r#"
    local stale = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", ARGV[1])
    for _, id in ipairs(stale) do
        redis.call("ZREM", KEYS[2], id)
        redis.call("ZADD", KEYS[1], ARGV[1], id)
    end
    local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[2]))
    local claimed = {}
    for _, id in ipairs(due) do
        redis.call("ZREM", KEYS[1], id)
        local payload = redis.call("HGET", KEYS[3], id)
        if payload then
            redis.call("ZADD", KEYS[2], ARGV[3], id)
            local attempts = redis.call("HINCRBY", KEYS[4], id, 1)
            table.insert(claimed, {id, payload, attempts})
        else
            redis.call("HDEL", KEYS[4], id)
        end
    end
    return claimed
"#;

fn backend(e: redis::RedisError) -> ChannelError {
    ChannelError::Backend(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<String, ChannelError> {
    serde_json::to_string(value).map_err(|e| ChannelError::Encode(e.to_string()))
}

/// Redis-backed delayed action channel.
///
/// Layout under `{namespace}:expiry:`:
/// `scheduled` (zset, score = fire time ms), `inflight` (zset, score =
/// claim deadline ms), `actions` (hash of JSON actions), `attempts` (hash of
/// delivery counts) and `dead` (list).
#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
    namespace: String,
    claim_timeout: Duration,
}

impl RedisClient {
    pub async fn new(connection_string: &str, namespace: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self {
            client,
            namespace: namespace.to_string(),
            claim_timeout: Duration::seconds(60),
        })
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:expiry:{}", self.namespace, suffix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, ChannelError> {
        self.client.get_multiplexed_async_connection().await.map_err(backend)
    }

    async fn bury(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &str,
        letter: &DeadLetter,
    ) -> Result<(), ChannelError> {
        let _: () = redis::pipe()
            .atomic()
            .zrem(self.key("inflight"), id)
            .ignore()
            .hdel(self.key("actions"), id)
            .ignore()
            .hdel(self.key("attempts"), id)
            .ignore()
            .lpush(self.key("dead"), encode(letter)?)
            .ignore()
            .query_async(conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl DelayedActionChannel for RedisClient {
    async fn publish(&self, action: &ExpiryAction, fire_at: DateTime<Utc>) -> Result<(), ChannelError> {
        let mut conn = self.connection().await?;
        let id = action.action_id.to_string();
        let payload = encode(action)?;

        let _: () = redis::pipe()
            .atomic()
            .hset(self.key("actions"), &id, payload)
            .ignore()
            .zadd(self.key("scheduled"), &id, fire_at.timestamp_millis())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        info!("Expiry action {} scheduled for {}", id, fire_at);
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>, ChannelError> {
        let mut conn = self.connection().await?;
        let deadline = now + self.claim_timeout;

        let claimed: Vec<(String, String, u32)> = redis::Script::new(CLAIM_SCRIPT)
            .key(self.key("scheduled"))
            .key(self.key("inflight"))
            .key(self.key("actions"))
            .key(self.key("attempts"))
            .arg(now.timestamp_millis())
            .arg(limit)
            .arg(deadline.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        let mut deliveries = Vec::with_capacity(claimed.len());
        for (id, raw, attempts) in claimed {
            match serde_json::from_str::<ExpiryAction>(&raw) {
                Ok(action) => deliveries.push(Delivery { action, attempts }),
                Err(e) => {
                    warn!("Undecodable expiry action {}: {}", id, e);
                    let letter = DeadLetter {
                        action: None,
                        raw,
                        reason: format!("undecodable payload: {}", e),
                        attempts,
                    };
                    self.bury(&mut conn, &id, &letter).await?;
                }
            }
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        let mut conn = self.connection().await?;
        let id = delivery.action.action_id.to_string();

        let _: () = redis::pipe()
            .atomic()
            .zrem(self.key("inflight"), &id)
            .ignore()
            .hdel(self.key("actions"), &id)
            .ignore()
            .hdel(self.key("attempts"), &id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, fire_at: DateTime<Utc>) -> Result<(), ChannelError> {
        let mut conn = self.connection().await?;
        let id = delivery.action.action_id.to_string();

        let _: () = redis::pipe()
            .atomic()
            .zrem(self.key("inflight"), &id)
            .ignore()
            .zadd(self.key("scheduled"), &id, fire_at.timestamp_millis())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), ChannelError> {
        let mut conn = self.connection().await?;
        let letter = DeadLetter {
            action: Some(delivery.action.clone()),
            raw: encode(&delivery.action)?,
            reason: reason.to_string(),
            attempts: delivery.attempts,
        };
        self.bury(&mut conn, &delivery.action.action_id.to_string(), &letter).await?;
        warn!("Expiry action {} dead-lettered: {}", delivery.action.action_id, reason);
        Ok(())
    }

    async fn drain_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, ChannelError> {
        let mut conn = self.connection().await?;
        let mut letters = Vec::new();

        for _ in 0..limit {
            let raw: Option<String> = redis::cmd("RPOP")
                .arg(self.key("dead"))
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            let Some(raw) = raw else {
                break;
            };

            let letter = serde_json::from_str::<DeadLetter>(&raw).unwrap_or_else(|e| DeadLetter {
                action: None,
                raw: raw.clone(),
                reason: format!("undecodable dead letter: {}", e),
                attempts: 0,
            });
            letters.push(letter);
        }

        Ok(letters)
    }
}
