use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::{info, warn};

use crate::{
    clients::ledger::IdempotencyLedger,
    errors::LedgerError,
    models::status::{ClaimOutcome, ClaimToken, LedgerStatus},
};

const PROCESSING: &str = "processing";

// Deletes the key only while it still holds this claim's marker.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

pub struct RedisLedger {
    connection: MultiplexedConnection,
    idempotency_ttl_seconds: u64,
}

impl RedisLedger {
    pub async fn connect(redis_url: &str, idempotency_ttl_seconds: u64) -> Result<Self, LedgerError> {
        info!("Connecting to Redis");

        let client = Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            idempotency_ttl_seconds,
        })
    }

    fn key(message_id: &str) -> String {
        format!("idempotency:{}", message_id)
    }

    fn processing_marker(token: &ClaimToken) -> String {
        format!("{}:{}", PROCESSING, token.as_str())
    }

    async fn current(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let mut conn = self.connection.clone();
        Ok(conn.get(key).await?)
    }
}

#[async_trait]
impl IdempotencyLedger for RedisLedger {
    async fn has(&self, message_id: &str) -> Result<bool, LedgerError> {
        let value = self.current(&Self::key(message_id)).await?;
        Ok(value.as_deref().and_then(LedgerStatus::parse).is_some())
    }

    async fn try_claim(
        &self,
        message_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, LedgerError> {
        let key = Self::key(message_id);
        let token = ClaimToken::generate();
        let mut conn = self.connection.clone();

        let claimed: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(Self::processing_marker(&token))
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed(token));
        }

        match self.current(&key).await?.as_deref() {
            Some(marker) if marker.starts_with(PROCESSING) => Ok(ClaimOutcome::InFlight),
            Some(other) => match LedgerStatus::parse(other) {
                Some(status) => Ok(ClaimOutcome::Settled(status)),
                None => {
                    warn!(key = %key, value = other, "Unknown idempotency marker, treating as in flight");
                    Ok(ClaimOutcome::InFlight)
                }
            },
            // Lease expired between SET and GET.
            None => Ok(ClaimOutcome::InFlight),
        }
    }

    async fn settle(&self, message_id: &str, status: LedgerStatus) -> Result<(), LedgerError> {
        let mut conn = self.connection.clone();

        conn.set_ex::<_, _, ()>(
            Self::key(message_id),
            status.as_str(),
            self.idempotency_ttl_seconds,
        )
        .await?;

        Ok(())
    }

    async fn release(&self, message_id: &str, token: &ClaimToken) -> Result<(), LedgerError> {
        let mut conn = self.connection.clone();

        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(message_id))
            .arg(Self::processing_marker(token))
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        let mut conn = self.connection.clone();
        conn.ping::<String>().await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
