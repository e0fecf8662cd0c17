use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    errors::LedgerError,
    models::status::{ClaimOutcome, ClaimToken, LedgerStatus},
};

/// Store of message ids that reached a terminal outcome, plus short-lived
/// processing claims.
///
/// Implementations:
/// - `InMemoryLedger`: single process only, lost on restart
/// - `RedisLedger`: `SET NX PX` claims, TTL'd terminal markers
/// - `PostgresLedger`: primary key on `message_id`, `INSERT .. ON CONFLICT`
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Whether `message_id` was delivered or dead-lettered.
    async fn has(&self, message_id: &str) -> Result<bool, LedgerError>;

    /// Mark `message_id` as delivered.
    async fn record(&self, message_id: &str) -> Result<(), LedgerError> {
        self.settle(message_id, LedgerStatus::Delivered).await
    }

    /// Atomically take the processing lease unless the id is settled or
    /// leased by someone else. A lapsed lease can be taken over.
    async fn try_claim(&self, message_id: &str, lease: Duration)
    -> Result<ClaimOutcome, LedgerError>;

    async fn settle(&self, message_id: &str, status: LedgerStatus) -> Result<(), LedgerError>;

    /// Drop the processing lease identified by `token`. Settled ids and
    /// leases taken over by another worker are left untouched.
    async fn release(&self, message_id: &str, token: &ClaimToken) -> Result<(), LedgerError>;

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }

    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone)]
enum Entry {
    Processing {
        token: ClaimToken,
        expires_at: Instant,
    },
    Settled(LedgerStatus),
}

#[derive(Default)]
pub struct InMemoryLedger {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn status(&self, message_id: &str) -> Option<LedgerStatus> {
        match self.entries.lock().await.get(message_id) {
            Some(Entry::Settled(status)) => Some(*status),
            _ => None,
        }
    }

    pub async fn settled_count(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| matches!(e, Entry::Settled(_)))
            .count()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn has(&self, message_id: &str) -> Result<bool, LedgerError> {
        Ok(self.status(message_id).await.is_some())
    }

    async fn try_claim(
        &self,
        message_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, LedgerError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        match entries.get(message_id) {
            Some(Entry::Settled(status)) => return Ok(ClaimOutcome::Settled(*status)),
            Some(Entry::Processing { expires_at, .. }) if *expires_at > now => {
                return Ok(ClaimOutcome::InFlight);
            }
            _ => {}
        }

        let token = ClaimToken::generate();
        entries.insert(
            message_id.to_string(),
            Entry::Processing {
                token: token.clone(),
                expires_at: now + lease,
            },
        );

        Ok(ClaimOutcome::Claimed(token))
    }

    async fn settle(&self, message_id: &str, status: LedgerStatus) -> Result<(), LedgerError> {
        self.entries
            .lock()
            .await
            .insert(message_id.to_string(), Entry::Settled(status));
        Ok(())
    }

    async fn release(&self, message_id: &str, token: &ClaimToken) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().await;
        let owned = matches!(
            entries.get(message_id),
            Some(Entry::Processing { token: held, .. }) if held == token
        );
        if owned {
            entries.remove(message_id);
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
