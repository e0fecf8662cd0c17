use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use crate::{
    clients::ledger::IdempotencyLedger,
    errors::LedgerError,
    models::status::{ClaimOutcome, ClaimToken, LedgerStatus},
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS notification_ledger (
    message_id       TEXT PRIMARY KEY,
    status           TEXT NOT NULL,
    lease_expires_at TIMESTAMPTZ,
    claim_token      TEXT,
    updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
);
ALTER TABLE notification_ledger ADD COLUMN IF NOT EXISTS claim_token TEXT;
"#;

// A conflicting row is only taken over when its lease has lapsed and it is
// not settled.
const CLAIM: &str = r#"
INSERT INTO notification_ledger (message_id, status, lease_expires_at, claim_token, updated_at)
VALUES ($1, 'processing', now() + ($2::BIGINT * INTERVAL '1 millisecond'), $3, now())
ON CONFLICT (message_id) DO UPDATE
    SET status = 'processing',
        lease_expires_at = EXCLUDED.lease_expires_at,
        claim_token = EXCLUDED.claim_token,
        updated_at = now()
    WHERE notification_ledger.status = 'processing'
      AND notification_ledger.lease_expires_at < now()
RETURNING message_id
"#;

const SETTLE: &str = r#"
INSERT INTO notification_ledger (message_id, status, lease_expires_at, updated_at)
VALUES ($1, $2, NULL, now())
ON CONFLICT (message_id) DO UPDATE
    SET status = EXCLUDED.status,
        lease_expires_at = NULL,
        claim_token = NULL,
        updated_at = now()
"#;

const RELEASE: &str = r#"
DELETE FROM notification_ledger
WHERE message_id = $1 AND status = 'processing' AND claim_token = $2
"#;

const STATUS: &str = "SELECT status FROM notification_ledger WHERE message_id = $1";

/// Idempotency ledger backed by a PostgreSQL table with a unique key on
/// `message_id`.
pub struct PostgresLedger {
    client: Arc<Client>,
}

impl PostgresLedger {
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| LedgerError::Unavailable(format!("Failed to connect to database: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        client.batch_execute(SCHEMA).await?;

        info!("PostgreSQL connection established");

        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn status(&self, message_id: &str) -> Result<Option<String>, LedgerError> {
        let row = self.client.query_opt(STATUS, &[&message_id]).await?;
        Ok(row.map(|r| r.get::<_, String>(0)))
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresLedger {
    async fn has(&self, message_id: &str) -> Result<bool, LedgerError> {
        let status = self.status(message_id).await?;
        Ok(status.as_deref().and_then(LedgerStatus::parse).is_some())
    }

    async fn try_claim(
        &self,
        message_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, LedgerError> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let token = ClaimToken::generate();

        let claimed = self
            .client
            .query_opt(CLAIM, &[&message_id, &lease_ms, &token.as_str()])
            .await?;

        if claimed.is_some() {
            debug!(message_id, "Ledger claim taken");
            return Ok(ClaimOutcome::Claimed(token));
        }

        let outcome = match self.status(message_id).await?.as_deref() {
            Some(status) => LedgerStatus::parse(status)
                .map(ClaimOutcome::Settled)
                .unwrap_or(ClaimOutcome::InFlight),
            None => ClaimOutcome::InFlight,
        };

        Ok(outcome)
    }

    async fn settle(&self, message_id: &str, status: LedgerStatus) -> Result<(), LedgerError> {
        self.client
            .execute(SETTLE, &[&message_id, &status.as_str()])
            .await?;

        debug!(message_id, status = %status, "Ledger entry settled");
        Ok(())
    }

    async fn release(&self, message_id: &str, token: &ClaimToken) -> Result<(), LedgerError> {
        self.client
            .execute(RELEASE, &[&message_id, &token.as_str()])
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
