//! Fills missing subscriber ids on crosswalk rows by email lookup. The
//! lookup endpoint has stricter per-endpoint limits than the shared
//! budget, so requests are spaced out instead of burst through the bucket.

use crate::{
    error::ClientError,
    mailerlite::Client,
    repository::crosswalk,
};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::instrument;

const CHUNK: u64 = 100;
const REQUEST_SPACING: Duration = Duration::from_millis(500);
const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdRepairOutcome {
    pub records_updated: u64,
    pub errors: u64,
    pub message: String,
}

pub struct IdRepairOrchestrator {
    db: Arc<DatabaseConnection>,
    client: Client,
}

impl IdRepairOrchestrator {
    pub fn new(db: Arc<DatabaseConnection>, client: Client) -> Self {
        Self { db, client }
    }

    /// One chunk of repairs. Repaired rows leave the missing-id set, so
    /// every invocation starts at offset zero.
    #[instrument(name = "id_repair", skip_all)]
    pub async fn run(&self) -> Result<IdRepairOutcome, anyhow::Error> {
        let rows = crosswalk::page_missing_subscriber_id(self.db.as_ref(), 0, CHUNK).await?;
        let scanned = rows.len() as u64;
        let mut updated = 0u64;
        let mut not_found = 0u64;
        let mut errors = 0u64;

        for (index, row) in rows.iter().enumerate() {
            if index > 0 {
                sleep(REQUEST_SPACING).await;
            }
            match self.client.get_by_email(&row.email).await {
                Ok(Some(subscriber)) => {
                    crosswalk::set_subscriber_id(self.db.as_ref(), &row.email, &subscriber.id)
                        .await?;
                    updated += 1;
                }
                Ok(None) => {
                    not_found += 1;
                }
                Err(err @ ClientError::RateLimited { .. }) => {
                    // no retry within the chunk; give the budget time to recover
                    errors += 1;
                    tracing::warn!(email = %row.email, error = %err, "rate limited during id repair, pausing");
                    sleep(RATE_LIMIT_PAUSE).await;
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    errors += 1;
                    tracing::warn!(email = %row.email, error = %err, "id repair lookup failed");
                }
            }
        }

        let message = format!(
            "checked {scanned} crosswalk rows with missing subscriber id: \
             {updated} repaired, {not_found} not found in mailerlite, {errors} errors"
        );
        tracing::info!(scanned, updated, not_found, errors, "id repair chunk finished");
        Ok(IdRepairOutcome {
            records_updated: updated,
            errors,
            message,
        })
    }
}
