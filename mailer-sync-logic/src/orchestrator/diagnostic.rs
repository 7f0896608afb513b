//! Classifies crosswalk rows that never received a shadow against the
//! mailerlite status taxonomy, so an operator can tell valid-but-unsynced
//! records from dead addresses. The breakdown is persisted for the
//! dashboard under `backfill_incomplete_breakdown`.

use crate::{
    error::ClientError,
    mailerlite::Client,
    repository::{
        crosswalk,
        sync_state::{self, keys},
    },
    types::SubscriberStatus,
};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::instrument;

const DEFAULT_BATCH_SIZE: u64 = 100;
const SAMPLES_PER_STATUS: usize = 10;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticStatus {
    Active,
    Unsubscribed,
    Bounced,
    Spam,
    Junk,
    NotFound,
    RateLimited,
    Error,
}

/// Complaint-marked subscribers land in the spam bucket; unconfirmed
/// addresses are grouped with junk since neither will ever receive mail.
impl From<SubscriberStatus> for DiagnosticStatus {
    fn from(status: SubscriberStatus) -> Self {
        match status {
            SubscriberStatus::Active => DiagnosticStatus::Active,
            SubscriberStatus::Unsubscribed => DiagnosticStatus::Unsubscribed,
            SubscriberStatus::Bounced => DiagnosticStatus::Bounced,
            SubscriberStatus::Junk => DiagnosticStatus::Spam,
            SubscriberStatus::Unconfirmed => DiagnosticStatus::Junk,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticResult {
    pub email: String,
    pub status: DiagnosticStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSummary {
    pub total: u64,
    #[serde(flatten)]
    pub counts: BTreeMap<DiagnosticStatus, u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWindow {
    pub offset: u64,
    pub size: u64,
    pub scanned: u64,
    pub remaining: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticOutcome {
    pub batch: BatchWindow,
    pub summary: DiagnosticSummary,
    pub results: Vec<DiagnosticResult>,
    pub recommendations: String,
}

/// The persisted dashboard document, with a few sample emails per bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncompleteBreakdown {
    pub generated_at: DateTime<Utc>,
    pub total_without_shadow: u64,
    pub counts: BTreeMap<DiagnosticStatus, u64>,
    pub samples: BTreeMap<DiagnosticStatus, Vec<String>>,
    pub recommendations: String,
}

pub struct DiagnosticScanner {
    db: Arc<DatabaseConnection>,
    client: Client,
}

impl DiagnosticScanner {
    pub fn new(db: Arc<DatabaseConnection>, client: Client) -> Self {
        Self { db, client }
    }

    #[instrument(name = "diagnostic_scan", skip_all)]
    pub async fn run(
        &self,
        batch_size: Option<u64>,
        offset: u64,
    ) -> Result<DiagnosticOutcome, anyhow::Error> {
        let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);
        let total_without_shadow = crosswalk::count_without_shadow(self.db.as_ref()).await?;
        let rows =
            crosswalk::page_without_shadow(self.db.as_ref(), offset, batch_size).await?;

        let mut results = Vec::with_capacity(rows.len());
        let mut counts: BTreeMap<DiagnosticStatus, u64> = BTreeMap::new();
        let mut samples: BTreeMap<DiagnosticStatus, Vec<String>> = BTreeMap::new();

        for row in &rows {
            let status = self.classify(row).await?;
            *counts.entry(status).or_default() += 1;
            let bucket = samples.entry(status).or_default();
            if bucket.len() < SAMPLES_PER_STATUS {
                bucket.push(row.email.clone());
            }
            results.push(DiagnosticResult {
                email: row.email.clone(),
                status,
                subscriber_id: row.subscriber_id.clone(),
            });
        }

        let recommendations = recommendations(&counts);
        let scanned = rows.len() as u64;

        let breakdown = IncompleteBreakdown {
            generated_at: Utc::now(),
            total_without_shadow,
            counts: counts.clone(),
            samples,
            recommendations: recommendations.clone(),
        };
        sync_state::set(
            self.db.as_ref(),
            keys::BACKFILL_INCOMPLETE_BREAKDOWN,
            &breakdown,
        )
        .await?;

        Ok(DiagnosticOutcome {
            batch: BatchWindow {
                offset,
                size: batch_size,
                scanned,
                remaining: total_without_shadow.saturating_sub(offset + scanned),
            },
            summary: DiagnosticSummary {
                total: scanned,
                counts,
            },
            results,
            recommendations,
        })
    }

    async fn classify(
        &self,
        row: &mailer_sync_entity::sync_crosswalk::Model,
    ) -> Result<DiagnosticStatus, anyhow::Error> {
        let lookup = match &row.subscriber_id {
            Some(id) => self.client.get_by_id(id).await,
            None => self.client.get_by_email(&row.email).await,
        };
        Ok(match lookup {
            Ok(Some(subscriber)) => subscriber.status.into(),
            Ok(None) => DiagnosticStatus::NotFound,
            Err(ClientError::RateLimited { .. }) => DiagnosticStatus::RateLimited,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                tracing::warn!(email = %row.email, error = %err, "diagnostic lookup failed");
                DiagnosticStatus::Error
            }
        })
    }
}

/// Human-readable next steps derived from the per-status counts.
pub(crate) fn recommendations(counts: &BTreeMap<DiagnosticStatus, u64>) -> String {
    let count = |status: DiagnosticStatus| counts.get(&status).copied().unwrap_or(0);
    let mut parts = Vec::new();

    let valid = count(DiagnosticStatus::Active) + count(DiagnosticStatus::Unsubscribed);
    if valid > 0 {
        parts.push(format!(
            "{valid} subscribers are valid records that should get shadows; run backfill"
        ));
    }
    let not_found = count(DiagnosticStatus::NotFound);
    if not_found > 0 {
        parts.push(format!(
            "{not_found} addresses are unknown to mailerlite; their crosswalk rows can be removed"
        ));
    }
    let dead = count(DiagnosticStatus::Bounced)
        + count(DiagnosticStatus::Spam)
        + count(DiagnosticStatus::Junk);
    if dead > 0 {
        parts.push(format!(
            "{dead} addresses are bounced or complaint-marked and will never sync"
        ));
    }
    let retriable = count(DiagnosticStatus::RateLimited) + count(DiagnosticStatus::Error);
    if retriable > 0 {
        parts.push(format!(
            "{retriable} lookups failed or were rate limited; re-run the scan later"
        ));
    }
    if parts.is_empty() {
        "no crosswalk rows are missing shadows".to_string()
    } else {
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert_eq!(
            DiagnosticStatus::from(SubscriberStatus::Active),
            DiagnosticStatus::Active
        );
        assert_eq!(
            DiagnosticStatus::from(SubscriberStatus::Unsubscribed),
            DiagnosticStatus::Unsubscribed
        );
        assert_eq!(
            DiagnosticStatus::from(SubscriberStatus::Bounced),
            DiagnosticStatus::Bounced
        );
        assert_eq!(
            DiagnosticStatus::from(SubscriberStatus::Junk),
            DiagnosticStatus::Spam
        );
        assert_eq!(
            DiagnosticStatus::from(SubscriberStatus::Unconfirmed),
            DiagnosticStatus::Junk
        );
    }

    #[test]
    fn recommendations_name_each_bucket_once() {
        let mut counts = BTreeMap::new();
        counts.insert(DiagnosticStatus::Unsubscribed, 40);
        counts.insert(DiagnosticStatus::NotFound, 12);
        counts.insert(DiagnosticStatus::RateLimited, 3);

        let text = recommendations(&counts);
        assert!(text.contains("40 subscribers are valid records"));
        assert!(text.contains("12 addresses are unknown to mailerlite"));
        assert!(text.contains("3 lookups failed or were rate limited"));
    }

    #[test]
    fn empty_scan_recommends_nothing() {
        assert_eq!(
            recommendations(&BTreeMap::new()),
            "no crosswalk rows are missing shadows"
        );
    }

    #[test]
    fn summary_serializes_status_counts_flat() {
        let mut counts = BTreeMap::new();
        counts.insert(DiagnosticStatus::Active, 5u64);
        counts.insert(DiagnosticStatus::NotFound, 2u64);
        let summary = DiagnosticSummary { total: 7, counts };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["total"], 7);
        assert_eq!(json["active"], 5);
        assert_eq!(json["not_found"], 2);
    }
}
