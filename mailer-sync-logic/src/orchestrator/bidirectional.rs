//! Time-budgeted reconciliation over both stores. The import leg pages
//! the mailerlite listing by cursor, the export leg pages local clients by
//! email order; each feeds the record synchronizer and checkpoints after
//! every page so an interrupted run resumes where it stopped.

use crate::{
    mailerlite::Client,
    orchestrator::Deadline,
    record_sync::{RecordSyncReport, RecordSynchronizer, SyncOptions},
    repository::{
        clients,
        sync_state::{self, keys},
    },
    status::{self, Component, ComponentStatus, LastSync, RunState},
    types::SyncDirection,
};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::instrument;

const PAGE_SIZE: u64 = 100;
const SOURCE: &str = "bidirectional";

/// Resume point for the import leg, persisted after every page and deleted
/// when the listing is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCursor {
    pub cursor: Option<String>,
    pub records_processed: u64,
    pub updated_at: DateTime<Utc>,
}

const EXPORT_CURSOR_PREFIX: &str = "offset:";

/// The opaque resume cursor handed back to callers: either a mailerlite
/// listing cursor (import leg) or a local paging offset (export leg).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeCursor {
    Import(String),
    ExportOffset(u64),
}

impl ResumeCursor {
    pub fn parse(raw: &str) -> Self {
        match raw
            .strip_prefix(EXPORT_CURSOR_PREFIX)
            .and_then(|rest| rest.parse().ok())
        {
            Some(offset) => ResumeCursor::ExportOffset(offset),
            None => ResumeCursor::Import(raw.to_string()),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ResumeCursor::Import(cursor) => cursor.clone(),
            ResumeCursor::ExportOffset(offset) => format!("{EXPORT_CURSOR_PREFIX}{offset}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BidirectionalParams {
    pub direction: SyncDirection,
    pub max_records: u64,
    pub max_duration: Duration,
    pub dry_run: bool,
    pub cursor: Option<String>,
}

impl Default for BidirectionalParams {
    fn default() -> Self {
        Self {
            direction: SyncDirection::Both,
            max_records: 500,
            max_duration: Duration::from_secs(120),
            dry_run: false,
            cursor: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidirectionalOutcome {
    pub records_processed: u64,
    pub conflicts_detected: u64,
    pub updates_applied: u64,
    pub errors: u64,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl BidirectionalOutcome {
    fn absorb(&mut self, report: &RecordSyncReport) {
        self.updates_applied += u64::from(report.updates_applied);
        self.conflicts_detected += u64::from(report.conflicts_detected);
        self.errors += u64::from(report.errors);
    }
}

#[derive(Clone)]
pub struct BidirectionalOrchestrator {
    db: Arc<DatabaseConnection>,
    client: Client,
    synchronizer: RecordSynchronizer,
}

impl BidirectionalOrchestrator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        client: Client,
        synchronizer: RecordSynchronizer,
    ) -> Self {
        Self {
            db,
            client,
            synchronizer,
        }
    }

    #[instrument(name = "bidirectional_sync", skip_all, fields(direction = ?params.direction, dry_run = params.dry_run))]
    pub async fn run(
        &self,
        params: &BidirectionalParams,
    ) -> Result<BidirectionalOutcome, anyhow::Error> {
        let component = match params.direction {
            SyncDirection::Both => Component::FullSync,
            _ => Component::IncrementalSync,
        };
        let mut outcome = BidirectionalOutcome::default();

        if status::is_paused(self.db.as_ref(), component).await? {
            tracing::info!("sync is paused, exiting clean");
            return Ok(outcome);
        }
        if !params.dry_run {
            status::update_component(self.db.as_ref(), component, |status| {
                *status = ComponentStatus::running(None);
            })
            .await?;
        }

        let deadline = Deadline::new(params.max_duration);
        let result = self
            .run_legs(params, component, deadline, &mut outcome)
            .await;

        match result {
            Ok(()) => {
                if !params.dry_run {
                    let direction = params.direction;
                    let (processed, errors, done) =
                        (outcome.records_processed, outcome.errors, outcome.done);
                    let mut status_doc = status::load(self.db.as_ref()).await?;
                    status_doc.component_mut(component).finish(
                        if done {
                            RunState::Completed
                        } else {
                            RunState::Running
                        },
                        Some(format!("{processed} records processed, {errors} errors")),
                    );
                    status_doc.last_sync = Some(LastSync {
                        direction: Some(direction.as_str().to_string()),
                        finished_at: Some(Utc::now()),
                        records_processed: processed,
                        errors,
                    });
                    status::save(self.db.as_ref(), &status_doc).await?;
                }
                Ok(outcome)
            }
            Err(err) => {
                if !params.dry_run {
                    status::update_component(self.db.as_ref(), component, |status| {
                        status.finish(RunState::Failed, Some(format!("{err:#}")));
                    })
                    .await?;
                }
                Err(err)
            }
        }
    }

    async fn run_legs(
        &self,
        params: &BidirectionalParams,
        component: Component,
        deadline: Deadline,
        outcome: &mut BidirectionalOutcome,
    ) -> Result<(), anyhow::Error> {
        let resume = params.cursor.as_deref().map(ResumeCursor::parse);
        let mut export_offset = 0u64;
        let mut skip_import = false;
        match &resume {
            Some(ResumeCursor::ExportOffset(offset)) => {
                export_offset = *offset;
                skip_import = true;
            }
            Some(ResumeCursor::Import(raw)) if !params.direction.imports() => {
                // an export-only caller may hand back a bare offset
                export_offset = raw.parse().unwrap_or(0);
            }
            _ => {}
        }

        let mut import_done = true;
        if params.direction.imports() && !skip_import {
            let start_cursor = match &resume {
                Some(ResumeCursor::Import(cursor)) => Some(cursor.clone()),
                _ => sync_state::get::<_, ImportCursor>(self.db.as_ref(), keys::IMPORT_CURSOR)
                    .await?
                    .and_then(|checkpoint| checkpoint.cursor),
            };
            import_done = self
                .import_leg(params, component, deadline, start_cursor, outcome)
                .await?;
        }

        let mut export_done = !params.direction.exports();
        if params.direction.exports() && import_done {
            if deadline.exhausted() || outcome.records_processed >= params.max_records {
                if outcome.next_cursor.is_none() {
                    outcome.next_cursor =
                        Some(ResumeCursor::ExportOffset(export_offset).encode());
                }
            } else {
                export_done = self
                    .export_leg(params, component, deadline, export_offset, outcome)
                    .await?;
            }
        }

        outcome.done = import_done && (export_done || !params.direction.exports());
        Ok(())
    }

    /// Mailerlite → local. The cursor only ever follows `next_cursor`
    /// forward; it is persisted after every completed page.
    async fn import_leg(
        &self,
        params: &BidirectionalParams,
        component: Component,
        deadline: Deadline,
        start_cursor: Option<String>,
        outcome: &mut BidirectionalOutcome,
    ) -> Result<bool, anyhow::Error> {
        let mut cursor = start_cursor;
        loop {
            if outcome.records_processed >= params.max_records || deadline.exhausted() {
                outcome.next_cursor = cursor.map(|c| ResumeCursor::Import(c).encode());
                return Ok(false);
            }

            let remaining = params.max_records - outcome.records_processed;
            let limit = PAGE_SIZE.min(remaining).max(1) as u32;
            let page = match self.client.list_page(cursor.as_deref(), limit).await {
                Ok(page) => page,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    outcome.errors += 1;
                    tracing::warn!(error = %err, "mailerlite listing failed, returning resume cursor");
                    outcome.next_cursor = cursor.map(|c| ResumeCursor::Import(c).encode());
                    return Ok(false);
                }
            };
            let page_len = page.subscribers.len();

            let opts = SyncOptions {
                direction: params.direction,
                dry_run: params.dry_run,
                source: SOURCE,
            };
            for subscriber in &page.subscribers {
                match self
                    .synchronizer
                    .sync_email(&subscriber.email, Some(subscriber), &opts)
                    .await
                {
                    Ok(report) => outcome.absorb(&report),
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        outcome.errors += 1;
                        tracing::warn!(email = %subscriber.email, error = %err, "record sync failed");
                    }
                }
                outcome.records_processed += 1;
            }

            cursor = page.next_cursor;
            if !params.dry_run {
                sync_state::set(
                    self.db.as_ref(),
                    keys::IMPORT_CURSOR,
                    &ImportCursor {
                        cursor: cursor.clone(),
                        records_processed: outcome.records_processed,
                        updated_at: Utc::now(),
                    },
                )
                .await?;
                status::update_component(self.db.as_ref(), component, |status| status.touch())
                    .await?;
            }

            if cursor.is_none() || page_len == 0 {
                if !params.dry_run {
                    sync_state::delete(self.db.as_ref(), keys::IMPORT_CURSOR).await?;
                }
                return Ok(true);
            }
        }
    }

    /// Local → mailerlite, paged by `(email asc, offset)`.
    async fn export_leg(
        &self,
        params: &BidirectionalParams,
        component: Component,
        deadline: Deadline,
        mut offset: u64,
        outcome: &mut BidirectionalOutcome,
    ) -> Result<bool, anyhow::Error> {
        loop {
            if outcome.records_processed >= params.max_records || deadline.exhausted() {
                outcome.next_cursor = Some(ResumeCursor::ExportOffset(offset).encode());
                return Ok(false);
            }

            let remaining = params.max_records - outcome.records_processed;
            let limit = PAGE_SIZE.min(remaining).max(1);
            let rows = clients::page_by_email(self.db.as_ref(), offset, limit).await?;
            if rows.is_empty() {
                return Ok(true);
            }
            let fetched = rows.len() as u64;

            let opts = SyncOptions {
                direction: params.direction,
                dry_run: params.dry_run,
                source: SOURCE,
            };
            for row in &rows {
                match self.synchronizer.sync_email(&row.email, None, &opts).await {
                    Ok(report) => outcome.absorb(&report),
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        outcome.errors += 1;
                        tracing::warn!(email = %row.email, error = %err, "record sync failed");
                    }
                }
                outcome.records_processed += 1;
            }

            offset += fetched;
            if !params.dry_run {
                status::update_component(self.db.as_ref(), component, |status| status.touch())
                    .await?;
            }
            if fetched < limit {
                return Ok(true);
            }
        }
    }
}

/// The long-lived worker loop replacing one-shot invocations: one budgeted
/// iteration per interval, pause flag honored inside `run`.
pub fn spawn_worker(
    orchestrator: BidirectionalOrchestrator,
    settings: crate::settings::WorkerSettings,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let params = BidirectionalParams {
                direction: settings.direction,
                max_records: settings.max_records,
                max_duration: settings.max_duration,
                dry_run: false,
                cursor: None,
            };
            match orchestrator.run(&params).await {
                Ok(outcome) => {
                    tracing::info!(
                        records_processed = outcome.records_processed,
                        updates_applied = outcome.updates_applied,
                        conflicts_detected = outcome.conflicts_detected,
                        errors = outcome.errors,
                        done = outcome.done,
                        "scheduled sync iteration finished"
                    );
                }
                Err(err) => {
                    tracing::error!(error = ?err, "scheduled sync iteration failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resume_cursor_round_trips_both_legs() {
        let import = ResumeCursor::Import("eyJpZCI6IDQyfQ".to_string());
        assert_eq!(ResumeCursor::parse(&import.encode()), import);

        let export = ResumeCursor::ExportOffset(300);
        assert_eq!(export.encode(), "offset:300");
        assert_eq!(ResumeCursor::parse(&export.encode()), export);
    }

    #[test]
    fn malformed_offset_cursor_falls_back_to_import() {
        assert_eq!(
            ResumeCursor::parse("offset:abc"),
            ResumeCursor::Import("offset:abc".to_string())
        );
    }

    #[test]
    fn import_cursor_serializes_with_the_dashboard_keys() {
        let checkpoint = ImportCursor {
            cursor: Some("abc".to_string()),
            records_processed: 250,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["cursor"], "abc");
        assert_eq!(json["recordsProcessed"], 250);
        assert!(json.get("updatedAt").is_some());
    }

    #[test]
    fn outcome_serializes_with_the_api_keys() {
        let outcome = BidirectionalOutcome {
            records_processed: 10,
            conflicts_detected: 2,
            updates_applied: 7,
            errors: 1,
            done: false,
            next_cursor: Some("offset:10".to_string()),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["recordsProcessed"], 10);
        assert_eq!(json["conflictsDetected"], 2);
        assert_eq!(json["updatesApplied"], 7);
        assert_eq!(json["errors"], 1);
        assert_eq!(json["done"], false);
        assert_eq!(json["nextCursor"], "offset:10");
    }

    #[test]
    fn finished_outcome_omits_the_cursor() {
        let outcome = BidirectionalOutcome {
            done: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("nextCursor").is_none());
    }
}
