//! Bulk shadow creation for every crosswalked pair, in three checkpointed
//! phases: build the crosswalk from the local store, augment it from the
//! mailerlite listing, then snapshot every pair. Each invocation processes
//! one chunk and persists its progress under `backfill_progress`, so a
//! killed run resumes exactly where it stopped.

use crate::{
    mailerlite::{BatchLookup, Client},
    repository::{
        clients, crosswalk, shadows,
        sync_state::{self, keys},
    },
    settings::BackfillSettings,
    status::{self, Component, RunState},
    types::{canonical_email, ShadowSnapshot},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::instrument;

/// Upper bound on background self-continuations of one chain.
pub const MAX_CONTINUATIONS: u32 = 200;

/// A `running` progress document older than this is treated as abandoned
/// and resumed from its checkpoint.
const STALE_AFTER_MINUTES: i64 = 5;

/// Batch-GET slice inside the shadow phase.
const BATCH_GET: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillPhase {
    BuildCrosswalk,
    AugmentFromMailerlite,
    CreateShadows,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackfillProgress {
    pub phase: BackfillPhase,
    pub client_offset: u64,
    pub subscriber_cursor: Option<String>,
    pub shadow_offset: u64,
    pub crosswalk_created: u64,
    pub shadows_created: u64,
    pub errors: u64,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub status: RunState,
    pub continuation_count: u32,
}

impl Default for BackfillProgress {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            phase: BackfillPhase::BuildCrosswalk,
            client_offset: 0,
            subscriber_cursor: None,
            shadow_offset: 0,
            crosswalk_created: 0,
            shadows_created: 0,
            errors: 0,
            started_at: now,
            last_updated_at: now,
            status: RunState::Running,
            continuation_count: 0,
        }
    }
}

impl BackfillProgress {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == RunState::Running
            && now - self.last_updated_at > ChronoDuration::minutes(STALE_AFTER_MINUTES)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillOutcome {
    pub message: String,
    pub progress: BackfillProgress,
    pub continue_backfill: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_continuing: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    pub clients: u64,
    pub crosswalked_clients: u64,
    pub pairs: u64,
    pub shadows: u64,
}

impl StoreCounts {
    pub async fn collect(db: &DatabaseConnection) -> Result<Self, anyhow::Error> {
        Ok(Self {
            clients: clients::count(db).await?,
            crosswalked_clients: crosswalk::count_with_client_id(db).await?,
            pairs: crosswalk::count_pairs(db).await?,
            shadows: shadows::count(db).await?,
        })
    }
}

/// Fast-forwards a (re)started run based on store counts alone, so a
/// finished or half-finished backfill never repeats work or touches the
/// mailerlite API again. Returns whether the whole run is already done.
pub(crate) fn apply_preflight(progress: &mut BackfillProgress, counts: &StoreCounts) -> bool {
    if counts.pairs > 0 && counts.shadows >= counts.pairs {
        progress.phase = BackfillPhase::Completed;
        progress.status = RunState::Completed;
        return true;
    }
    if progress.phase == BackfillPhase::BuildCrosswalk
        && counts.clients > 0
        && counts.crosswalked_clients >= counts.clients
    {
        progress.phase = BackfillPhase::CreateShadows;
        progress.shadow_offset = counts.shadows;
    }
    false
}

#[derive(Clone)]
pub struct BackfillOrchestrator {
    db: Arc<DatabaseConnection>,
    client: Client,
    settings: BackfillSettings,
}

impl BackfillOrchestrator {
    pub fn new(db: Arc<DatabaseConnection>, client: Client, settings: BackfillSettings) -> Self {
        Self {
            db,
            client,
            settings,
        }
    }

    /// Process at most one chunk, checkpoint, and report. `chained` marks
    /// invocations made by the background continuation loop.
    #[instrument(name = "backfill", skip_all)]
    pub async fn run_chunk(&self, chained: bool) -> Result<BackfillOutcome, anyhow::Error> {
        let mut progress = self.load_progress().await?;
        if chained {
            progress.continuation_count += 1;
        }

        if status::is_paused(self.db.as_ref(), Component::Backfill).await? {
            return Ok(BackfillOutcome {
                message: "backfill is paused".to_string(),
                progress,
                continue_backfill: false,
                auto_continuing: None,
            });
        }

        let counts = StoreCounts::collect(self.db.as_ref()).await?;
        if apply_preflight(&mut progress, &counts) {
            progress.last_updated_at = Utc::now();
            self.save_progress(&progress).await?;
            status::update_component(self.db.as_ref(), Component::Backfill, |component| {
                component.finish(
                    RunState::Completed,
                    Some(format!(
                        "{} pairs already shadowed",
                        counts.pairs.min(counts.shadows)
                    )),
                );
            })
            .await?;
            return Ok(BackfillOutcome {
                message: format!(
                    "backfill already complete: {} shadows cover {} pairs",
                    counts.shadows, counts.pairs
                ),
                progress,
                continue_backfill: false,
                auto_continuing: None,
            });
        }

        let phase_result = match progress.phase {
            BackfillPhase::BuildCrosswalk => self.build_crosswalk_chunk(&mut progress).await,
            BackfillPhase::AugmentFromMailerlite => self.augment_chunk(&mut progress).await,
            BackfillPhase::CreateShadows => self.shadow_chunk(&mut progress).await,
            BackfillPhase::Completed => Ok(()),
        };

        progress.last_updated_at = Utc::now();
        if let Err(err) = phase_result {
            progress.status = RunState::Failed;
            self.save_progress(&progress).await?;
            status::update_component(self.db.as_ref(), Component::Backfill, |component| {
                component.finish(RunState::Failed, Some(format!("{err:#}")));
            })
            .await?;
            return Err(err);
        }

        self.save_progress(&progress).await?;
        let done = progress.phase == BackfillPhase::Completed;
        status::update_component(self.db.as_ref(), Component::Backfill, |component| {
            if done {
                component.finish(
                    RunState::Completed,
                    Some(format!("{} shadows created", progress.shadows_created)),
                );
            } else {
                *component = status::ComponentStatus::running(Some(format!(
                    "phase {:?}, {} shadows created",
                    progress.phase, progress.shadows_created
                )));
            }
        })
        .await?;

        let message = if done {
            format!(
                "backfill completed: {} crosswalk rows created, {} shadows created, {} errors",
                progress.crosswalk_created, progress.shadows_created, progress.errors
            )
        } else {
            format!(
                "processed one chunk in phase {:?}; invoke again to continue",
                progress.phase
            )
        };
        Ok(BackfillOutcome {
            message,
            progress: progress.clone(),
            continue_backfill: !done,
            auto_continuing: None,
        })
    }

    /// Phase 1: one crosswalk row per local client, carrying over any
    /// mailerlite id the application already recorded.
    async fn build_crosswalk_chunk(
        &self,
        progress: &mut BackfillProgress,
    ) -> Result<(), anyhow::Error> {
        let chunk = self.settings.record_chunk_size;
        let rows = clients::page_by_email(self.db.as_ref(), progress.client_offset, chunk).await?;
        let fetched = rows.len() as u64;
        for row in rows {
            let email = canonical_email(&row.email);
            let created = crosswalk::upsert_link(
                self.db.as_ref(),
                &email,
                Some(row.id),
                row.mailerlite_id.as_deref(),
            )
            .await?;
            if created {
                progress.crosswalk_created += 1;
            }
        }
        progress.client_offset += fetched;
        if fetched < chunk {
            progress.phase = BackfillPhase::AugmentFromMailerlite;
            tracing::info!(
                crosswalk_created = progress.crosswalk_created,
                "crosswalk built from local store, augmenting from mailerlite"
            );
        }
        Ok(())
    }

    /// Phase 2: one listing page per chunk; subscribers unknown locally
    /// still get a crosswalk row so imports can find them later.
    async fn augment_chunk(&self, progress: &mut BackfillProgress) -> Result<(), anyhow::Error> {
        let limit = self.settings.record_chunk_size.min(u32::MAX as u64) as u32;
        let page = match self
            .client
            .list_page(progress.subscriber_cursor.as_deref(), limit)
            .await
        {
            Ok(page) => page,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                // transient: the cursor is unchanged, the next invocation retries
                progress.errors += 1;
                tracing::warn!(error = %err, "mailerlite listing failed, will retry");
                return Ok(());
            }
        };

        for subscriber in &page.subscribers {
            let created = crosswalk::upsert_link(
                self.db.as_ref(),
                &subscriber.email,
                None,
                Some(&subscriber.id),
            )
            .await?;
            if created {
                progress.crosswalk_created += 1;
            }
        }

        progress.subscriber_cursor = page.next_cursor;
        if progress.subscriber_cursor.is_none() {
            progress.phase = BackfillPhase::CreateShadows;
            progress.shadow_offset = shadows::count(self.db.as_ref()).await?;
            tracing::info!(
                shadow_offset = progress.shadow_offset,
                "mailerlite listing exhausted, creating shadows"
            );
        }
        Ok(())
    }

    /// Phase 3: snapshot pairs in batch-GET slices; the offset advances
    /// only past slices whose writes landed.
    async fn shadow_chunk(&self, progress: &mut BackfillProgress) -> Result<(), anyhow::Error> {
        let chunk = self.settings.pair_chunk_size;
        let pairs =
            crosswalk::page_pairs(self.db.as_ref(), progress.shadow_offset, chunk).await?;
        if pairs.is_empty() {
            progress.phase = BackfillPhase::Completed;
            progress.status = RunState::Completed;
            return Ok(());
        }

        let mut processed = 0u64;
        for slice in pairs.chunks(BATCH_GET) {
            let emails: Vec<String> =
                slice.iter().map(|pair| canonical_email(&pair.email)).collect();
            let lookups = match self.client.get_batch(&emails).await {
                Ok(lookups) => lookups,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    progress.errors += 1;
                    tracing::warn!(error = %err, "batch lookup failed, stopping chunk early");
                    break;
                }
            };

            let local_rows = clients::find_by_emails(self.db.as_ref(), &emails).await?;
            let local_by_email: BTreeMap<String, _> = local_rows
                .into_iter()
                .map(|row| (canonical_email(&row.email), row))
                .collect();

            let mut rows = Vec::with_capacity(slice.len());
            for email in &emails {
                let local = local_by_email.get(email);
                let mailerlite = match lookups.get(email) {
                    Some(BatchLookup::Found(subscriber)) => Some(subscriber.fields.clone()),
                    Some(BatchLookup::NotFound) | None => None,
                    Some(BatchLookup::Failed { status }) => {
                        progress.errors += 1;
                        tracing::warn!(email, status, "batch sub-request failed");
                        None
                    }
                };
                let snapshot = ShadowSnapshot::new(
                    local.map(clients::field_view).unwrap_or_default(),
                    mailerlite,
                    local.is_some(),
                );
                rows.push(shadows::ShadowRow {
                    email: email.clone(),
                    snapshot,
                });
            }
            shadows::upsert_many(self.db.as_ref(), rows).await?;
            processed += slice.len() as u64;
            progress.shadows_created += slice.len() as u64;
        }

        progress.shadow_offset += processed;
        if processed == pairs.len() as u64 && (pairs.len() as u64) < chunk {
            progress.phase = BackfillPhase::Completed;
            progress.status = RunState::Completed;
        }
        Ok(())
    }

    async fn load_progress(&self) -> Result<BackfillProgress, anyhow::Error> {
        let mut progress: BackfillProgress =
            sync_state::get(self.db.as_ref(), keys::BACKFILL_PROGRESS)
                .await?
                .unwrap_or_default();
        let now = Utc::now();
        if progress.is_stale(now) {
            tracing::warn!(
                last_updated_at = %progress.last_updated_at,
                phase = ?progress.phase,
                "resuming stale backfill run from its checkpoint"
            );
        }
        if progress.status == RunState::Failed {
            progress.status = RunState::Running;
        }
        Ok(progress)
    }

    async fn save_progress(&self, progress: &BackfillProgress) -> Result<(), anyhow::Error> {
        sync_state::set(self.db.as_ref(), keys::BACKFILL_PROGRESS, progress).await
    }
}

/// Background continuation: keeps invoking chunks until the run finishes,
/// fails, or exhausts its continuation budget.
pub fn spawn_chain(orchestrator: BackfillOrchestrator) {
    tokio::spawn(async move {
        loop {
            match orchestrator.run_chunk(true).await {
                Ok(outcome) => {
                    if !outcome.continue_backfill {
                        tracing::info!(message = %outcome.message, "backfill chain finished");
                        break;
                    }
                    if outcome.progress.continuation_count >= MAX_CONTINUATIONS {
                        tracing::warn!(
                            continuation_count = outcome.progress.continuation_count,
                            "backfill continuation budget exhausted"
                        );
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(error = ?err, "backfill continuation failed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn preflight_completes_when_shadows_cover_pairs() {
        let mut progress = BackfillProgress::default();
        let counts = StoreCounts {
            clients: 10_000,
            crosswalked_clients: 10_000,
            pairs: 10_000,
            shadows: 10_000,
        };
        assert!(apply_preflight(&mut progress, &counts));
        assert_eq!(progress.phase, BackfillPhase::Completed);
        assert_eq!(progress.status, RunState::Completed);
    }

    #[test]
    fn preflight_never_completes_an_empty_store() {
        let mut progress = BackfillProgress::default();
        let counts = StoreCounts {
            clients: 0,
            crosswalked_clients: 0,
            pairs: 0,
            shadows: 0,
        };
        assert!(!apply_preflight(&mut progress, &counts));
        assert_eq!(progress.phase, BackfillPhase::BuildCrosswalk);
    }

    #[test]
    fn preflight_jumps_past_crosswalk_building_when_done() {
        let mut progress = BackfillProgress::default();
        let counts = StoreCounts {
            clients: 500,
            crosswalked_clients: 500,
            pairs: 400,
            shadows: 120,
        };
        assert!(!apply_preflight(&mut progress, &counts));
        assert_eq!(progress.phase, BackfillPhase::CreateShadows);
        assert_eq!(progress.shadow_offset, 120);
    }

    #[test]
    fn preflight_leaves_a_resumed_listing_phase_alone() {
        let mut progress = BackfillProgress {
            phase: BackfillPhase::AugmentFromMailerlite,
            subscriber_cursor: Some("abc".to_string()),
            ..Default::default()
        };
        let counts = StoreCounts {
            clients: 500,
            crosswalked_clients: 500,
            pairs: 400,
            shadows: 120,
        };
        assert!(!apply_preflight(&mut progress, &counts));
        assert_eq!(progress.phase, BackfillPhase::AugmentFromMailerlite);
        assert_eq!(progress.subscriber_cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn progress_serializes_with_the_dashboard_keys() {
        let progress = BackfillProgress::default();
        let json = serde_json::to_value(&progress).unwrap();
        for key in [
            "phase",
            "clientOffset",
            "subscriberCursor",
            "shadowOffset",
            "crosswalkCreated",
            "shadowsCreated",
            "errors",
            "startedAt",
            "lastUpdatedAt",
            "status",
            "continuationCount",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(json["phase"], "build_crosswalk");
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn progress_round_trips_through_json() {
        let progress = BackfillProgress {
            phase: BackfillPhase::CreateShadows,
            client_offset: 1200,
            subscriber_cursor: Some("cursor".to_string()),
            shadow_offset: 450,
            crosswalk_created: 1200,
            shadows_created: 450,
            errors: 3,
            continuation_count: 17,
            ..Default::default()
        };
        let json = serde_json::to_value(&progress).unwrap();
        let parsed: BackfillProgress = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, progress);
    }

    #[test]
    fn quiet_running_progress_goes_stale_after_five_minutes() {
        let now = Utc::now();
        let mut progress = BackfillProgress::default();
        progress.last_updated_at = now - ChronoDuration::minutes(6);
        assert!(progress.is_stale(now));

        progress.status = RunState::Completed;
        assert!(!progress.is_stale(now));

        progress.status = RunState::Running;
        progress.last_updated_at = now - ChronoDuration::minutes(2);
        assert!(!progress.is_stale(now));
    }
}
