//! Per-email reconciliation. All effects of one record — local writes,
//! remote writes, shadow advance, ledger and log inserts — happen inside a
//! single transaction holding the per-email advisory lock, so concurrent
//! runs serialize per record and a failed record leaves its shadow
//! untouched for the next run to retry.

use crate::{
    error::{ClientError, SyncError},
    mailerlite,
    merge::{self, Decision, FieldDecision, FieldUpdate, MergeOutcome},
    repository::{clients, conflicts, crosswalk, locks, shadows, sync_log},
    types::{
        canonical_email, is_valid_email, FieldView, LogAction, LogDirection, LogResult,
        ManagedField, ShadowSnapshot, Subscriber, SyncDirection,
    },
};
use anyhow::anyhow;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub direction: SyncDirection,
    pub dry_run: bool,
    /// Tag embedded in log dedupe keys, naming the invoking orchestrator.
    pub source: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSyncReport {
    pub email: String,
    pub created: bool,
    pub updates_applied: u32,
    pub conflicts_detected: u32,
    pub errors: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<FieldDecision>,
}

impl RecordSyncReport {
    fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    UseLocal,
    UseMailerlite,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReport {
    pub email: String,
    pub field: ManagedField,
    pub resolved_value: Option<String>,
}

enum FetchOutcome {
    Found(Subscriber),
    Absent,
    Failed,
}

#[derive(Clone)]
pub struct RecordSynchronizer {
    db: Arc<DatabaseConnection>,
    client: mailerlite::Client,
}

impl RecordSynchronizer {
    pub fn new(db: Arc<DatabaseConnection>, client: mailerlite::Client) -> Self {
        Self { db, client }
    }

    /// Reconcile one email end to end. Per-field write failures are logged
    /// and counted but do not fail the call; only database failures and
    /// fatal auth errors do.
    pub async fn sync_email(
        &self,
        raw_email: &str,
        subscriber_hint: Option<&Subscriber>,
        opts: &SyncOptions,
    ) -> Result<RecordSyncReport, SyncError> {
        let email = canonical_email(raw_email);
        let mut report = RecordSyncReport::new(&email);

        if !is_valid_email(&email) {
            report.errors += 1;
            if !opts.dry_run {
                sync_log::append(
                    self.db.as_ref(),
                    sync_log::LogRow::new(
                        opts.source,
                        &email,
                        LogAction::Skip,
                        LogDirection::None,
                        LogResult::Error,
                    )
                    .error("validation", None),
                )
                .await?;
            }
            return Ok(report);
        }

        let txn = self.db.begin().await?;
        locks::acquire_record_lock(&txn, &email).await?;

        let crosswalk_row = crosswalk::get_by_email(&txn, &email).await?;
        let shadow = match shadows::get(&txn, &email).await? {
            Some(row) => shadows::parse_snapshot(&row)?,
            None => ShadowSnapshot::empty(),
        };
        let client_row = clients::get_by_email(&txn, &email).await?;

        match client_row {
            None => {
                self.sync_absent_local(txn, &email, crosswalk_row, subscriber_hint, opts, &mut report)
                    .await?
            }
            Some(client_row) => {
                self.sync_present_local(
                    txn,
                    &email,
                    client_row,
                    crosswalk_row,
                    shadow,
                    subscriber_hint,
                    opts,
                    &mut report,
                )
                .await?
            }
        }
        Ok(report)
    }

    /// No local row yet: on an import path the record is materialized from
    /// its mailerlite side.
    async fn sync_absent_local(
        &self,
        txn: DatabaseTransaction,
        email: &str,
        crosswalk_row: Option<mailer_sync_entity::sync_crosswalk::Model>,
        subscriber_hint: Option<&Subscriber>,
        opts: &SyncOptions,
        report: &mut RecordSyncReport,
    ) -> Result<(), SyncError> {
        if !opts.direction.imports() {
            txn.commit().await?;
            return Ok(());
        }

        let outcome = match subscriber_hint {
            Some(subscriber) => FetchOutcome::Found(subscriber.clone()),
            None => {
                self.fetch_subscriber(&txn, email, crosswalk_row.as_ref(), opts, report)
                    .await?
            }
        };

        match outcome {
            FetchOutcome::Failed => {
                txn.commit().await?;
            }
            FetchOutcome::Absent => {
                // present in neither store; nothing to reconcile
                txn.commit().await?;
            }
            FetchOutcome::Found(subscriber) => {
                if opts.dry_run {
                    report.created = true;
                    return Ok(());
                }
                let created = clients::create_from_subscriber(&txn, email, &subscriber).await?;
                crosswalk::upsert_link(&txn, email, Some(created.id), Some(&subscriber.id))
                    .await?;
                sync_log::append(
                    &txn,
                    sync_log::LogRow::new(
                        opts.source,
                        email,
                        LogAction::Create,
                        LogDirection::MailerliteToLocal,
                        LogResult::Applied,
                    ),
                )
                .await?;
                let snapshot = ShadowSnapshot::new(
                    clients::field_view(&created),
                    Some(subscriber.fields.clone()),
                    true,
                );
                shadows::upsert(&txn, email, &snapshot).await?;
                txn.commit().await?;
                report.created = true;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_present_local(
        &self,
        txn: DatabaseTransaction,
        email: &str,
        client_row: mailer_sync_entity::clients::Model,
        crosswalk_row: Option<mailer_sync_entity::sync_crosswalk::Model>,
        shadow: ShadowSnapshot,
        subscriber_hint: Option<&Subscriber>,
        opts: &SyncOptions,
        report: &mut RecordSyncReport,
    ) -> Result<(), SyncError> {
        let local_view = clients::field_view(&client_row);

        let outcome = match subscriber_hint {
            Some(subscriber) => FetchOutcome::Found(subscriber.clone()),
            None => {
                self.fetch_subscriber(&txn, email, crosswalk_row.as_ref(), opts, report)
                    .await?
            }
        };

        let subscriber = match outcome {
            FetchOutcome::Failed => {
                txn.commit().await?;
                return Ok(());
            }
            FetchOutcome::Absent => {
                if !opts.direction.exports() {
                    txn.commit().await?;
                    return Ok(());
                }
                return self
                    .export_create(txn, email, &client_row, &local_view, opts, report)
                    .await;
            }
            FetchOutcome::Found(subscriber) => subscriber,
        };

        if !opts.dry_run {
            crosswalk::upsert_link(&txn, email, Some(client_row.id), Some(&subscriber.id))
                .await?;
        }

        let shadow_mailerlite = shadow.mailerlite.clone().unwrap_or_default();
        let outcome = merge::decide(
            &local_view,
            &subscriber.fields,
            &shadow.local,
            &shadow_mailerlite,
        );
        report.decisions = outcome.decisions.clone();

        if opts.dry_run {
            report.updates_applied =
                (outcome.updates_local.len() + outcome.updates_mailerlite.len()) as u32;
            report.conflicts_detected = outcome.conflicts.len() as u32;
            return Ok(());
        }

        if !outcome.updates_local.is_empty() {
            clients::update_managed_fields(&txn, email, &outcome.updates_local).await?;
            for update in &outcome.updates_local {
                sync_log::append(
                    &txn,
                    sync_log::LogRow::new(
                        opts.source,
                        email,
                        fill_aware_action(update),
                        LogDirection::MailerliteToLocal,
                        LogResult::Applied,
                    )
                    .field(update.field)
                    .values(local_view.raw(update.field), update.value.clone()),
                )
                .await?;
                report.updates_applied += 1;
            }
        }

        let mut mailerlite_applied = true;
        if !outcome.updates_mailerlite.is_empty() {
            match self.client.update(&subscriber.id, &outcome.updates_mailerlite).await {
                Ok(_) => {
                    for update in &outcome.updates_mailerlite {
                        sync_log::append(
                            &txn,
                            sync_log::LogRow::new(
                                opts.source,
                                email,
                                fill_aware_action(update),
                                LogDirection::LocalToMailerlite,
                                LogResult::Applied,
                            )
                            .field(update.field)
                            .values(subscriber.fields.raw(update.field), update.value.clone()),
                        )
                        .await?;
                        report.updates_applied += 1;
                    }
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    mailerlite_applied = false;
                    report.errors += 1;
                    tracing::warn!(email, error = %err, "mailerlite update failed");
                    for update in &outcome.updates_mailerlite {
                        sync_log::append(
                            &txn,
                            sync_log::LogRow::new(
                                opts.source,
                                email,
                                fill_aware_action(update),
                                LogDirection::LocalToMailerlite,
                                LogResult::Error,
                            )
                            .field(update.field)
                            .error(err.kind(), err.status_code()),
                        )
                        .await?;
                    }
                }
            }
        }

        for conflict in &outcome.conflicts {
            let inserted = conflicts::insert_pending(
                &txn,
                email,
                conflict.field,
                &conflict.local,
                &conflict.mailerlite,
            )
            .await?;
            if inserted {
                sync_log::append(
                    &txn,
                    sync_log::LogRow::new(
                        opts.source,
                        email,
                        LogAction::Conflict,
                        LogDirection::None,
                        LogResult::Conflict,
                    )
                    .field(conflict.field)
                    .values(
                        Some(conflict.local.clone()),
                        Some(conflict.mailerlite.clone()),
                    ),
                )
                .await?;
            }
            report.conflicts_detected += 1;
        }

        let next = next_shadow(
            &shadow,
            &local_view,
            &subscriber.fields,
            &outcome,
            mailerlite_applied,
        );
        shadows::upsert(&txn, email, &next).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Export path for a local record mailerlite has never seen.
    async fn export_create(
        &self,
        txn: DatabaseTransaction,
        email: &str,
        client_row: &mailer_sync_entity::clients::Model,
        local_view: &FieldView,
        opts: &SyncOptions,
        report: &mut RecordSyncReport,
    ) -> Result<(), SyncError> {
        if opts.dry_run {
            report.created = true;
            return Ok(());
        }
        match self.client.create(email, local_view).await {
            Ok(created) => {
                crosswalk::upsert_link(&txn, email, Some(client_row.id), Some(&created.id))
                    .await?;
                clients::set_mailerlite_id_if_absent(&txn, email, &created.id).await?;
                sync_log::append(
                    &txn,
                    sync_log::LogRow::new(
                        opts.source,
                        email,
                        LogAction::Create,
                        LogDirection::LocalToMailerlite,
                        LogResult::Applied,
                    ),
                )
                .await?;
                let snapshot = ShadowSnapshot::new(
                    local_view.clone(),
                    Some(created.fields.clone()),
                    true,
                );
                shadows::upsert(&txn, email, &snapshot).await?;
                txn.commit().await?;
                report.created = true;
            }
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                report.errors += 1;
                tracing::warn!(email, error = %err, "mailerlite create failed");
                sync_log::append(
                    &txn,
                    sync_log::LogRow::new(
                        opts.source,
                        email,
                        LogAction::Create,
                        LogDirection::LocalToMailerlite,
                        LogResult::Error,
                    )
                    .error(err.kind(), err.status_code()),
                )
                .await?;
                txn.commit().await?;
            }
        }
        Ok(())
    }

    /// Resolve the current mailerlite view: stored id first, then email
    /// lookup. A stored id mailerlite no longer knows is cleared so the
    /// id-repair pass can regenerate it.
    async fn fetch_subscriber(
        &self,
        txn: &DatabaseTransaction,
        email: &str,
        crosswalk_row: Option<&mailer_sync_entity::sync_crosswalk::Model>,
        opts: &SyncOptions,
        report: &mut RecordSyncReport,
    ) -> Result<FetchOutcome, SyncError> {
        if let Some(id) = crosswalk_row.and_then(|row| row.subscriber_id.clone()) {
            match self.client.get_by_id(&id).await {
                Ok(Some(subscriber)) => return Ok(FetchOutcome::Found(subscriber)),
                Ok(None) => {
                    tracing::info!(email, subscriber_id = %id, "stored subscriber id unknown to mailerlite, clearing");
                    if !opts.dry_run {
                        crosswalk::clear_subscriber_id(txn, email).await?;
                    }
                }
                Err(err) => return self.fetch_failed(txn, email, err, opts, report).await,
            }
        }
        match self.client.get_by_email(email).await {
            Ok(Some(subscriber)) => Ok(FetchOutcome::Found(subscriber)),
            Ok(None) => Ok(FetchOutcome::Absent),
            Err(err) => self.fetch_failed(txn, email, err, opts, report).await,
        }
    }

    async fn fetch_failed(
        &self,
        txn: &DatabaseTransaction,
        email: &str,
        err: ClientError,
        opts: &SyncOptions,
        report: &mut RecordSyncReport,
    ) -> Result<FetchOutcome, SyncError> {
        if err.is_fatal() {
            return Err(err.into());
        }
        report.errors += 1;
        tracing::warn!(email, error = %err, "mailerlite lookup failed");
        if !opts.dry_run {
            sync_log::append(
                txn,
                sync_log::LogRow::new(
                    opts.source,
                    email,
                    LogAction::Update,
                    LogDirection::None,
                    LogResult::Error,
                )
                .error(err.kind(), err.status_code()),
            )
            .await?;
        }
        Ok(FetchOutcome::Failed)
    }

    /// Apply an operator decision to a pending conflict: the chosen value
    /// is written to both stores and becomes the new shadow baseline, so
    /// the next reconciliation reads clean until either side drifts again.
    pub async fn resolve_conflict(
        &self,
        id: i64,
        resolution: ConflictResolution,
        source: &'static str,
    ) -> Result<ResolutionReport, SyncError> {
        let txn = self.db.begin().await?;
        let conflict = conflicts::get(&txn, id)
            .await?
            .ok_or(SyncError::ConflictNotFound { id })?;
        if conflict.status != conflicts::STATUS_PENDING {
            return Err(SyncError::ConflictNotPending { id });
        }

        let email = canonical_email(&conflict.email);
        locks::acquire_record_lock(&txn, &email).await?;

        let field = ManagedField::from_local_column(&conflict.field)
            .ok_or_else(|| SyncError::Store(anyhow!("unknown managed field {:?}", conflict.field)))?;
        let chosen = match resolution {
            ConflictResolution::UseLocal => conflict.local_value.clone(),
            ConflictResolution::UseMailerlite => conflict.mailerlite_value.clone(),
        };
        let update = FieldUpdate {
            field,
            value: chosen.clone(),
            fill_empty: false,
        };

        clients::update_managed_fields(&txn, &email, std::slice::from_ref(&update)).await?;

        let subscriber_id = crosswalk::get_by_email(&txn, &email)
            .await?
            .and_then(|row| row.subscriber_id)
            .ok_or_else(|| SyncError::Store(anyhow!("no subscriber id linked for {email}")))?;
        self.client
            .update(&subscriber_id, std::slice::from_ref(&update))
            .await
            .map_err(SyncError::Client)?;

        let mut snapshot = match shadows::get(&txn, &email).await? {
            Some(row) => shadows::parse_snapshot(&row)?,
            None => ShadowSnapshot::empty(),
        };
        snapshot.local.set(field, chosen.clone());
        let mut mailerlite_half = snapshot.mailerlite.take().unwrap_or_default();
        mailerlite_half.set(field, chosen.clone());
        snapshot.mailerlite = Some(mailerlite_half);
        snapshot.metadata.has_local = true;
        snapshot.metadata.has_mailerlite = true;
        snapshot.metadata.is_complete = true;
        shadows::upsert(&txn, &email, &snapshot).await?;

        conflicts::mark_resolved(&txn, id, chosen.as_deref()).await?;
        sync_log::append(
            &txn,
            sync_log::LogRow::new(
                source,
                &email,
                LogAction::Update,
                LogDirection::Both,
                LogResult::Applied,
            )
            .field(field)
            .values(None, chosen.clone()),
        )
        .await?;
        txn.commit().await?;

        Ok(ResolutionReport {
            email,
            field,
            resolved_value: chosen,
        })
    }
}

fn fill_aware_action(update: &FieldUpdate) -> LogAction {
    if update.fill_empty {
        LogAction::FillEmpty
    } else {
        LogAction::Update
    }
}

/// The post-merge shadow: applied and skipped fields advance to the
/// current values, conflicted fields and failed remote writes keep their
/// previous baseline so the next run sees the same drift again.
fn next_shadow(
    previous: &ShadowSnapshot,
    local: &FieldView,
    mailerlite: &FieldView,
    outcome: &MergeOutcome,
    mailerlite_applied: bool,
) -> ShadowSnapshot {
    let previous_mailerlite = previous.mailerlite.clone().unwrap_or_default();
    let mut shadow_local = FieldView::new();
    let mut shadow_mailerlite = FieldView::new();

    for decision in &outcome.decisions {
        let field = decision.field;
        match &decision.decision {
            Decision::Skip => {
                shadow_local.set(field, local.raw(field));
                shadow_mailerlite.set(field, mailerlite.raw(field));
            }
            Decision::ApplyToLocal { value } => {
                shadow_local.set(field, value.clone());
                shadow_mailerlite.set(field, mailerlite.raw(field));
            }
            Decision::ApplyToMailerlite { value } => {
                if mailerlite_applied {
                    shadow_local.set(field, local.raw(field));
                    shadow_mailerlite.set(field, value.clone());
                } else {
                    shadow_local.set(field, previous.local.raw(field));
                    shadow_mailerlite.set(field, previous_mailerlite.raw(field));
                }
            }
            Decision::Conflict { .. } => {
                shadow_local.set(field, previous.local.raw(field));
                shadow_mailerlite.set(field, previous_mailerlite.raw(field));
            }
        }
    }

    ShadowSnapshot::new(shadow_local, Some(shadow_mailerlite), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManagedField;
    use pretty_assertions::assert_eq;

    fn view(pairs: &[(ManagedField, Option<&str>)]) -> FieldView {
        FieldView::from_pairs(
            pairs
                .iter()
                .map(|(field, value)| (*field, value.map(str::to_owned))),
        )
    }

    #[test]
    fn applied_merge_produces_a_converged_shadow() {
        // S1 aftermath: the shadow must read clean on the next run.
        let shadow = ShadowSnapshot::new(
            view(&[(ManagedField::FirstName, Some("Jan"))]),
            Some(view(&[(ManagedField::FirstName, Some("Jan"))])),
            true,
        );
        let local = view(&[(ManagedField::FirstName, Some("Johan"))]);
        let mailerlite = view(&[(ManagedField::FirstName, Some("Jan"))]);

        let outcome = merge::decide(&local, &mailerlite, &shadow.local, shadow.mailerlite.as_ref().unwrap());
        let next = next_shadow(&shadow, &local, &mailerlite, &outcome, true);

        assert_eq!(next.local.get(ManagedField::FirstName), Some("Johan"));
        assert_eq!(next.mailerlite.as_ref().unwrap().get(ManagedField::FirstName), Some("Johan"));

        // idempotence: replaying against the new shadow decides nothing
        let replay = merge::decide(
            &local,
            &view(&[(ManagedField::FirstName, Some("Johan"))]),
            &next.local,
            next.mailerlite.as_ref().unwrap(),
        );
        assert!(replay.is_noop());
    }

    #[test]
    fn failed_remote_write_keeps_the_old_baseline() {
        let shadow = ShadowSnapshot::new(
            view(&[(ManagedField::City, Some("Utrecht"))]),
            Some(view(&[(ManagedField::City, Some("Utrecht"))])),
            true,
        );
        let local = view(&[(ManagedField::City, Some("Amsterdam"))]);
        let mailerlite = view(&[(ManagedField::City, Some("Utrecht"))]);

        let outcome = merge::decide(&local, &mailerlite, &shadow.local, shadow.mailerlite.as_ref().unwrap());
        let next = next_shadow(&shadow, &local, &mailerlite, &outcome, false);

        // baseline unchanged, so the next run re-detects the same change
        assert_eq!(next.local.get(ManagedField::City), Some("Utrecht"));
        let replay = merge::decide(&local, &mailerlite, &next.local, next.mailerlite.as_ref().unwrap());
        assert_eq!(replay.updates_mailerlite.len(), 1);
    }

    #[test]
    fn conflicted_fields_do_not_advance() {
        let shadow = ShadowSnapshot::new(
            view(&[(ManagedField::City, Some("Utrecht"))]),
            Some(view(&[(ManagedField::City, Some("Utrecht"))])),
            true,
        );
        let local = view(&[(ManagedField::City, Some("Amsterdam"))]);
        let mailerlite = view(&[(ManagedField::City, Some("Rotterdam"))]);

        let outcome = merge::decide(&local, &mailerlite, &shadow.local, shadow.mailerlite.as_ref().unwrap());
        assert_eq!(outcome.conflicts.len(), 1);

        let next = next_shadow(&shadow, &local, &mailerlite, &outcome, true);
        assert_eq!(next.local.get(ManagedField::City), Some("Utrecht"));
        assert_eq!(next.mailerlite.as_ref().unwrap().get(ManagedField::City), Some("Utrecht"));

        // the same conflict is re-detected (and deduped by the ledger)
        let replay = merge::decide(&local, &mailerlite, &next.local, next.mailerlite.as_ref().unwrap());
        assert_eq!(replay.conflicts.len(), 1);
    }

    #[test]
    fn mixed_outcome_advances_only_the_applied_fields() {
        let shadow = ShadowSnapshot::new(
            view(&[
                (ManagedField::FirstName, Some("Jan")),
                (ManagedField::City, Some("Utrecht")),
            ]),
            Some(view(&[
                (ManagedField::FirstName, Some("Jan")),
                (ManagedField::City, Some("Utrecht")),
            ])),
            true,
        );
        let local = view(&[
            (ManagedField::FirstName, Some("Johan")),
            (ManagedField::City, Some("Amsterdam")),
        ]);
        let mailerlite = view(&[
            (ManagedField::FirstName, Some("Jan")),
            (ManagedField::City, Some("Rotterdam")),
        ]);

        let outcome = merge::decide(&local, &mailerlite, &shadow.local, shadow.mailerlite.as_ref().unwrap());
        let next = next_shadow(&shadow, &local, &mailerlite, &outcome, true);

        assert_eq!(next.local.get(ManagedField::FirstName), Some("Johan"));
        assert_eq!(next.local.get(ManagedField::City), Some("Utrecht"));
    }
}
