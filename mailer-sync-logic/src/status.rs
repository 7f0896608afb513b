//! The consolidated `sync_status` document the operator dashboard reads,
//! plus the watchdog that flags components claiming to run without making
//! progress.

use crate::repository::sync_state::{self, keys};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
const BACKFILL_STALL_AFTER_MINUTES: i64 = 10;
const SYNC_STALL_AFTER_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentStatus {
    pub status: Option<RunState>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub paused: bool,
    pub stalled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentStatus {
    pub fn running(message: Option<String>) -> Self {
        Self {
            status: Some(RunState::Running),
            last_updated_at: Some(Utc::now()),
            paused: false,
            stalled: false,
            message,
        }
    }

    pub fn finish(&mut self, state: RunState, message: Option<String>) {
        self.status = Some(state);
        self.last_updated_at = Some(Utc::now());
        self.stalled = false;
        self.message = message;
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Some(Utc::now());
        self.stalled = false;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LastSync {
    pub direction: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Statistics {
    pub clients: u64,
    pub crosswalk_pairs: u64,
    pub shadows: u64,
    pub pending_conflicts: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncStatus {
    pub backfill: ComponentStatus,
    pub full_sync: ComponentStatus,
    pub incremental_sync: ComponentStatus,
    pub last_sync: Option<LastSync>,
    pub statistics: Statistics,
}

/// Which `sync_status` slot a run reports under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Backfill,
    FullSync,
    IncrementalSync,
}

impl SyncStatus {
    pub fn component_mut(&mut self, component: Component) -> &mut ComponentStatus {
        match component {
            Component::Backfill => &mut self.backfill,
            Component::FullSync => &mut self.full_sync,
            Component::IncrementalSync => &mut self.incremental_sync,
        }
    }

    pub fn component(&self, component: Component) -> &ComponentStatus {
        match component {
            Component::Backfill => &self.backfill,
            Component::FullSync => &self.full_sync,
            Component::IncrementalSync => &self.incremental_sync,
        }
    }

    /// Flags every component that claims `running` but has not checked in
    /// within its threshold. Returns whether anything changed.
    pub fn mark_stalled(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for (component, minutes) in [
            (Component::Backfill, BACKFILL_STALL_AFTER_MINUTES),
            (Component::FullSync, SYNC_STALL_AFTER_MINUTES),
            (Component::IncrementalSync, SYNC_STALL_AFTER_MINUTES),
        ] {
            let status = self.component_mut(component);
            let is_running = status.status == Some(RunState::Running);
            let quiet_too_long = status
                .last_updated_at
                .map(|at| now - at > ChronoDuration::minutes(minutes))
                .unwrap_or(false);
            if is_running && quiet_too_long && !status.stalled {
                status.stalled = true;
                changed = true;
            }
        }
        changed
    }
}

pub async fn load(db: &DatabaseConnection) -> Result<SyncStatus, anyhow::Error> {
    Ok(sync_state::get(db, keys::SYNC_STATUS)
        .await?
        .unwrap_or_default())
}

pub async fn save(db: &DatabaseConnection, status: &SyncStatus) -> Result<(), anyhow::Error> {
    sync_state::set(db, keys::SYNC_STATUS, status).await
}

/// Read-modify-write of one component slot.
pub async fn update_component<F>(
    db: &DatabaseConnection,
    component: Component,
    mutate: F,
) -> Result<(), anyhow::Error>
where
    F: FnOnce(&mut ComponentStatus),
{
    let mut status = load(db).await?;
    mutate(status.component_mut(component));
    save(db, &status).await
}

/// Operators pause a component from the dashboard; orchestrators poll this
/// between chunks and exit clean.
pub async fn is_paused(
    db: &DatabaseConnection,
    component: Component,
) -> Result<bool, anyhow::Error> {
    Ok(load(db).await?.component(component).paused)
}

pub fn spawn_stall_watchdog(db: Arc<DatabaseConnection>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let result = async {
                let mut status = load(db.as_ref()).await?;
                if status.mark_stalled(Utc::now()) {
                    tracing::warn!("sync component stalled, flagging for operator resume");
                    save(db.as_ref(), &status).await?;
                }
                Ok::<_, anyhow::Error>(())
            }
            .await;
            if let Err(err) = result {
                tracing::warn!(error = ?err, "stall watchdog pass failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_deserializes_with_defaults() {
        let status: SyncStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(status, SyncStatus::default());
        assert!(status.backfill.status.is_none());
    }

    #[test]
    fn document_uses_camel_case_sections() {
        let json = serde_json::to_value(SyncStatus::default()).unwrap();
        assert!(json.get("backfill").is_some());
        assert!(json.get("fullSync").is_some());
        assert!(json.get("incrementalSync").is_some());
        assert!(json.get("lastSync").is_some());
        assert!(json.get("statistics").is_some());
        assert!(json["backfill"].get("lastUpdatedAt").is_some());
    }

    #[test]
    fn quiet_running_backfill_is_stalled_after_ten_minutes() {
        let mut status = SyncStatus::default();
        let now = Utc::now();
        status.backfill = ComponentStatus {
            status: Some(RunState::Running),
            last_updated_at: Some(now - ChronoDuration::minutes(11)),
            ..Default::default()
        };

        assert!(status.mark_stalled(now));
        assert!(status.backfill.stalled);
    }

    #[test]
    fn recent_or_finished_components_are_not_stalled() {
        let mut status = SyncStatus::default();
        let now = Utc::now();
        status.backfill = ComponentStatus {
            status: Some(RunState::Running),
            last_updated_at: Some(now - ChronoDuration::minutes(5)),
            ..Default::default()
        };
        status.full_sync = ComponentStatus {
            status: Some(RunState::Completed),
            last_updated_at: Some(now - ChronoDuration::minutes(60)),
            ..Default::default()
        };

        assert!(!status.mark_stalled(now));
        assert!(!status.backfill.stalled);
        assert!(!status.full_sync.stalled);
    }

    #[test]
    fn sync_components_get_a_longer_leash() {
        let mut status = SyncStatus::default();
        let now = Utc::now();
        status.full_sync = ComponentStatus {
            status: Some(RunState::Running),
            last_updated_at: Some(now - ChronoDuration::minutes(12)),
            ..Default::default()
        };
        assert!(!status.mark_stalled(now));

        status.full_sync.last_updated_at = Some(now - ChronoDuration::minutes(16));
        assert!(status.mark_stalled(now));
        assert!(status.full_sync.stalled);
    }

    #[test]
    fn mark_stalled_reports_no_change_when_already_flagged() {
        let mut status = SyncStatus::default();
        let now = Utc::now();
        status.backfill = ComponentStatus {
            status: Some(RunState::Running),
            last_updated_at: Some(now - ChronoDuration::minutes(30)),
            stalled: true,
            ..Default::default()
        };
        assert!(!status.mark_stalled(now));
    }
}
