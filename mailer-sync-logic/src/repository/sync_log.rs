//! Append-only per-field event log. Dedupe keys make replayed writes
//! idempotent at the log layer: a retry that produces the same event hits
//! the unique index and is swallowed.

use crate::types::{LogAction, LogDirection, LogResult, ManagedField};
use chrono::Utc;
use mailer_sync_entity::sync_log::{ActiveModel, Entity};
use sea_orm::{ActiveValue::Set, ConnectionTrait, EntityTrait, SqlErr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct LogRow {
    pub source: &'static str,
    pub email: String,
    pub field: Option<ManagedField>,
    pub action: LogAction,
    pub direction: LogDirection,
    pub result: LogResult,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub error_type: Option<&'static str>,
    pub status_code: Option<i32>,
}

impl LogRow {
    pub fn new(
        source: &'static str,
        email: &str,
        action: LogAction,
        direction: LogDirection,
        result: LogResult,
    ) -> Self {
        Self {
            source,
            email: email.to_string(),
            field: None,
            action,
            direction,
            result,
            old_value: None,
            new_value: None,
            error_type: None,
            status_code: None,
        }
    }

    pub fn field(mut self, field: ManagedField) -> Self {
        self.field = Some(field);
        self
    }

    pub fn values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    pub fn error(mut self, error_type: &'static str, status_code: Option<i32>) -> Self {
        self.error_type = Some(error_type);
        self.status_code = status_code;
        self
    }
}

pub async fn append<C>(db: &C, row: LogRow) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    let active = ActiveModel {
        created_at: Set(Utc::now().naive_utc()),
        email: Set(row.email.clone()),
        field: Set(row.field.map(|f| f.local_column().to_string())),
        action: Set(row.action.as_str().to_string()),
        direction: Set(row.direction.as_str().to_string()),
        result: Set(row.result.as_str().to_string()),
        old_value: Set(row.old_value),
        new_value: Set(row.new_value),
        dedupe_key: Set(dedupe_key(row.source, &row.email)),
        error_type: Set(row.error_type.map(str::to_owned)),
        status_code: Set(row.status_code),
        ..Default::default()
    };

    match Entity::insert(active).exec_without_returning(db).await {
        Ok(_) => Ok(()),
        // a retry replayed the exact same event
        Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// `"{source}-{email}-{monotonic_nanos}"`. The counter never repeats within
/// a process even when the wall clock stalls.
fn dedupe_key(source: &str, email: &str) -> String {
    format!("{source}-{email}-{}", monotonic_nanos())
}

fn monotonic_nanos() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    LAST.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(last.max(now.saturating_sub(1)) + 1)
    })
    .map(|last| last.max(now.saturating_sub(1)) + 1)
    .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_are_strictly_monotonic() {
        let mut previous = 0;
        for _ in 0..1000 {
            let next = monotonic_nanos();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn dedupe_key_embeds_source_and_email() {
        let key = dedupe_key("backfill", "jan@example.com");
        assert!(key.starts_with("backfill-jan@example.com-"));
    }
}
