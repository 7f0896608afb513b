//! Small JSON key/value store backing orchestrator checkpoints and the
//! operator-facing status documents.

use anyhow::Context;
use chrono::Utc;
use mailer_sync_entity::sync_state::{ActiveModel, Column, Entity};
use sea_orm::{
    sea_query::OnConflict, ActiveValue::Set, ConnectionTrait, EntityTrait,
};
use serde::{de::DeserializeOwned, Serialize};

/// Key names are part of the operator-UI contract; do not rename.
pub mod keys {
    pub const BACKFILL_PROGRESS: &str = "backfill_progress";
    pub const SYNC_STATUS: &str = "sync_status";
    pub const IMPORT_CURSOR: &str = "mailerlite:import:cursor";
    pub const RATE_LIMIT_STATUS: &str = "mailerlite_rate_limit_status";
    pub const BACKFILL_INCOMPLETE_BREAKDOWN: &str = "backfill_incomplete_breakdown";
}

pub async fn get<C, T>(db: &C, key: &str) -> Result<Option<T>, anyhow::Error>
where
    C: ConnectionTrait,
    T: DeserializeOwned,
{
    let row = Entity::find_by_id(key).one(db).await?;
    match row {
        Some(row) => {
            let value = serde_json::from_value(row.value)
                .with_context(|| format!("malformed value under sync_state key {key:?}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub async fn set<C, T>(db: &C, key: &str, value: &T) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
    T: Serialize,
{
    let active = ActiveModel {
        key: Set(key.to_string()),
        value: Set(serde_json::to_value(value)?),
        updated_at: Set(Utc::now().naive_utc()),
    };
    Entity::insert(active)
        .on_conflict(
            OnConflict::column(Column::Key)
                .update_columns([Column::Value, Column::UpdatedAt])
                .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

pub async fn delete<C>(db: &C, key: &str) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    Entity::delete_by_id(key).exec(db).await?;
    Ok(())
}
