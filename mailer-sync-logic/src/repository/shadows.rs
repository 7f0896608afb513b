//! The shadow store: last-synced joint snapshots, one per email.

use crate::types::ShadowSnapshot;
use chrono::Utc;
use mailer_sync_entity::sync_shadows::{ActiveModel, Column, Entity, Model};
use sea_orm::{
    sea_query::OnConflict, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter,
};

/// Bulk upserts go to the database in sub-batches to bound statement size.
const UPSERT_BATCH: usize = 50;

pub struct ShadowRow {
    pub email: String,
    pub snapshot: ShadowSnapshot,
}

pub async fn get<C>(db: &C, email: &str) -> Result<Option<Model>, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find()
        .filter(Column::Email.eq(email))
        .one(db)
        .await?)
}

pub async fn count<C>(db: &C) -> Result<u64, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find().count(db).await?)
}

pub async fn upsert<C>(db: &C, email: &str, snapshot: &ShadowSnapshot) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    let active = to_active(email, snapshot)?;
    Entity::insert(active)
        .on_conflict(
            OnConflict::column(Column::Email)
                .update_columns([
                    Column::Snapshot,
                    Column::ValidationStatus,
                    Column::LastValidatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    Ok(())
}

pub async fn upsert_many<C>(db: &C, rows: Vec<ShadowRow>) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    for batch in rows.chunks(UPSERT_BATCH) {
        let actives = batch
            .iter()
            .map(|row| to_active(&row.email, &row.snapshot))
            .collect::<Result<Vec<_>, _>>()?;
        Entity::insert_many(actives)
            .on_conflict(
                OnConflict::column(Column::Email)
                    .update_columns([
                        Column::Snapshot,
                        Column::ValidationStatus,
                        Column::LastValidatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await?;
    }
    Ok(())
}

pub fn parse_snapshot(model: &Model) -> Result<ShadowSnapshot, anyhow::Error> {
    Ok(serde_json::from_value(model.snapshot.clone())?)
}

fn to_active(email: &str, snapshot: &ShadowSnapshot) -> Result<ActiveModel, anyhow::Error> {
    Ok(ActiveModel {
        email: Set(email.to_string()),
        snapshot: Set(serde_json::to_value(snapshot)?),
        validation_status: Set(snapshot.validation_status().as_str().to_string()),
        last_validated_at: Set(Utc::now().naive_utc()),
        ..Default::default()
    })
}
