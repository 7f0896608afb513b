//! Append-only ledger of unresolved field conflicts. The partial unique
//! index on `(email, field) where status = 'pending'` makes repeated
//! detections of the same divergence idempotent.

use crate::types::ManagedField;
use chrono::Utc;
use mailer_sync_entity::sync_conflicts::{ActiveModel, Column, Entity, Model};
use sea_orm::{
    prelude::Expr, sea_query::OnConflict, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_RESOLVED: &str = "resolved";

/// Returns whether a new pending conflict was recorded; `false` means the
/// same divergence is already waiting for an operator.
pub async fn insert_pending<C>(
    db: &C,
    email: &str,
    field: ManagedField,
    local_value: &str,
    mailerlite_value: &str,
) -> Result<bool, anyhow::Error>
where
    C: ConnectionTrait,
{
    let active = ActiveModel {
        email: Set(email.to_string()),
        field: Set(field.local_column().to_string()),
        local_value: Set(Some(local_value.to_string())),
        mailerlite_value: Set(Some(mailerlite_value.to_string())),
        detected_at: Set(Utc::now().naive_utc()),
        status: Set(STATUS_PENDING.to_string()),
        ..Default::default()
    };
    let inserted = Entity::insert(active)
        .on_conflict(
            OnConflict::columns([Column::Email, Column::Field])
                .target_and_where(Expr::col(Column::Status).eq(STATUS_PENDING))
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    Ok(inserted > 0)
}

pub async fn get<C>(db: &C, id: i64) -> Result<Option<Model>, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find_by_id(id).one(db).await?)
}

pub async fn mark_resolved<C>(
    db: &C,
    id: i64,
    resolved_value: Option<&str>,
) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    Entity::update_many()
        .filter(Column::Id.eq(id))
        .col_expr(Column::Status, Expr::value(STATUS_RESOLVED))
        .col_expr(
            Column::ResolvedValue,
            Expr::value(resolved_value.map(str::to_owned)),
        )
        .col_expr(Column::ResolvedAt, Expr::current_timestamp().into())
        .exec(db)
        .await?;
    Ok(())
}

pub async fn list_pending<C>(db: &C, offset: u64, limit: u64) -> Result<Vec<Model>, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find()
        .filter(Column::Status.eq(STATUS_PENDING))
        .order_by_asc(Column::DetectedAt)
        .offset(offset)
        .limit(limit)
        .all(db)
        .await?)
}

pub async fn count_pending<C>(db: &C) -> Result<u64, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find()
        .filter(Column::Status.eq(STATUS_PENDING))
        .count(db)
        .await?)
}
