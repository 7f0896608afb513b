//! The identity map `email → (client_id, subscriber_id)` bridging the two
//! stores. Ids only ever move from null to a value; dropping a subscriber
//! id again is an explicit repair operation.

use mailer_sync_entity::sync_crosswalk::{ActiveModel, Column, Entity, Model};
use sea_orm::{
    prelude::Expr, sea_query::OnConflict, ActiveValue::Set, ColumnTrait, Condition,
    ConnectionTrait, EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Statement,
};

pub async fn get_by_email<C>(db: &C, email: &str) -> Result<Option<Model>, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find()
        .filter(Column::Email.eq(email))
        .one(db)
        .await?)
}

/// Insert the row if it does not exist yet, then populate whichever ids are
/// provided and still unset. Returns whether a new row was created.
pub async fn upsert_link<C>(
    db: &C,
    email: &str,
    client_id: Option<i64>,
    subscriber_id: Option<&str>,
) -> Result<bool, anyhow::Error>
where
    C: ConnectionTrait,
{
    let active = ActiveModel {
        email: Set(email.to_string()),
        client_id: Set(client_id),
        subscriber_id: Set(subscriber_id.map(str::to_owned)),
        ..Default::default()
    };
    let inserted = Entity::insert(active)
        .on_conflict(
            OnConflict::column(Column::Email)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    if inserted == 0 {
        if let Some(client_id) = client_id {
            set_client_id(db, email, client_id).await?;
        }
        if let Some(subscriber_id) = subscriber_id {
            set_subscriber_id(db, email, subscriber_id).await?;
        }
    }
    Ok(inserted > 0)
}

/// Populates the local id; never downgrades an existing different value.
pub async fn set_client_id<C>(db: &C, email: &str, client_id: i64) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    Entity::update_many()
        .filter(Column::Email.eq(email))
        .filter(
            Condition::any()
                .add(Column::ClientId.is_null())
                .add(Column::ClientId.eq(client_id)),
        )
        .col_expr(Column::ClientId, Expr::value(Some(client_id)))
        .col_expr(Column::UpdatedAt, Expr::current_timestamp().into())
        .exec(db)
        .await?;
    Ok(())
}

/// Populates the subscriber id; never downgrades an existing different
/// value.
pub async fn set_subscriber_id<C>(
    db: &C,
    email: &str,
    subscriber_id: &str,
) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    Entity::update_many()
        .filter(Column::Email.eq(email))
        .filter(
            Condition::any()
                .add(Column::SubscriberId.is_null())
                .add(Column::SubscriberId.eq(subscriber_id)),
        )
        .col_expr(
            Column::SubscriberId,
            Expr::value(Some(subscriber_id.to_string())),
        )
        .col_expr(Column::UpdatedAt, Expr::current_timestamp().into())
        .exec(db)
        .await?;
    Ok(())
}

/// Repair path for ids mailerlite no longer recognizes; id-repair
/// regenerates them by email lookup.
pub async fn clear_subscriber_id<C>(db: &C, email: &str) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    Entity::update_many()
        .filter(Column::Email.eq(email))
        .col_expr(Column::SubscriberId, Expr::value(None::<String>))
        .col_expr(Column::UpdatedAt, Expr::current_timestamp().into())
        .exec(db)
        .await?;
    Ok(())
}

pub async fn page_missing_subscriber_id<C>(
    db: &C,
    offset: u64,
    limit: u64,
) -> Result<Vec<Model>, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find()
        .filter(Column::SubscriberId.is_null())
        .order_by_asc(Column::Email)
        .offset(offset)
        .limit(limit)
        .all(db)
        .await?)
}

/// Rows linked on both sides, in stable email order for offset paging.
pub async fn page_pairs<C>(db: &C, offset: u64, limit: u64) -> Result<Vec<Model>, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find()
        .filter(Column::ClientId.is_not_null())
        .filter(Column::SubscriberId.is_not_null())
        .order_by_asc(Column::Email)
        .offset(offset)
        .limit(limit)
        .all(db)
        .await?)
}

pub async fn count_pairs<C>(db: &C) -> Result<u64, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find()
        .filter(Column::ClientId.is_not_null())
        .filter(Column::SubscriberId.is_not_null())
        .count(db)
        .await?)
}

pub async fn count_with_client_id<C>(db: &C) -> Result<u64, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find()
        .filter(Column::ClientId.is_not_null())
        .count(db)
        .await?)
}

#[derive(FromQueryResult)]
struct CountRow {
    count: i64,
}

/// Crosswalk rows that never got a shadow; the diagnostic scanner's input.
pub async fn page_without_shadow<C>(
    db: &C,
    offset: u64,
    limit: u64,
) -> Result<Vec<Model>, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find()
        .from_raw_sql(Statement::from_sql_and_values(
            db.get_database_backend(),
            r#"
                SELECT c.* FROM sync_crosswalk c
                LEFT JOIN sync_shadows s ON s.email = c.email
                WHERE s.id IS NULL
                ORDER BY c.email
                OFFSET $1 LIMIT $2
            "#,
            [(offset as i64).into(), (limit as i64).into()],
        ))
        .all(db)
        .await?)
}

pub async fn count_without_shadow<C>(db: &C) -> Result<u64, anyhow::Error>
where
    C: ConnectionTrait,
{
    let row = CountRow::find_by_statement(Statement::from_sql_and_values(
        db.get_database_backend(),
        r#"
            SELECT count(*) as count FROM sync_crosswalk c
            LEFT JOIN sync_shadows s ON s.email = c.email
            WHERE s.id IS NULL
        "#,
        [],
    ))
    .one(db)
    .await?;
    Ok(row.map(|row| row.count as u64).unwrap_or_default())
}
