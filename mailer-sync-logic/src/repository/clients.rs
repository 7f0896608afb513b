//! Access to the `clients` table, the local half of every record. The sync
//! core only ever touches the managed columns (plus `mailerlite_id` on
//! initial link creation); everything else belongs to the main application.

use crate::{
    merge::FieldUpdate,
    types::{FieldView, ManagedField, Subscriber},
};
use mailer_sync_entity::clients::{ActiveModel, Column, Entity, Model};
use sea_orm::{
    prelude::Expr, ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
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

pub async fn find_by_emails<C>(db: &C, emails: &[String]) -> Result<Vec<Model>, anyhow::Error>
where
    C: ConnectionTrait,
{
    if emails.is_empty() {
        return Ok(vec![]);
    }
    Ok(Entity::find()
        .filter(Column::Email.is_in(emails.iter().cloned()))
        .all(db)
        .await?)
}

pub async fn count<C>(db: &C) -> Result<u64, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find().count(db).await?)
}

pub async fn page_by_email<C>(
    db: &C,
    offset: u64,
    limit: u64,
) -> Result<Vec<Model>, anyhow::Error>
where
    C: ConnectionTrait,
{
    Ok(Entity::find()
        .order_by_asc(Column::Email)
        .offset(offset)
        .limit(limit)
        .all(db)
        .await?)
}

/// Column-scoped update keyed by email; only the given managed fields are
/// written, plus `updated_at`.
pub async fn update_managed_fields<C>(
    db: &C,
    email: &str,
    updates: &[FieldUpdate],
) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    if updates.is_empty() {
        return Ok(());
    }
    let mut query = Entity::update_many().filter(Column::Email.eq(email));
    for update in updates {
        query = query.col_expr(managed_column(update.field), Expr::value(update.value.clone()));
    }
    query = query.col_expr(Column::UpdatedAt, Expr::current_timestamp().into());
    query.exec(db).await?;
    Ok(())
}

/// Import path: materialize a mailerlite subscriber as a new local client.
/// `mailerlite_id` is mirrored here once, at link creation.
pub async fn create_from_subscriber<C>(
    db: &C,
    email: &str,
    subscriber: &Subscriber,
) -> Result<Model, anyhow::Error>
where
    C: ConnectionTrait,
{
    let mut active = ActiveModel {
        email: Set(email.to_string()),
        mailerlite_id: Set(Some(subscriber.id.clone())),
        ..Default::default()
    };
    for field in ManagedField::ALL {
        let value = subscriber.fields.raw(field);
        match field {
            ManagedField::FirstName => active.first_name = Set(value),
            ManagedField::LastName => active.last_name = Set(value),
            ManagedField::Phone => active.phone = Set(value),
            ManagedField::City => active.city = Set(value),
            ManagedField::Country => active.country = Set(value),
        }
    }
    Ok(active.insert(db).await?)
}

/// One-time mirror of the subscriber id, written only while still unset.
pub async fn set_mailerlite_id_if_absent<C>(
    db: &C,
    email: &str,
    mailerlite_id: &str,
) -> Result<(), anyhow::Error>
where
    C: ConnectionTrait,
{
    Entity::update_many()
        .filter(Column::Email.eq(email))
        .filter(Column::MailerliteId.is_null())
        .col_expr(Column::MailerliteId, Expr::value(Some(mailerlite_id.to_string())))
        .exec(db)
        .await?;
    Ok(())
}

pub fn managed_column(field: ManagedField) -> Column {
    match field {
        ManagedField::FirstName => Column::FirstName,
        ManagedField::LastName => Column::LastName,
        ManagedField::Phone => Column::Phone,
        ManagedField::City => Column::City,
        ManagedField::Country => Column::Country,
    }
}

/// The managed-field half of a client row, in merge-kernel shape.
pub fn field_view(model: &Model) -> FieldView {
    FieldView::from_pairs([
        (ManagedField::FirstName, model.first_name.clone()),
        (ManagedField::LastName, model.last_name.clone()),
        (ManagedField::Phone, model.phone.clone()),
        (ManagedField::City, model.city.clone()),
        (ManagedField::Country, model.country.clone()),
    ])
}
