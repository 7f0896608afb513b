use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Retried record syncs must not duplicate pending conflicts or log rows.
        let sql = r#"
            CREATE UNIQUE INDEX "sync_conflicts_pending_email_field"
                ON "sync_conflicts" ("email", "field") WHERE "status" = 'pending';

            CREATE UNIQUE INDEX "sync_log_dedupe_key" ON "sync_log" ("dedupe_key")
        "#;
        crate::from_sql(manager, sql).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let sql = r#"
            DROP INDEX "sync_log_dedupe_key";
            DROP INDEX "sync_conflicts_pending_email_field"
        "#;
        crate::from_sql(manager, sql).await
    }
}
