use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let sql = r#"
            CREATE TABLE "clients" (
                "id" bigserial PRIMARY KEY,
                "email" text NOT NULL UNIQUE,
                "first_name" text,
                "last_name" text,
                "phone" text,
                "city" text,
                "country" text,
                "mailerlite_id" text,
                "created_at" timestamp NOT NULL DEFAULT (now() at time zone 'utc'),
                "updated_at" timestamp NOT NULL DEFAULT (now() at time zone 'utc')
            );

            CREATE TABLE "sync_crosswalk" (
                "id" bigserial PRIMARY KEY,
                "email" text NOT NULL UNIQUE,
                "client_id" bigint,
                "subscriber_id" text,
                "created_at" timestamp NOT NULL DEFAULT (now() at time zone 'utc'),
                "updated_at" timestamp NOT NULL DEFAULT (now() at time zone 'utc')
            );

            CREATE TABLE "sync_shadows" (
                "id" bigserial PRIMARY KEY,
                "email" text NOT NULL UNIQUE,
                "snapshot" jsonb NOT NULL,
                "validation_status" text NOT NULL,
                "data_quality" text,
                "last_validated_at" timestamp NOT NULL DEFAULT (now() at time zone 'utc')
            );

            CREATE TABLE "sync_conflicts" (
                "id" bigserial PRIMARY KEY,
                "email" text NOT NULL,
                "field" text NOT NULL,
                "local_value" text,
                "mailerlite_value" text,
                "detected_at" timestamp NOT NULL DEFAULT (now() at time zone 'utc'),
                "status" text NOT NULL DEFAULT 'pending',
                "resolved_value" text,
                "resolved_at" timestamp
            );

            CREATE TABLE "sync_log" (
                "id" bigserial PRIMARY KEY,
                "created_at" timestamp NOT NULL DEFAULT (now() at time zone 'utc'),
                "email" text NOT NULL,
                "field" text,
                "action" text NOT NULL,
                "direction" text NOT NULL,
                "result" text NOT NULL,
                "old_value" text,
                "new_value" text,
                "dedupe_key" text NOT NULL,
                "error_type" text,
                "status_code" integer
            );

            CREATE TABLE "sync_state" (
                "key" text PRIMARY KEY,
                "value" jsonb NOT NULL,
                "updated_at" timestamp NOT NULL DEFAULT (now() at time zone 'utc')
            );

            CREATE INDEX "sync_crosswalk_missing_subscriber_id" ON "sync_crosswalk" ("email") WHERE "subscriber_id" IS NULL;
            CREATE INDEX "sync_log_email" ON "sync_log" ("email");
            CREATE INDEX "sync_conflicts_email" ON "sync_conflicts" ("email");

            COMMENT ON TABLE "sync_crosswalk" IS 'Identity map between local clients and mailerlite subscribers, keyed by canonical email';

            COMMENT ON TABLE "sync_shadows" IS 'Last-synced joint snapshot per email, the reference point for the three-way merge';

            COMMENT ON TABLE "sync_log" IS 'Append-only per-field reconciliation event log'
        "#;
        crate::from_sql(manager, sql).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let sql = r#"
            DROP TABLE "sync_state";
            DROP TABLE "sync_log";
            DROP TABLE "sync_conflicts";
            DROP TABLE "sync_shadows";
            DROP TABLE "sync_crosswalk";
            DROP TABLE "clients"
        "#;
        crate::from_sql(manager, sql).await
    }
}
