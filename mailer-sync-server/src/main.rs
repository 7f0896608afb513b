use anyhow::Context;
use mailer_sync_server::{init_logs, server::run, Settings};
use migration::{Migrator, MigratorTrait};
use sea_orm::Database;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let settings = Settings::new().context("failed to parse config")?;
    init_logs();

    let db = Database::connect(&settings.database.url)
        .await
        .context("database connection failed")?;
    if settings.database.run_migrations {
        Migrator::up(&db, None)
            .await
            .context("database migration failed")?;
    }

    tracing::info!(addr = ?settings.server.addr, "starting mailer-sync server");
    run(settings, db)?.await?;
    Ok(())
}
