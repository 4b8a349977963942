//! Schema migrations
//!
//! Migrations live in `concierge-storage/migrations/` and are embedded at
//! compile time.

use crate::Result;
use sqlx::PgConnection;
use tracing::info;

/// Run all pending migrations
pub async fn run_migrations(conn: &mut PgConnection) -> Result<()> {
    let migrator = sqlx::migrate!("./migrations");
    migrator
        .run(conn)
        .await
        .map_err(|e| crate::Error::Migration(e.to_string()))?;

    info!(
        migrations = migrator.iter().count(),
        "Database migrations applied"
    );
    Ok(())
}
