use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create services table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS services (
            id UUID PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            image VARCHAR(50) NOT NULL,
            model TEXT NOT NULL,
            profile VARCHAR(255) NOT NULL,
            status VARCHAR(20) NOT NULL,
            username VARCHAR(255),
            host VARCHAR(255) NOT NULL,
            port INTEGER,
            job_type VARCHAR(20) NOT NULL,
            job_id VARCHAR(255),
            grace_period BIGINT NOT NULL DEFAULT 180,
            mounts TEXT[] NOT NULL DEFAULT '{}',
            provider VARCHAR(20),
            home_dir TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for the list filters and the monitor's active scan
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_services_status ON services(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_services_profile ON services(profile)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_services_created_at ON services(created_at DESC)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
