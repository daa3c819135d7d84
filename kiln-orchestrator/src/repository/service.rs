//! Service Repository
//!
//! Handles all database operations related to services.

use async_trait::async_trait;
use kiln_core::domain::profile::Provider;
use kiln_core::domain::service::{ImageKind, JobType, Service, ServiceStatus};
use kiln_core::dto::service::ServiceFilter;
use sqlx::PgPool;
use uuid::Uuid;

use super::{ServiceStore, StoreError};

const SELECT_COLUMNS: &str = r#"
    SELECT id, name, image, model, profile, status, username, host, port,
           job_type, job_id, grace_period, mounts, provider, home_dir,
           created_at, updated_at
    FROM services
"#;

/// Insert a new service record
pub async fn create(pool: &PgPool, service: &Service) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO services (id, name, image, model, profile, status, username, host, port,
                              job_type, job_id, grace_period, mounts, provider, home_dir,
                              created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
    )
    .bind(service.id)
    .bind(&service.name)
    .bind(service.image.as_str())
    .bind(&service.model)
    .bind(&service.profile)
    .bind(service.status.as_str())
    .bind(&service.user)
    .bind(&service.host)
    .bind(service.port.map(i32::from))
    .bind(service.job_type.as_str())
    .bind(&service.job_id)
    .bind(service.grace_period as i64)
    .bind(&service.mounts)
    .bind(service.provider.map(provider_to_string))
    .bind(&service.home_dir)
    .bind(service.created_at)
    .bind(service.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Find a service by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Service>, sqlx::Error> {
    let row = sqlx::query_as::<_, ServiceRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.into()))
}

/// List services matching a filter, newest first
pub async fn find_by_filter(
    pool: &PgPool,
    filter: &ServiceFilter,
) -> Result<Vec<Service>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ServiceRow>(&format!(
        r#"{}
        WHERE ($1::VARCHAR IS NULL OR image = $1)
          AND ($2::TEXT IS NULL OR model = $2)
          AND ($3::VARCHAR IS NULL OR status = $3)
          AND ($4::VARCHAR IS NULL OR name = $4)
          AND ($5::VARCHAR IS NULL OR profile = $5)
        ORDER BY created_at DESC
        "#,
        SELECT_COLUMNS
    ))
    .bind(filter.image.map(|i| i.as_str()))
    .bind(&filter.model)
    .bind(filter.status.map(|s| s.as_str()))
    .bind(&filter.name)
    .bind(&filter.profile)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// List services that have not reached a terminal status
pub async fn find_active(pool: &PgPool) -> Result<Vec<Service>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ServiceRow>(&format!(
        r#"{}
        WHERE status NOT IN ('STOPPED', 'TIMEOUT', 'FAILED')
        ORDER BY created_at ASC
        "#,
        SELECT_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Write back the mutable fields of a service
pub async fn update(pool: &PgPool, service: &Service) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE services
        SET status = $1, port = $2, job_id = $3, updated_at = $4
        WHERE id = $5
        "#,
    )
    .bind(service.status.as_str())
    .bind(service.port.map(i32::from))
    .bind(&service.job_id)
    .bind(service.updated_at)
    .bind(service.id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete a service if it is in a terminal status
///
/// Returns false when no terminal row with this id exists.
pub async fn delete_terminal(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM services WHERE id = $1 AND status IN ('STOPPED', 'TIMEOUT', 'FAILED')",
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// PostgreSQL-backed `ServiceStore`
#[derive(Clone)]
pub struct PgServiceStore {
    pool: PgPool,
}

impl PgServiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServiceStore for PgServiceStore {
    async fn add(&self, service: &Service) -> Result<(), StoreError> {
        Ok(create(&self.pool, service).await?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Service>, StoreError> {
        Ok(find_by_id(&self.pool, id).await?)
    }

    async fn update(&self, service: &Service) -> Result<(), StoreError> {
        if update(&self.pool, service).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(service.id))
        }
    }

    async fn list(&self, filter: &ServiceFilter) -> Result<Vec<Service>, StoreError> {
        Ok(find_by_filter(&self.pool, filter).await?)
    }

    async fn list_active(&self) -> Result<Vec<Service>, StoreError> {
        Ok(find_active(&self.pool).await?)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        if delete_terminal(&self.pool, id).await? {
            return Ok(());
        }

        match find_by_id(&self.pool, id).await? {
            Some(service) => Err(StoreError::NotTerminal(id, service.status)),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn provider_to_string(provider: Provider) -> String {
    provider.to_string()
}

fn string_to_provider(s: &str) -> Option<Provider> {
    match s {
        "docker" => Some(Provider::Docker),
        "apptainer" => Some(Provider::Apptainer),
        _ => None,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: Uuid,
    name: String,
    image: String,
    model: String,
    profile: String,
    status: String,
    username: Option<String>,
    host: String,
    port: Option<i32>,
    job_type: String,
    job_id: Option<String>,
    grace_period: i64,
    mounts: Vec<String>,
    provider: Option<String>,
    home_dir: String,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<ServiceRow> for Service {
    fn from(row: ServiceRow) -> Self {
        let status = row.status.parse().unwrap_or_else(|e| {
            tracing::warn!("Service {} has {}, treating as FAILED", row.id, e);
            ServiceStatus::Failed
        });

        Service {
            id: row.id,
            name: row.name,
            image: row.image.parse().unwrap_or(ImageKind::TextGeneration),
            model: row.model,
            profile: row.profile,
            status,
            user: row.username,
            host: row.host,
            port: row.port.and_then(|p| u16::try_from(p).ok()),
            job_type: row.job_type.parse().unwrap_or(JobType::Local),
            job_id: row.job_id,
            grace_period: u64::try_from(row.grace_period).unwrap_or_default(),
            mounts: row.mounts,
            provider: row.provider.as_deref().and_then(string_to_provider),
            home_dir: row.home_dir,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
