//! Postgres-backed repositories.

use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use super::{MachineRepository, StoreFuture, TemplateRepository};
use crate::error::StoreError;
use crate::model::{Machine, Template};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const MACHINE_COLUMNS: &str = "id, user_id, template_id, name, status, sandbox_ref, address, \
     url, port, credential, expires_at, created_at, updated_at";

/// Machine and template repositories over a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database and apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` when the pool cannot connect and
    /// `StoreError::MigrationFailed` when the schema cannot be brought up to
    /// date.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionFailed {
                message: error.to_string(),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|error| StoreError::MigrationFailed {
                message: error.to_string(),
            })?;
        info!(max_connections, "connected to machine store");

        Ok(Self { pool })
    }

    /// Wrap an existing pool without running migrations.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct MachineRow {
    id: Uuid,
    user_id: Uuid,
    template_id: Uuid,
    name: String,
    status: String,
    sandbox_ref: Option<String>,
    address: Option<String>,
    url: String,
    port: i32,
    credential: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MachineRow> for Machine {
    type Error = StoreError;

    fn try_from(row: MachineRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port).map_err(|_| StoreError::DecodeFailed {
            field: "port",
            message: format!("{} is not a valid port", row.port),
        })?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            template_id: row.template_id,
            name: row.name,
            status: row.status.parse()?,
            sandbox_ref: row.sandbox_ref,
            address: row.address,
            url: row.url,
            port,
            credential: row.credential,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TemplateRow {
    id: Uuid,
    name: String,
    description: String,
    artifact_key: String,
    user_id: Uuid,
}

impl From<TemplateRow> for Template {
    fn from(row: TemplateRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            artifact_key: row.artifact_key,
            user_id: row.user_id,
        }
    }
}

fn query_failed(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |error| StoreError::QueryFailed {
        operation,
        message: error.to_string(),
    }
}

impl MachineRepository for PgStore {
    fn find_machine(&self, id: Uuid) -> StoreFuture<'_, Option<Machine>> {
        Box::pin(async move {
            let row: Option<MachineRow> =
                sqlx::query_as(&format!("SELECT {MACHINE_COLUMNS} FROM machines WHERE id = $1"))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(query_failed("find machine"))?;
            row.map(Machine::try_from).transpose()
        })
    }

    fn insert_machine<'a>(&'a self, machine: &'a Machine) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(&format!(
                "INSERT INTO machines ({MACHINE_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
            ))
            .bind(machine.id)
            .bind(machine.user_id)
            .bind(machine.template_id)
            .bind(&machine.name)
            .bind(machine.status.as_str())
            .bind(machine.sandbox_ref.as_deref())
            .bind(machine.address.as_deref())
            .bind(&machine.url)
            .bind(i32::from(machine.port))
            .bind(&machine.credential)
            .bind(machine.expires_at)
            .bind(machine.created_at)
            .bind(machine.updated_at)
            .execute(&self.pool)
            .await
            .map_err(query_failed("insert machine"))?;
            Ok(())
        })
    }

    fn update_machine<'a>(&'a self, machine: &'a Machine) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE machines SET status = $2, sandbox_ref = $3, address = $4, \
                 updated_at = $5 WHERE id = $1",
            )
            .bind(machine.id)
            .bind(machine.status.as_str())
            .bind(machine.sandbox_ref.as_deref())
            .bind(machine.address.as_deref())
            .bind(machine.updated_at)
            .execute(&self.pool)
            .await
            .map_err(query_failed("update machine"))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn delete_machine(&self, id: Uuid) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM machines WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(query_failed("delete machine"))?;
            Ok(result.rows_affected() > 0)
        })
    }
}

impl TemplateRepository for PgStore {
    fn find_template(&self, id: Uuid) -> StoreFuture<'_, Option<Template>> {
        Box::pin(async move {
            let row: Option<TemplateRow> = sqlx::query_as(
                "SELECT id, name, description, artifact_key, user_id FROM templates WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("find template"))?;
            Ok(row.map(Template::from))
        })
    }
}
