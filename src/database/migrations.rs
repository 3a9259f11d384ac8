//! # Schema Migrations
//!
//! Migrations are compiled into the binary and applied in version order.
//! Every file is named `YYYYMMDDHHMMSS_description.sql`; applied versions
//! are recorded in `dlstbx_schema_migrations`.
//!
//! Several services may start against the same database at once, so the
//! whole run happens on one connection holding a PostgreSQL advisory lock:
//!
//! ```sql
//! SELECT pg_advisory_lock(7305480133729386241)
//! ```

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashSet;
use tracing::{debug, info};

use super::{StoreError, StoreResult};

const LOCK_KEY: i64 = 7_305_480_133_729_386_241;

/// Migration files embedded at build time, as (file stem, SQL)
const EMBEDDED: &[(&str, &str)] = &[
    (
        "20240601000000_core_schema",
        include_str!("../../migrations/20240601000000_core_schema.sql"),
    ),
    (
        "20240715000000_processing_job_request_key",
        include_str!("../../migrations/20240715000000_processing_job_request_key.sql"),
    ),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    /// Version timestamp (YYYYMMDDHHMMSS)
    pub version: String,
    pub name: String,
    pub sql: &'static str,
}

#[derive(Debug)]
pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Apply every outstanding migration
    pub async fn run_all(pool: &PgPool) -> StoreResult<()> {
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| StoreError::database("migrations", e))?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(LOCK_KEY)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::database("migration lock", e))?;

        let result = Self::run_outstanding(&mut conn).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(LOCK_KEY)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::database("migration unlock", e))?;

        result
    }

    /// The embedded migrations in the order they are applied
    pub fn embedded() -> StoreResult<Vec<Migration>> {
        let mut migrations = EMBEDDED
            .iter()
            .map(|(stem, sql)| {
                let (version, name) =
                    Self::parse_migration_filename(stem).ok_or_else(|| StoreError::Migration {
                        version: (*stem).to_string(),
                        message: "file name must start with a 14 digit version".to_string(),
                    })?;
                Ok(Migration { version, name, sql })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(migrations)
    }

    async fn run_outstanding(conn: &mut PoolConnection<Postgres>) -> StoreResult<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS dlstbx_schema_migrations (
                version VARCHAR(14) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut **conn)
        .await
        .map_err(|e| StoreError::database("migration table", e))?;

        let applied: HashSet<String> = sqlx::query("SELECT version FROM dlstbx_schema_migrations")
            .fetch_all(&mut **conn)
            .await
            .map_err(|e| StoreError::database("applied migrations", e))?
            .into_iter()
            .map(|row| row.get::<String, _>("version"))
            .collect();

        for migration in Self::embedded()? {
            if applied.contains(&migration.version) {
                debug!(version = %migration.version, "Migration already applied");
                continue;
            }
            info!(version = %migration.version, name = %migration.name, "Applying migration");
            sqlx::raw_sql(migration.sql)
                .execute(&mut **conn)
                .await
                .map_err(|e| StoreError::Migration {
                    version: migration.version.clone(),
                    message: e.to_string(),
                })?;
            sqlx::query("INSERT INTO dlstbx_schema_migrations (version) VALUES ($1)")
                .bind(&migration.version)
                .execute(&mut **conn)
                .await
                .map_err(|e| StoreError::database("record migration", e))?;
        }
        Ok(())
    }

    /// Split `YYYYMMDDHHMMSS_description` into version and readable name
    fn parse_migration_filename(filename: &str) -> Option<(String, String)> {
        if filename.len() < 15 || !filename.is_char_boundary(14) {
            return None;
        }
        let (version, name) = filename.split_at(14);
        if !version.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let name = name.strip_prefix('_').unwrap_or(name).replace('_', " ");
        Some((version.to_string(), name))
    }
}
