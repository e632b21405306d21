use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, Row, SqlitePool};
use tracing::info;

use crate::audit::AuditStore;
use crate::config::DatabaseConfig;
use crate::engine::Instance;
use crate::saga::SagaExecution;

/// SQLite audit mirror. Snapshots are stored as JSON, one row per entity.
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Open (creating if needed) the database and run migrations if enabled
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if !sqlx::Sqlite::database_exists(&config.url).await? {
            info!("Creating database at {}", config.url);
            sqlx::Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.url)
            .await
            .with_context(|| format!("Failed to connect to {}", config.url))?;

        if config.auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn save_instance(&self, instance: &Instance) -> Result<()> {
        let snapshot = serde_json::to_string(instance)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO instances (id, definition, current_state, version, snapshot, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&instance.id)
        .bind(instance.definition_ref.to_string())
        .bind(&instance.current_state)
        .bind(instance.version as i64)
        .bind(snapshot)
        .bind(instance.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_execution(&self, execution: &SagaExecution) -> Result<()> {
        let snapshot = serde_json::to_string(execution)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO saga_executions (execution_id, workflow_ref, status, snapshot, updated_at)
            VALUES (?1, ?2, ?3, ?4, datetime('now'))
            "#,
        )
        .bind(&execution.execution_id)
        .bind(&execution.workflow_ref)
        .bind(execution.status.to_string())
        .bind(snapshot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_instance(&self, id: &str) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT snapshot FROM instances WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let snapshot: String = row.get("snapshot");
                Ok(Some(serde_json::from_str(&snapshot)?))
            }
            None => Ok(None),
        }
    }

    async fn load_execution(&self, execution_id: &str) -> Result<Option<SagaExecution>> {
        let row = sqlx::query("SELECT snapshot FROM saga_executions WHERE execution_id = ?1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let snapshot: String = row.get("snapshot");
                Ok(Some(serde_json::from_str(&snapshot)?))
            }
            None => Ok(None),
        }
    }
}
