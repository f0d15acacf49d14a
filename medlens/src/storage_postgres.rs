use async_trait::async_trait;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use tracing::info;

use crate::{
    error::{LensError, Result},
    storage::BlobStore,
};

/// PostgreSQL implementation of BlobStore
pub struct PostgresBlobStore {
    pool: Pool<Postgres>,
}

impl PostgresBlobStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(persistence)?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Connected to PostgreSQL blob store");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS medlens_blobs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(())
    }
}

fn persistence(e: sqlx::Error) -> LensError {
    LensError::PersistenceFailure(e.to_string())
}

#[async_trait]
impl BlobStore for PostgresBlobStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM medlens_blobs WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)
    }

    async fn write(&self, key: &str, value: String) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO medlens_blobs (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM medlens_blobs WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(())
    }
}
