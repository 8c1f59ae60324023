use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Three-color palette derived from an uploaded photo set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Palette {
    pub primary: String,
    pub accent: String,
    pub light: String,
}

impl Palette {
    /// Trim surrounding whitespace from every field
    pub fn trimmed(self) -> Self {
        Self {
            primary: self.primary.trim().to_string(),
            accent: self.accent.trim().to_string(),
            light: self.light.trim().to_string(),
        }
    }
}

/// One shared photo tree: ordered blob references plus the palette
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Public record identifier (canonical hyphenated UUID)
    pub id: Uuid,
    /// Blob names in upload order, which is display order
    pub blob_names: Vec<String>,
    /// Palette submitted alongside the photos
    pub palette: Palette,
    /// When the record was committed
    pub created_at: DateTime<Utc>,
}

/// Errors from the metadata backend
#[derive(Debug, Error)]
pub enum MetadataStoreError {
    #[error("Record '{0}' not found")]
    NotFound(Uuid),

    /// Only possible on an id collision, which is treated as an
    /// internal fault rather than retried.
    #[error("Record id '{0}' already exists")]
    Conflict(Uuid),

    #[error("Metadata backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Durable mapping from record id to blob names and palette.
///
/// A successful `insert` must be immediately visible to a subsequent
/// `get` on any reader, and a reader never observes a partially
/// populated record.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a record atomically. Fails with `Conflict` on id collision.
    async fn insert(&self, record: &Record) -> Result<(), MetadataStoreError>;

    /// Point lookup by record id.
    async fn get(&self, id: Uuid) -> Result<Record, MetadataStoreError>;

    /// Backend connectivity probe for readiness checks.
    async fn ping(&self) -> Result<(), MetadataStoreError>;
}

/// PostgreSQL-backed metadata store
pub struct PgMetadataStore {
    pool: PgPool,
}

/// Row shape of the `records` table
#[derive(Debug, FromRow)]
struct RecordRow {
    id: Uuid,
    blob_names: Vec<String>,
    primary_color: String,
    accent_color: String,
    light_color: String,
    created_at: DateTime<Utc>,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Self {
            id: row.id,
            blob_names: row.blob_names,
            palette: Palette {
                primary: row.primary_color,
                accent: row.accent_color,
                light: row.light_color,
            },
            created_at: row.created_at,
        }
    }
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, MetadataStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL metadata store");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), MetadataStoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, record), fields(id = %record.id, blob_count = record.blob_names.len()))]
    async fn insert(&self, record: &Record) -> Result<(), MetadataStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO records (
                id, blob_names, primary_color, accent_color, light_color, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6
            )
            "#,
        )
        .bind(record.id)
        .bind(&record.blob_names)
        .bind(&record.palette.primary)
        .bind(&record.palette.accent)
        .bind(&record.palette.light)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(id = %record.id, "Record inserted");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(MetadataStoreError::Conflict(record.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Record, MetadataStoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, blob_names, primary_color, accent_color, light_color, created_at
            FROM records
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Record::from)
            .ok_or(MetadataStoreError::NotFound(id))
    }

    async fn ping(&self) -> Result<(), MetadataStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-memory metadata store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: RwLock<HashMap<Uuid, Record>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert(&self, record: &Record) -> Result<(), MetadataStoreError> {
        let mut records = self.records.write().unwrap();
        if records.contains_key(&record.id) {
            return Err(MetadataStoreError::Conflict(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Record, MetadataStoreError> {
        self.records
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(MetadataStoreError::NotFound(id))
    }

    async fn ping(&self) -> Result<(), MetadataStoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record() -> Record {
        Record {
            id: Uuid::new_v4(),
            blob_names: vec![
                "1700000000000-aaaa.jpg".to_string(),
                "1700000000001-bbbb.jpg".to_string(),
            ],
            palette: Palette {
                primary: "#ff0000".to_string(),
                accent: "#00ff00".to_string(),
                light: "#0000ff".to_string(),
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_insert_and_get() {
        let store = MemoryMetadataStore::new();
        let record = test_record();

        store.insert(&record).await.unwrap();

        let fetched = store.get(record.id).await.unwrap();
        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.blob_names, record.blob_names);
        assert_eq!(fetched.palette, record.palette);
    }

    #[tokio::test]
    async fn test_memory_insert_conflict() {
        let store = MemoryMetadataStore::new();
        let record = test_record();

        store.insert(&record).await.unwrap();
        let result = store.insert(&record).await;

        assert!(matches!(result, Err(MetadataStoreError::Conflict(id)) if id == record.id));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_get_not_found() {
        let store = MemoryMetadataStore::new();
        let missing = Uuid::new_v4();

        let result = store.get(missing).await;
        assert!(matches!(result, Err(MetadataStoreError::NotFound(id)) if id == missing));
    }

    #[test]
    fn test_palette_trimmed() {
        let palette = Palette {
            primary: " #ff0000 ".to_string(),
            accent: "#00ff00".to_string(),
            light: "\t#0000ff\n".to_string(),
        };

        let trimmed = palette.trimmed();
        assert_eq!(trimmed.primary, "#ff0000");
        assert_eq!(trimmed.accent, "#00ff00");
        assert_eq!(trimmed.light, "#0000ff");
    }
}
