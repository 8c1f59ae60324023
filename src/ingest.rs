use crate::blob_store::{BlobStore, BlobStoreError};
use crate::config::IngestConfig;
use crate::metadata_store::{MetadataStore, MetadataStoreError, Palette, Record};
use crate::transcoder::{TranscodeError, Transcoder};
use crate::validator::{UploadFile, ValidationError, Validator};
use chrono::Utc;
use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Errors surfaced by the ingestion pipeline
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error("Blob storage failure: {0}")]
    BlobStore(#[from] BlobStoreError),

    #[error("Metadata storage failure: {0}")]
    Metadata(#[from] MetadataStoreError),

    #[error("Upload processing exceeded the {0:?} deadline")]
    Timeout(Duration),

    #[error("Upload task failed: {0}")]
    Internal(String),
}

/// Coordinates one upload request through
/// Validating -> Transcoding -> Persisting -> Committing.
///
/// The batch is all-or-nothing: any failure after validation drains an
/// explicit rollback list of already-written blobs before the error
/// surfaces, so no record ever references a missing blob and no blob is
/// left orphaned under normal operation.
pub struct Ingestor {
    validator: Validator,
    transcoder: Arc<Transcoder>,
    blob_store: Arc<dyn BlobStore>,
    metadata_store: Arc<dyn MetadataStore>,
    request_timeout: Duration,
}

impl Ingestor {
    pub fn new(
        config: &IngestConfig,
        blob_store: Arc<dyn BlobStore>,
        metadata_store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            validator: Validator::new(config),
            transcoder: Arc::new(Transcoder::new(config)),
            blob_store,
            metadata_store,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Ingest one upload batch, returning the new record id.
    ///
    /// The pipeline runs in a spawned task: a client that disconnects
    /// mid-upload cancels only the waiting handler, while the task still
    /// finishes or rolls back every blob it wrote.
    pub async fn ingest(
        self: &Arc<Self>,
        files: Vec<UploadFile>,
        palette: Palette,
    ) -> Result<Uuid, IngestError> {
        let ingestor = Arc::clone(self);
        tokio::spawn(async move { ingestor.run(files, palette).await })
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?
    }

    #[instrument(skip(self, files, palette), fields(file_count = files.len()))]
    async fn run(&self, files: Vec<UploadFile>, palette: Palette) -> Result<Uuid, IngestError> {
        let started = Instant::now();
        let palette = palette.trimmed();

        // Validating: pure checks, nothing to roll back on failure
        self.validator.validate_batch(&files, &palette)?;

        // Blob names written so far. Shared with the staged future so a
        // timeout that drops it mid-write cannot lose track of them.
        let written: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let staged = self.transcode_and_commit(files, palette, Arc::clone(&written));
        let result = match tokio::time::timeout(self.request_timeout, staged).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::Timeout(self.request_timeout)),
        };

        match result {
            Ok(id) => {
                metrics::counter!("ingest.records.created").increment(1);
                metrics::histogram!("ingest.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                info!(id = %id, "Upload committed");
                Ok(id)
            }
            Err(e) => {
                self.rollback(&written).await;
                metrics::counter!("ingest.requests.failed").increment(1);
                Err(e)
            }
        }
    }

    /// Transcoding -> Persisting -> Committing
    async fn transcode_and_commit(
        &self,
        files: Vec<UploadFile>,
        palette: Palette,
        written: Arc<Mutex<Vec<String>>>,
    ) -> Result<Uuid, IngestError> {
        // Transcoding: all files concurrently on the blocking pool, so
        // batch latency tracks the slowest file rather than the sum.
        // The first broken image fails the whole batch.
        let tasks = files.into_iter().map(|file| {
            let transcoder = Arc::clone(&self.transcoder);
            async move {
                tokio::task::spawn_blocking(move || transcoder.transcode(&file.bytes))
                    .await
                    .map_err(|e| IngestError::Internal(e.to_string()))?
                    .map_err(IngestError::from)
            }
        });
        let transcoded = try_join_all(tasks).await?;

        // Persisting: write in submission order, recording every name
        // before moving on so rollback always sees it.
        for image in &transcoded {
            let name = self.blob_store.put(&image.bytes).await?;
            metrics::counter!("ingest.blob_bytes.written").increment(image.bytes.len() as u64);
            written.lock().unwrap().push(name);
        }

        // Committing: one atomic metadata insert. All blobs are durable
        // by this point, so the record never references a missing blob.
        let record = Record {
            id: Uuid::new_v4(),
            blob_names: written.lock().unwrap().clone(),
            palette,
            created_at: Utc::now(),
        };
        self.metadata_store.insert(&record).await?;

        Ok(record.id)
    }

    /// Best-effort deletion of every blob this request wrote
    async fn rollback(&self, written: &Mutex<Vec<String>>) {
        let names: Vec<String> = written.lock().unwrap().drain(..).collect();
        if names.is_empty() {
            return;
        }

        warn!(count = names.len(), "Rolling back partially written blobs");

        for name in names {
            match self.blob_store.delete(&name).await {
                Ok(()) => {
                    metrics::counter!("ingest.rollback.blobs_deleted").increment(1);
                }
                Err(e) => {
                    error!(name = %name, error = %e, "Rollback delete failed, blob orphaned");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;
    use crate::metadata_store::MemoryMetadataStore;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png_file(width: u32, height: u32) -> UploadFile {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 100, 50]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        UploadFile {
            filename: format!("{width}x{height}.png"),
            content_type: "image/png".to_string(),
            bytes,
        }
    }

    fn garbage_file() -> UploadFile {
        UploadFile {
            filename: "fake.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            bytes: b"not an image at all".to_vec(),
        }
    }

    fn test_palette() -> Palette {
        Palette {
            primary: "#ff0000".to_string(),
            accent: "#00ff00".to_string(),
            light: "#0000ff".to_string(),
        }
    }

    fn test_ingestor(
        blob_store: Arc<dyn BlobStore>,
        metadata_store: Arc<dyn MetadataStore>,
    ) -> Arc<Ingestor> {
        Arc::new(Ingestor::new(
            &IngestConfig::default(),
            blob_store,
            metadata_store,
        ))
    }

    /// Blob store that fails on the nth put, for rollback tests
    struct FailingBlobStore {
        inner: MemoryBlobStore,
        fail_on_put: usize,
        puts: AtomicUsize,
    }

    impl FailingBlobStore {
        fn new(fail_on_put: usize) -> Self {
            Self {
                inner: MemoryBlobStore::new(),
                fail_on_put,
                puts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BlobStore for FailingBlobStore {
        async fn put(&self, bytes: &[u8]) -> Result<String, BlobStoreError> {
            let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on_put {
                return Err(BlobStoreError::Io(std::io::Error::other("injected failure")));
            }
            self.inner.put(bytes).await
        }

        async fn get(&self, name: &str) -> Result<Vec<u8>, BlobStoreError> {
            self.inner.get(name).await
        }

        async fn delete(&self, name: &str) -> Result<(), BlobStoreError> {
            self.inner.delete(name).await
        }
    }

    /// Metadata store whose insert always reports an id conflict
    struct ConflictingMetadataStore;

    #[async_trait]
    impl MetadataStore for ConflictingMetadataStore {
        async fn insert(&self, record: &Record) -> Result<(), MetadataStoreError> {
            Err(MetadataStoreError::Conflict(record.id))
        }

        async fn get(&self, id: Uuid) -> Result<Record, MetadataStoreError> {
            Err(MetadataStoreError::NotFound(id))
        }

        async fn ping(&self) -> Result<(), MetadataStoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_successful_ingest_commits_record() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let records = Arc::new(MemoryMetadataStore::new());
        let ingestor = test_ingestor(blobs.clone(), records.clone());

        let files = vec![png_file(100, 80), png_file(60, 60), png_file(30, 40)];
        let id = ingestor.ingest(files, test_palette()).await.unwrap();

        let record = records.get(id).await.unwrap();
        assert_eq!(record.blob_names.len(), 3);
        assert_eq!(record.palette, test_palette());
        assert_eq!(blobs.len(), 3);

        // Every referenced blob exists and is a JPEG
        for name in &record.blob_names {
            let bytes = blobs.get(name).await.unwrap();
            assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
        }
    }

    #[tokio::test]
    async fn test_blob_order_matches_submission_order() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let records = Arc::new(MemoryMetadataStore::new());
        let ingestor = test_ingestor(blobs.clone(), records.clone());

        let files = vec![png_file(100, 10), png_file(200, 20), png_file(300, 30)];
        let id = ingestor.ingest(files, test_palette()).await.unwrap();

        let record = records.get(id).await.unwrap();
        let widths: Vec<u32> = {
            let mut widths = Vec::new();
            for name in &record.blob_names {
                let bytes = blobs.get(name).await.unwrap();
                widths.push(image::load_from_memory(&bytes).unwrap().width());
            }
            widths
        };
        assert_eq!(widths, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn test_validation_failure_touches_nothing() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let records = Arc::new(MemoryMetadataStore::new());
        let ingestor = test_ingestor(blobs.clone(), records.clone());

        let result = ingestor.ingest(vec![], test_palette()).await;

        assert!(matches!(result, Err(IngestError::Validation(_))));
        assert!(blobs.is_empty());
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_one_bad_file_fails_whole_batch() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let records = Arc::new(MemoryMetadataStore::new());
        let ingestor = test_ingestor(blobs.clone(), records.clone());

        let files = vec![png_file(100, 80), garbage_file(), png_file(60, 60)];
        let result = ingestor.ingest(files, test_palette()).await;

        assert!(matches!(result, Err(IngestError::Transcode(_))));
        assert!(blobs.is_empty());
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_rolls_back_written_blobs() {
        let blobs = Arc::new(FailingBlobStore::new(3));
        let records = Arc::new(MemoryMetadataStore::new());
        let ingestor = test_ingestor(blobs.clone(), records.clone());

        let files = vec![png_file(40, 40), png_file(50, 50), png_file(60, 60)];
        let result = ingestor.ingest(files, test_palette()).await;

        assert!(matches!(result, Err(IngestError::BlobStore(_))));
        // The two blobs written before the failure were deleted again
        assert!(blobs.inner.is_empty());
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_all_blobs() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let ingestor = test_ingestor(blobs.clone(), Arc::new(ConflictingMetadataStore));

        let files = vec![png_file(40, 40), png_file(50, 50)];
        let result = ingestor.ingest(files, test_palette()).await;

        assert!(matches!(
            result,
            Err(IngestError::Metadata(MetadataStoreError::Conflict(_)))
        ));
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_expiry_aborts_and_rolls_back() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let records = Arc::new(MemoryMetadataStore::new());
        let config = IngestConfig {
            request_timeout_secs: 0,
            ..IngestConfig::default()
        };
        let ingestor = Arc::new(Ingestor::new(&config, blobs.clone(), records.clone()));

        let result = ingestor.ingest(vec![png_file(100, 80)], test_palette()).await;

        assert!(matches!(result, Err(IngestError::Timeout(_))));
        assert!(blobs.is_empty());
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_palette_is_trimmed_before_commit() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let records = Arc::new(MemoryMetadataStore::new());
        let ingestor = test_ingestor(blobs.clone(), records.clone());

        let palette = Palette {
            primary: " #ff0000 ".to_string(),
            accent: "#00ff00".to_string(),
            light: "#0000ff".to_string(),
        };
        let id = ingestor.ingest(vec![png_file(20, 20)], palette).await.unwrap();

        let record = records.get(id).await.unwrap();
        assert_eq!(record.palette.primary, "#ff0000");
    }
}
