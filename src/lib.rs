//! Treehouse Upload Service
//!
//! Upload ingestion and blob/metadata storage service for the Treehouse
//! photo-tree sharing platform. Clients upload a small batch of photos
//! plus a derived three-color palette and receive a shareable identifier
//! that later resolves to the stored photos and palette.
//!
//! ## Features
//!
//! - **Strict Admission**: per-source rate limiting and pre-flight
//!   validation of MIME type, file size, batch size, and palette fields
//! - **Normalized Storage**: every accepted image is decoded, bounded to
//!   a maximum dimension, and re-encoded as JPEG before persisting
//! - **All-or-Nothing Ingestion**: blobs and the metadata record commit
//!   together; any failure rolls back every blob the request wrote
//! - **Safe Retrieval**: record ids and blob names are shape-checked
//!   before storage access, with path-traversal defenses on the blob
//!   route and immutable cache headers on served bytes
//!
//! ## Architecture
//!
//! ```text
//! HTTP Client                 Blob Root                 PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ POST         │           │ {millis}-    │          │ records      │
//! │ /api/upload  │──────────▶│  {random}.jpg│          │              │
//! └──────────────┘           └──────────────┘          └──────────────┘
//!        │                          ▲                         ▲
//!        ▼                          │                         │
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Admission    │           │ Blob         │          │ Metadata     │
//! │ Guard        │           │ Store        │          │ Store        │
//! └──────────────┘           └──────────────┘          └──────────────┘
//!        │                          ▲                         ▲
//!        ▼                          │                         │
//! ┌──────────────┐           ┌──────────────┐                 │
//! │ Validator    │──────────▶│ Ingestion    │─────────────────┘
//! │ + Transcoder │           │ Coordinator  │
//! └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod config;
pub mod ingest;
pub mod metadata_store;
pub mod rate_limit;
pub mod transcoder;
pub mod validator;

pub use api::{create_router, AppState, TreeResponse, UploadResponse};
pub use blob_store::{
    generate_blob_name, is_valid_blob_name, BlobStore, BlobStoreError, FsBlobStore,
    MemoryBlobStore,
};
pub use config::Config;
pub use ingest::{IngestError, Ingestor};
pub use metadata_store::{
    MemoryMetadataStore, MetadataStore, MetadataStoreError, Palette, PgMetadataStore, Record,
};
pub use rate_limit::{Admission, AdmissionGuard};
pub use transcoder::{TranscodeError, TranscodedImage, Transcoder};
pub use validator::{UploadFile, ValidationError, Validator};
