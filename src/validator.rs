use crate::config::IngestConfig;
use crate::metadata_store::Palette;
use thiserror::Error;

/// MIME types accepted for upload
pub const ALLOWED_MIME_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];

/// One inbound file as parsed from the multipart body
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Client-supplied filename (informational only, never used as a path)
    pub filename: String,
    /// Declared MIME type
    pub content_type: String,
    /// Raw file bytes
    pub bytes: Vec<u8>,
}

/// Rejection reasons for an upload batch
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Unsupported media type '{0}', expected one of: image/jpeg, image/png, image/gif, image/webp")]
    UnsupportedMediaType(String),

    #[error("File '{name}' is {size} bytes, exceeding the {limit} byte limit")]
    FileTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("Batch of {0} files exceeds the maximum of {1}")]
    TooManyFiles(usize, usize),

    #[error("At least one image file is required")]
    EmptyBatch,

    #[error("Palette field '{0}' is missing or empty")]
    MissingPaletteField(&'static str),
}

/// Pre-flight checks for an upload batch.
///
/// Runs before any transcoding or storage work; a failure here means no
/// resources were touched.
#[derive(Debug, Clone)]
pub struct Validator {
    max_files: usize,
    max_file_bytes: usize,
}

impl Validator {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            max_files: config.max_files,
            max_file_bytes: config.max_file_bytes,
        }
    }

    /// Validate the whole batch and palette
    pub fn validate_batch(
        &self,
        files: &[UploadFile],
        palette: &Palette,
    ) -> Result<(), ValidationError> {
        if files.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if files.len() > self.max_files {
            return Err(ValidationError::TooManyFiles(files.len(), self.max_files));
        }

        for file in files {
            self.validate_file(file)?;
        }

        Self::validate_palette(palette)
    }

    fn validate_file(&self, file: &UploadFile) -> Result<(), ValidationError> {
        if !ALLOWED_MIME_TYPES.contains(&file.content_type.as_str()) {
            return Err(ValidationError::UnsupportedMediaType(
                file.content_type.clone(),
            ));
        }
        if file.bytes.len() > self.max_file_bytes {
            return Err(ValidationError::FileTooLarge {
                name: file.filename.clone(),
                size: file.bytes.len(),
                limit: self.max_file_bytes,
            });
        }
        Ok(())
    }

    fn validate_palette(palette: &Palette) -> Result<(), ValidationError> {
        if palette.primary.trim().is_empty() {
            return Err(ValidationError::MissingPaletteField("primary"));
        }
        if palette.accent.trim().is_empty() {
            return Err(ValidationError::MissingPaletteField("accent"));
        }
        if palette.light.trim().is_empty() {
            return Err(ValidationError::MissingPaletteField("light"));
        }
        Ok(())
    }
}
