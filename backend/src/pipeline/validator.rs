use image::{DynamicImage, ImageFormat, ImageReader, Limits};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::config::UploadConfig;

/// An upload as received, before any checks.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    /// May be truncated once the upload passed the size limit.
    pub bytes: Vec<u8>,
    /// Number of bytes the client actually sent.
    pub size: usize,
}

impl UploadedImage {
    pub fn new(file_name: Option<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        Self {
            file_name,
            content_type,
            bytes,
            size,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Uploaded file is empty")]
    Empty,
    #[error("File size {size} bytes exceeds the maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("Unsupported file type: {0}")]
    BadType(String),
    #[error("File is corrupt or not a decodable image: {0}")]
    Corrupt(String),
}

impl ValidationError {
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::Empty => "empty",
            ValidationError::TooLarge { .. } => "too_large",
            ValidationError::BadType(_) => "bad_type",
            ValidationError::Corrupt(_) => "corrupt",
        }
    }
}

/// An upload that passed every check, decoded exactly once.
#[derive(Debug, Clone)]
pub struct ValidatedImage {
    pub image: Arc<DynamicImage>,
    pub format: ImageFormat,
    pub bytes: Vec<u8>,
    pub file_name: Option<String>,
}

impl ValidatedImage {
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("bin")
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

#[derive(Debug, Clone)]
pub struct ImageValidator {
    max_bytes: usize,
    allowed_extensions: Vec<String>,
    allowed_mime_types: Vec<String>,
    max_dimension: u32,
}

impl ImageValidator {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            max_bytes: config.max_upload_bytes,
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            allowed_mime_types: config
                .allowed_mime_types
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
            max_dimension: config.max_image_dimension,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn validate(&self, upload: UploadedImage) -> Result<ValidatedImage, ValidationError> {
        if upload.size == 0 {
            return Err(ValidationError::Empty);
        }
        if upload.size > self.max_bytes || upload.bytes.len() > self.max_bytes {
            return Err(ValidationError::TooLarge {
                size: upload.size.max(upload.bytes.len()),
                max: self.max_bytes,
            });
        }

        if let Some(ext) = upload.file_name.as_deref().and_then(extension_of) {
            if !self.allowed_extensions.contains(&ext) {
                return Err(ValidationError::BadType(format!("extension .{}", ext)));
            }
        }
        if let Some(mime) = declared_mime(upload.content_type.as_deref()) {
            if !self.allowed_mime_types.contains(&mime) {
                return Err(ValidationError::BadType(format!("content type {}", mime)));
            }
        }

        let format = image::guess_format(&upload.bytes)
            .map_err(|_| ValidationError::Corrupt("unrecognized image data".to_string()))?;
        if !self
            .allowed_mime_types
            .iter()
            .any(|m| m == format.to_mime_type())
        {
            return Err(ValidationError::BadType(format!(
                "detected {}",
                format.to_mime_type()
            )));
        }

        let image = self.decode(&upload.bytes, format)?;
        Ok(ValidatedImage {
            image: Arc::new(image),
            format,
            bytes: upload.bytes,
            file_name: upload.file_name,
        })
    }

    fn decode(&self, bytes: &[u8], format: ImageFormat) -> Result<DynamicImage, ValidationError> {
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);

        let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
        reader.limits(limits);
        reader
            .decode()
            .map_err(|e| ValidationError::Corrupt(e.to_string()))
    }
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
}

/// Generic binary content types say nothing about the payload.
fn declared_mime(content_type: Option<&str>) -> Option<String> {
    let mime = content_type?
        .split(';')
        .next()?
        .trim()
        .to_ascii_lowercase();
    if mime.is_empty() || mime == "application/octet-stream" {
        None
    } else {
        Some(mime)
    }
}

#[cfg(test)]
pub(crate) mod test_images {
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    pub fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 20) as u8, (y * 20) as u8, 128])
        }));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), format)
            .expect("encode test image");
        bytes
    }

    pub fn jpeg_10x10() -> Vec<u8> {
        encoded(10, 10, ImageFormat::Jpeg)
    }
}
