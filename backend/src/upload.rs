use actix_multipart::{Field, Multipart};
use futures::{StreamExt, TryStreamExt};
use uuid::Uuid;

use crate::error::ClassifyError;
use crate::pipeline::validator::UploadedImage;

const MAX_TEXT_FIELD_BYTES: usize = 1024;

/// Fields of a classification form.
#[derive(Debug, Default)]
pub struct ClassificationForm {
    pub images: Vec<UploadedImage>,
    pub farm_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub tta: bool,
}

/// Reads a multipart form. Files are taken from `image_field`; each one is
/// buffered only up to `max_bytes + 1`, the rest is counted and dropped so
/// the validator can still report the real size. The form is rejected as soon
/// as more than `max_files` files arrive.
pub async fn read_form(
    mut payload: Multipart,
    image_field: &str,
    max_files: usize,
    max_bytes: usize,
) -> Result<ClassificationForm, ClassifyError> {
    let mut form = ClassificationForm::default();

    while let Some(mut field) = payload.try_next().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            n if n == image_field => {
                if form.images.len() >= max_files {
                    return Err(ClassifyError::bad_field(
                        image_field,
                        format!("at most {} images per request", max_files),
                    ));
                }
                form.images.push(read_file(&mut field, max_bytes).await?);
            }
            "farm_id" => form.farm_id = parse_uuid("farm_id", &read_text(&mut field).await?)?,
            "batch_id" => form.batch_id = parse_uuid("batch_id", &read_text(&mut field).await?)?,
            "tta" => form.tta = parse_flag("tta", &read_text(&mut field).await?)?,
            other => {
                log::debug!("Ignoring unexpected form field '{}'", other);
                while let Some(chunk) = field.next().await {
                    chunk.map_err(multipart_error)?;
                }
            }
        }
    }

    Ok(form)
}

async fn read_file(field: &mut Field, max_bytes: usize) -> Result<UploadedImage, ClassifyError> {
    let file_name = field
        .content_disposition()
        .and_then(|cd| cd.get_filename())
        .map(str::to_string);
    let content_type = field.content_type().map(|m| m.to_string());

    let keep = max_bytes.saturating_add(1);
    let mut bytes = Vec::new();
    let mut size = 0usize;
    while let Some(chunk) = field.next().await {
        let data = chunk.map_err(multipart_error)?;
        size = size.saturating_add(data.len());
        if bytes.len() < keep {
            let room = keep - bytes.len();
            bytes.extend_from_slice(&data[..data.len().min(room)]);
        }
    }

    Ok(UploadedImage {
        file_name,
        content_type,
        bytes,
        size,
    })
}

async fn read_text(field: &mut Field) -> Result<String, ClassifyError> {
    let name = field.name().unwrap_or_default().to_string();
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let data = chunk.map_err(multipart_error)?;
        if bytes.len() + data.len() > MAX_TEXT_FIELD_BYTES {
            return Err(ClassifyError::bad_field(&name, "value too long"));
        }
        bytes.extend_from_slice(&data);
    }
    String::from_utf8(bytes)
        .map(|s| s.trim().to_string())
        .map_err(|_| ClassifyError::bad_field(&name, "value is not valid UTF-8"))
}

fn parse_uuid(field: &str, value: &str) -> Result<Option<Uuid>, ClassifyError> {
    if value.is_empty() {
        return Ok(None);
    }
    Uuid::parse_str(value)
        .map(Some)
        .map_err(|_| ClassifyError::bad_field(field, format!("'{}' is not a valid UUID", value)))
}

pub fn parse_flag(field: &str, value: &str) -> Result<bool, ClassifyError> {
    match value.to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        other => Err(ClassifyError::bad_field(
            field,
            format!("'{}' is not a boolean", other),
        )),
    }
}

fn multipart_error(e: actix_multipart::MultipartError) -> ClassifyError {
    ClassifyError::bad_field("multipart", e.to_string())
}
