//! Local file loader.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use docchat_core::models::DocumentSource;
use docchat_core::PipelineError;
use tracing::{debug, info};

use crate::extract::{extract_text, DocumentFormat};

/// Extensions accepted by [`load_file`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "pdf", "docx"];

/// Read a document from disk. The path becomes the source id and citation;
/// the file's modification time becomes `lastmod`.
pub fn load_file(path: &Path) -> Result<DocumentSource, PipelineError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(PipelineError::Load(format!(
            "unsupported file type '{}': expected one of {}",
            path.display(),
            SUPPORTED_EXTENSIONS.join(", ")
        )));
    }

    let bytes = std::fs::read(path)
        .map_err(|e| PipelineError::Load(format!("failed to read {}: {e}", path.display())))?;

    let text = match DocumentFormat::from_extension(&extension) {
        Some(format) => extract_text(&bytes, format),
        None => Ok(String::from_utf8_lossy(&bytes).into_owned()),
    }
    .map_err(|e| PipelineError::Load(format!("{}: {e}", path.display())))?;

    if text.trim().is_empty() {
        return Err(PipelineError::Load(format!(
            "{} contains no text",
            path.display()
        )));
    }
    debug!(path = %path.display(), chars = text.chars().count(), "file extracted");

    let id = path.display().to_string();
    let mut source = DocumentSource::new(id, text);
    if let Some(lastmod) = modified(path) {
        source = source.with_lastmod(lastmod);
    }
    info!(source = %source.id, "file loaded");
    Ok(source)
}

fn modified(path: &Path) -> Option<String> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let modified: DateTime<Utc> = modified.into();
    Some(modified.to_rfc3339_opts(SecondsFormat::Secs, true))
}
