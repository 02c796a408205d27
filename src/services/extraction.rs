use std::borrow::Cow;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::config::Settings;
use crate::services::storage::{DocumentStore, StorageError};

const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("local document {0} is outside the storage root")]
    OutsideRoot(String),
    #[error("failed to fetch document {locator}: {reason}")]
    Fetch { locator: String, reason: String },
    #[error("failed to read local document {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to stage document: {0}")]
    Staging(#[source] std::io::Error),
}

/// Converts stored documents into plain text.
///
/// Remote documents are staged into a uniquely named temporary file that is
/// removed before `extract` returns, whatever the outcome. Local paths are only
/// read when they resolve inside the configured local root.
#[derive(Clone)]
pub struct DocumentExtractor {
    store: Arc<dyn DocumentStore>,
    temp_dir: PathBuf,
    local_root: Option<PathBuf>,
}

impl DocumentExtractor {
    pub fn new(store: Arc<dyn DocumentStore>, temp_dir: PathBuf) -> Self {
        Self { store, temp_dir, local_root: None }
    }

    /// Allows `file://` and absolute-path locators under `root`.
    pub fn with_local_root(mut self, root: PathBuf) -> Self {
        self.local_root = Some(root);
        self
    }

    pub(crate) fn from_settings(settings: &Settings, store: Arc<dyn DocumentStore>) -> Self {
        Self::new(store, settings.storage().temp_dir.clone())
            .with_local_root(settings.storage().root.clone())
    }

    /// Empty or unparseable documents yield an empty string.
    pub async fn extract(&self, locator: &str) -> Result<String, ExtractionError> {
        let timer = Instant::now();
        let result = match local_path(locator) {
            Some(path) => self.extract_local(path).await,
            None => self.extract_remote(locator).await,
        };

        let outcome = match &result {
            Ok(text) if text.is_empty() => {
                tracing::warn!(locator, "Document has no readable text");
                "empty"
            }
            Ok(_) => "ok",
            Err(err) => {
                tracing::warn!(locator, error = %err, "Document extraction failed");
                "error"
            }
        };
        metrics::counter!("document_extractions_total", "outcome" => outcome).increment(1);
        metrics::histogram!("document_extraction_seconds").record(timer.elapsed().as_secs_f64());

        result
    }

    async fn extract_local(&self, path: PathBuf) -> Result<String, ExtractionError> {
        let label = path.display().to_string();
        let Some(root) = self.local_root.clone() else {
            return Err(ExtractionError::OutsideRoot(label));
        };

        run_blocking(move || {
            let io_error = |err: std::io::Error| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    ExtractionError::NotFound(label.clone())
                } else {
                    ExtractionError::Io { path: label.clone(), source: err }
                }
            };

            // Canonical forms resolve `..` and symlinks before the prefix check.
            let root = root.canonicalize().map_err(&io_error)?;
            let resolved = path.canonicalize().map_err(&io_error)?;
            if !resolved.starts_with(&root) {
                return Err(ExtractionError::OutsideRoot(label.clone()));
            }
            parse_path(&resolved).map_err(&io_error)
        })
        .await
    }

    async fn extract_remote(&self, locator: &str) -> Result<String, ExtractionError> {
        let bytes = self.store.fetch(locator).await.map_err(|err| match err {
            StorageError::NotFound(_) => ExtractionError::NotFound(locator.to_string()),
            other => ExtractionError::Fetch { locator: locator.to_string(), reason: other.to_string() },
        })?;

        tokio::fs::create_dir_all(&self.temp_dir).await.map_err(ExtractionError::Staging)?;

        let temp_dir = self.temp_dir.clone();
        run_blocking(move || stage_and_parse(&temp_dir, &bytes)).await
    }
}

fn local_path(locator: &str) -> Option<PathBuf> {
    if let Some(path) = locator.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    let path = Path::new(locator);
    path.is_absolute().then(|| path.to_path_buf())
}

async fn run_blocking<F>(job: F) -> Result<String, ExtractionError>
where
    F: FnOnce() -> Result<String, ExtractionError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| ExtractionError::Staging(std::io::Error::other(err.to_string())))?
}

fn stage_and_parse(temp_dir: &Path, bytes: &[u8]) -> Result<String, ExtractionError> {
    let digest = hex::encode(Sha256::digest(bytes));
    let mut staged = tempfile::Builder::new()
        .prefix(&format!("{}-", &digest[..16]))
        .suffix(".doc")
        .tempfile_in(temp_dir)
        .map_err(ExtractionError::Staging)?;

    staged.write_all(bytes).map_err(ExtractionError::Staging)?;
    staged.flush().map_err(ExtractionError::Staging)?;

    parse_path(staged.path()).map_err(ExtractionError::Staging)
}

fn parse_path(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;

    let text = if bytes.starts_with(PDF_MAGIC) {
        pdf_text(&bytes).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = %err, "Failed to parse PDF");
            String::new()
        })
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    };

    Ok(decode_percent_runs(text.trim()).into_owned())
}

/// Per-page text, pages separated by a newline.
fn pdf_text(bytes: &[u8]) -> Result<String, lopdf::Error> {
    let document = lopdf::Document::load_mem(bytes)?;

    let mut pages = Vec::new();
    for page_number in document.get_pages().keys() {
        match document.extract_text(&[*page_number]) {
            Ok(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    pages.push(text.to_string());
                }
            }
            Err(err) => {
                tracing::debug!(page_number, error = %err, "Skipping unreadable PDF page");
            }
        }
    }

    Ok(pages.join("\n"))
}

/// Decodes runs of `%XX` escapes. Runs that do not decode to UTF-8 are kept as-is.
pub(crate) fn decode_percent_runs(text: &str) -> Cow<'_, str> {
    if !text.contains('%') {
        return Cow::Borrowed(text);
    }

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut index = 0;

    while index < bytes.len() {
        let run_end = percent_run_end(bytes, index);
        if run_end == index {
            index += 1;
            continue;
        }

        if let Ok(decoded) = percent_decode_str(&text[index..run_end]).decode_utf8() {
            out.push_str(&text[copied..index]);
            out.push_str(&decoded);
            copied = run_end;
        }
        index = run_end;
    }

    out.push_str(&text[copied..]);
    Cow::Owned(out)
}

fn percent_run_end(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end + 2 < bytes.len()
        && bytes[end] == b'%'
        && bytes[end + 1].is_ascii_hexdigit()
        && bytes[end + 2].is_ascii_hexdigit()
    {
        end += 3;
    }
    end
}
