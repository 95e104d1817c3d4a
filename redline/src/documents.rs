//! Document storage and text extraction.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};

use crate::errors::{Error, Result};

/// Maximum accepted upload size.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Blob store keyed by the `storage_path` recorded on analyses.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn download(&self, storage_path: &str) -> Result<Vec<u8>>;
}

/// Turns raw document bytes into analyzable text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<String>;
}

/// Filesystem-backed store rooted at a configured directory.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Join a storage path under the root, rejecting traversal components.
    fn resolve(&self, storage_path: &str) -> Result<PathBuf> {
        let relative = Path::new(storage_path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::validation("storage_path", "invalid path"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn download(&self, storage_path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(storage_path)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("document"))
            }
            Err(e) => Err(Error::external(format!("document read failed: {e}"))),
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, storage_path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.blobs.insert(storage_path.into(), bytes.into());
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn download(&self, storage_path: &str) -> Result<Vec<u8>> {
        self.blobs
            .get(storage_path)
            .map(|b| b.clone())
            .ok_or_else(|| Error::not_found("document"))
    }
}

/// Extractor for pre-extracted or plain-text documents.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String> {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Validate an upload before it is stored: size cap and PDF magic bytes.
pub fn validate_upload(file_name: &str, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(Error::validation("file", "file is empty"));
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(Error::validation(
            "file",
            format!(
                "file exceeds the {} MiB limit",
                MAX_UPLOAD_BYTES / (1024 * 1024)
            ),
        ));
    }
    if !file_name.to_lowercase().ends_with(".pdf") {
        return Err(Error::validation("file", "only PDF files are accepted"));
    }
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(Error::validation("file", "file is not a valid PDF"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryDocumentStore::new();
        store.insert("u/contract.pdf", b"%PDF-1.7 data".to_vec());
        let bytes = store.download("u/contract.pdf").await.unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let store = MemoryDocumentStore::new();
        let err = store.download("nope.pdf").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn fs_store_rejects_traversal() {
        let store = FsDocumentStore::new("/tmp/contracts");
        let err = store.download("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn upload_validation() {
        let pdf = b"%PDF-1.7 content".to_vec();
        validate_upload("contract.pdf", &pdf).unwrap();
        validate_upload("CONTRACT.PDF", &pdf).unwrap();

        assert!(validate_upload("contract.pdf", b"").is_err());
        assert!(validate_upload("contract.docx", &pdf).is_err());
        assert!(validate_upload("contract.pdf", b"not a pdf at all").is_err());

        let oversized = vec![b'a'; MAX_UPLOAD_BYTES + 1];
        assert!(validate_upload("contract.pdf", &oversized).is_err());
    }

    #[test]
    fn plain_text_extraction_is_lossy_on_invalid_utf8() {
        let extractor = PlainTextExtractor;
        let text = extractor.extract(&[b'o', b'k', 0xFF]).unwrap();
        assert!(text.starts_with("ok"));
    }
}
