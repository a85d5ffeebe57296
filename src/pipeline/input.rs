//! Input discovery: list the source folder and read each document.
//!
//! The folder is scanned non-recursively and the result is sorted by file
//! name, so a rerun over the same folder processes documents (and writes
//! report entries) in the same order. Each file is checked for the PDF
//! magic bytes (`%PDF`) before rendering, so callers get a meaningful
//! error rather than a pdfium failure.

use crate::error::{DocumentError, ExtractError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// List files in `folder` whose extension matches `extension`
/// (case-insensitive, without the dot), sorted by file name.
pub fn discover_documents(folder: &Path, extension: &str) -> Result<Vec<PathBuf>, ExtractError> {
    let unreadable = |source| ExtractError::SourceFolderUnreadable {
        path: folder.to_path_buf(),
        source,
    };

    let mut documents = Vec::new();
    for entry in std::fs::read_dir(folder).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        if path.is_file() && has_extension(&path, extension) {
            documents.push(path);
        }
    }
    documents.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    info!(
        "Found {} *.{} document(s) in {}",
        documents.len(),
        extension,
        folder.display()
    );
    Ok(documents)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

/// Read a document and verify it starts with the PDF magic bytes.
pub async fn read_document(path: &Path) -> Result<Vec<u8>, DocumentError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| DocumentError::ReadFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;

    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(DocumentError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }

    debug!("Read {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes)
}

/// File name of `path` for report entries and progress output.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_filters_by_extension_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.pdf", "a.PDF", "notes.txt", "c.pdf"] {
            std::fs::write(dir.path().join(name), b"%PDF-1.7").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.pdf")).unwrap();

        let found = discover_documents(dir.path(), "pdf").unwrap();
        let names: Vec<String> = found.iter().map(|p| display_name(p)).collect();
        assert_eq!(names, vec!["a.PDF", "b.pdf", "c.pdf"]);
    }

    #[test]
    fn discover_empty_folder_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_documents(dir.path(), "pdf").unwrap().is_empty());
    }

    #[test]
    fn discover_missing_folder_fails() {
        let err = discover_documents(Path::new("/nonexistent/factures"), "pdf").unwrap_err();
        assert!(matches!(err, ExtractError::SourceFolderUnreadable { .. }));
    }

    #[tokio::test]
    async fn read_rejects_non_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.pdf");
        std::fs::write(&path, b"PK\x03\x04zip").unwrap();
        match read_document(&path).await {
            Err(DocumentError::NotAPdf { magic, .. }) => assert_eq!(&magic, b"PK\x03\x04"),
            other => panic!("expected NotAPdf, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_rejects_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.pdf");
        std::fs::write(&path, b"%P").unwrap();
        assert!(matches!(
            read_document(&path).await,
            Err(DocumentError::NotAPdf { .. })
        ));
    }

    #[tokio::test]
    async fn read_accepts_pdf_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%%EOF").unwrap();
        assert_eq!(read_document(&path).await.unwrap().len(), 14);
    }
}
