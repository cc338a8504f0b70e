//! Source directory scanner
//!
//! Turns every status document in one directory into one [`Batch`]. A file
//! that cannot be read or parsed is reported and skipped; it never stops the
//! other files from being scanned.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use statesync_common::{Batch, StateRecord};

use crate::error::{ParseError, ScanError};
use crate::parser::parse_status_document;
use crate::policy::StatePolicy;

/// Default source file extension
pub const DEFAULT_EXTENSION: &str = "xml";

/// Batch parsed from one file
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub path: PathBuf,
    pub batch: Batch,
}

/// File that was skipped during a scan
#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: ParseError,
}

/// Outcome of one scan, batches in file name order
#[derive(Debug, Default)]
pub struct ScanReport {
    pub batches: Vec<SourceBatch>,
    pub failures: Vec<FileFailure>,
}

impl ScanReport {
    pub fn record_count(&self) -> usize {
        self.batches.iter().map(|b| b.batch.len()).sum()
    }
}

/// Reads status documents from a directory
#[derive(Debug, Clone)]
pub struct SourceScanner {
    directory: PathBuf,
    extension: String,
    policy: Arc<dyn StatePolicy>,
}

impl SourceScanner {
    /// Create the scanner, creating `directory` if it does not exist yet
    pub async fn open(
        directory: impl Into<PathBuf>,
        extension: impl AsRef<str>,
        policy: Arc<dyn StatePolicy>,
    ) -> Result<Self, ScanError> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|source| ScanError::CreateDirectory {
                path: directory.clone(),
                source,
            })?;

        Ok(Self {
            directory,
            extension: extension.as_ref().trim_start_matches('.').to_string(),
            policy,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Parse every matching file in the directory
    pub async fn scan(&self) -> Result<ScanReport, ScanError> {
        let mut report = ScanReport::default();

        for path in self.list_files().await? {
            match self.scan_file(&path).await {
                Ok(batch) => {
                    debug!(path = %path.display(), records = batch.len(), "Parsed source file");
                    report.batches.push(SourceBatch { path, batch });
                }
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "Skipping source file");
                    report.failures.push(FileFailure { path, error });
                }
            }
        }

        Ok(report)
    }

    /// Parse one file into a batch, applying the state policy
    pub async fn scan_file(&self, path: &Path) -> Result<Batch, ParseError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ParseError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        parse_status_document(&content)?
            .into_iter()
            .enumerate()
            .map(|(node, status)| {
                let state = self.policy.assign(status.state);
                StateRecord::new(status.category_key, state).map_err(|e| {
                    ParseError::InvalidField {
                        node,
                        field: "ModuleCategoryID",
                        reason: e.to_string(),
                    }
                })
            })
            .collect()
    }

    async fn list_files(&self) -> Result<Vec<PathBuf>, ScanError> {
        let read_error = |source| ScanError::ReadDirectory {
            path: self.directory.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(read_error)?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
            let path = entry.path();
            // Entries that vanish while listing are simply not scanned
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if is_file && self.matches_extension(&path) {
                files.push(path);
            }
        }

        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::policy::FixedStatePolicy;
    use statesync_common::ModuleState;

    async fn scanner(dir: &Path, extension: &str) -> SourceScanner {
        SourceScanner::open(
            dir,
            extension,
            Arc::new(FixedStatePolicy(ModuleState::Run)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_extension_is_normalized_and_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = scanner(dir.path(), ".xml").await;

        assert_eq!(scanner.extension(), "xml");
        assert!(scanner.matches_extension(Path::new("a.xml")));
        assert!(scanner.matches_extension(Path::new("B.XML")));
        assert!(!scanner.matches_extension(Path::new("a.xml.processed")));
        assert!(!scanner.matches_extension(Path::new("xml")));
    }

    #[tokio::test]
    async fn test_scan_file_applies_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.xml");
        std::fs::write(
            &path,
            "<Modules><Module><ModuleCategoryID>M1</ModuleCategoryID></Module></Modules>",
        )
        .unwrap();

        let batch = scanner(dir.path(), "xml").await.scan_file(&path).await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records()[0].category_key(), "M1");
        assert_eq!(batch.records()[0].state(), ModuleState::Run);
    }

    #[tokio::test]
    async fn test_scan_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = scanner(dir.path(), "xml").await;

        let err = scanner
            .scan_file(&dir.path().join("gone.xml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Io { .. }));
    }
}
