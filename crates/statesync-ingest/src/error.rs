//! Scanner and producer error types

use std::path::PathBuf;
use thiserror::Error;

use statesync_common::ChannelError;

/// Why a single source file was skipped
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed XML: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// `node` is the zero-based position among the document's record nodes
    #[error("Record node {node} has no {field}")]
    MissingField { node: usize, field: &'static str },

    #[error("Record node {node} has invalid {field}: {reason}")]
    InvalidField {
        node: usize,
        field: &'static str,
        reason: String,
    },

    /// The root holds something other than `<Module>` / `<DeviceStatus>` nodes
    #[error("Not a status document, root contains {}", found.join(", "))]
    UnexpectedContent { found: Vec<String> },
}

/// Directory-level scan failure; the whole tick is retried
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to create source directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to list source directory {path}: {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Producer loop failures
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Failed to publish batch from {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: ChannelError,
    },
}

impl ProducerError {
    /// Whether the loop must stop instead of retrying on the next tick
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProducerError::Publish { source, .. } if source.is_closed())
    }
}
