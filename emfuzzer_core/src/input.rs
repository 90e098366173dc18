use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum CaseError {
    #[error("Failed to read case {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One fuzzing input: the bytes of a file, keyed by its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Case {
    key: String,
    payload: Vec<u8>,
}

impl Case {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// Reads the whole file. Empty files yield `None` and are meant to be skipped.
    pub fn load(path: &Path) -> Result<Option<Self>, CaseError> {
        info!("Opening {}", path.display());
        let payload = std::fs::read(path).map_err(|source| CaseError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if payload.is_empty() {
            warn!("No data found, skipping {}", path.display());
            return Ok(None);
        }
        Ok(Some(Self::new(path.display().to_string(), payload)))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }
}
