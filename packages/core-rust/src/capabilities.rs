//! Service capability manifests for offline contract comparison.
//!
//! A [`ServiceCapabilities`] manifest declares what one node publishes and
//! subscribes to, plus any validation mismatches found at startup. Two
//! independently-deployed services can export their manifests and compare
//! them out-of-band (e.g. in a build pipeline) without running both.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised while reading or writing a manifest file.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("manifest i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-node publish/subscribe manifest.
///
/// Built once at startup from the registered publish and subscribe
/// configuration and read-only afterwards. `errors` holds human-readable
/// descriptions of validation mismatches discovered while correlating
/// publish rules against subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCapabilities {
    pub service_name: String,
    /// Message types this node consumes.
    pub subscriptions: Vec<String>,
    /// Message types this node emits.
    pub published: Vec<String>,
    /// Validation mismatches, empty when the contract checks out.
    pub errors: Vec<String>,
}

impl ServiceCapabilities {
    /// Creates a manifest for a service with no declarations.
    #[must_use]
    pub fn empty(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            subscriptions: Vec::new(),
            published: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Whether validation recorded any mismatches.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Writes the manifest as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::Io` if the file cannot be created and
    /// `CapabilityError::Json` if serialization fails.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), CapabilityError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Loads a manifest previously written with [`write_to_file`].
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::Io` if the file cannot be opened and
    /// `CapabilityError::Json` if the content is not a valid manifest.
    ///
    /// [`write_to_file`]: ServiceCapabilities::write_to_file
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, CapabilityError> {
        let file = File::open(path)?;
        let manifest = serde_json::from_reader(BufReader::new(file))?;
        Ok(manifest)
    }
}
