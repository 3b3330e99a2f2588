//! Persistent client identity.
//!
//! The relay has no accounts; a client proves nothing and simply reuses the
//! id it generated on first run. The id is kept in a small JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ClientError;

#[derive(Serialize, Deserialize, Debug)]
struct StoredIdentity {
    id: String,
}

#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the stored id, generating and saving a new one when the file
    /// is missing, unreadable or empty.
    pub fn load_or_create(&self) -> Result<String, ClientError> {
        match self.load() {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Discarding unreadable identity file"),
        }

        let id = generate_client_id();
        self.save(&id)?;
        info!(path = %self.path.display(), %id, "Generated client identity");
        Ok(id)
    }

    fn load(&self) -> Result<Option<String>, ClientError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredIdentity = serde_json::from_str(&raw)?;
        let id = stored.id.trim().to_string();
        Ok((!id.is_empty()).then_some(id))
    }

    pub fn save(&self, id: &str) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_string_pretty(&StoredIdentity { id: id.to_string() })?;
        fs::write(&self.path, body)?;
        Ok(())
    }
}

/// Fresh random user id
pub fn generate_client_id() -> String {
    Uuid::new_v4().to_string()
}
