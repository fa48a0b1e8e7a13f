//! Vehicle identity bootstrap.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_MACHINE_ID_PATH: &str = "/etc/machine-id";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is empty")]
    Empty(PathBuf),
    #[error("id {0:?} contains a topic separator or wildcard")]
    InvalidCharacter(String),
}

fn validate(id: &str) -> Result<(), IdentityError> {
    if id.contains(['/', '+', '#']) {
        return Err(IdentityError::InvalidCharacter(id.to_string()));
    }
    Ok(())
}

/// Resolve the vehicle id: a configured override wins, otherwise the
/// machine-id file with surrounding whitespace removed.
pub fn load_identity(path: &Path, override_id: Option<&str>) -> Result<String, IdentityError> {
    if let Some(id) = override_id.map(str::trim).filter(|id| !id.is_empty()) {
        validate(id)?;
        info!("🆔 Using configured tank id {}", id);
        return Ok(id.to_string());
    }

    let raw = fs::read_to_string(path).map_err(|source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let id = raw.trim();
    if id.is_empty() {
        return Err(IdentityError::Empty(path.to_path_buf()));
    }
    validate(id)?;

    info!("🆔 Tank id {} (from {})", id, path.display());
    Ok(id.to_string())
}
