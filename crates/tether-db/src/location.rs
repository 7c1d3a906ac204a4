//! Database URL parsing.

use std::path::PathBuf;

use anyhow::{bail, Result};

/// Where a database lives, decoded from an engine URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    /// Embedded, in-memory. (`""` or `:memory:`)
    Memory,
    /// Embedded, file-backed. (`file://<path>`)
    File(PathBuf),
    /// Remote Postgres. (`postgres://…` / `postgresql://…`)
    Remote(String),
}

impl DbLocation {
    pub fn parse(url: &str) -> Result<Self> {
        if url.is_empty() || url == ":memory:" {
            return Ok(DbLocation::Memory);
        }
        if let Some(path) = url.strip_prefix("file://") {
            if path.is_empty() {
                bail!("file:// URL has no path: {url:?}");
            }
            return Ok(DbLocation::File(PathBuf::from(path)));
        }
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(DbLocation::Remote(url.to_string()));
        }
        bail!("unrecognized database URL: {url:?}");
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, DbLocation::Remote(_))
    }
}
