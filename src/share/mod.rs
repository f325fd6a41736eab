//! Shares: the public paths a daemon exposes and the local resources behind them.
//!
//! The [`ShareRegistry`] is built once at startup and is immutable afterwards, so
//! every connection can read it through a shared `Arc` without locking.

mod registry;

pub use registry::{Resolution, ResolveError, ShareRegistry};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building the share registry.
#[derive(Debug, Error)]
pub enum ShareError {
    #[error("share path does not exist or is unreadable: {path}: {source}")]
    MissingPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("share path is neither a file nor a directory: {0}")]
    UnsupportedKind(PathBuf),

    #[error("invalid public path: {0:?}")]
    InvalidPublicPath(String),

    #[error("public path {0:?} is configured more than once")]
    DuplicatePublicPath(String),

    #[error("invalid client address in allow list: {0:?}")]
    InvalidClient(String),

    #[error("no shares configured")]
    Empty,
}

/// Result type for share operations
pub type ShareResult<T> = Result<T, ShareError>;

/// What a share points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareKind {
    File,
    Directory,
}

/// Unvalidated share definition, as read from configuration or the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Public path clients request, e.g. `/docs`.
    #[serde(rename = "public")]
    pub public_path: String,
    /// Local file or directory backing the share.
    #[serde(rename = "path")]
    pub local_path: PathBuf,
    /// Client addresses allowed to read this share. Empty means everyone.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
}

impl ShareConfig {
    pub fn new(public_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            public_path: public_path.into(),
            local_path: local_path.into(),
            allow: Vec::new(),
        }
    }

    /// Build a share from a command-line argument.
    ///
    /// Accepts `PUBLIC=PATH`, or a bare `PATH` which is published under its
    /// file name (`/srv/music` becomes `/music`).
    pub fn from_arg(arg: &str) -> Self {
        if let Some((public, path)) = arg.split_once('=') {
            return Self::new(public, path);
        }

        let path = PathBuf::from(arg);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        Self::new(format!("/{}", name), path)
    }
}

/// A validated, immutable share.
#[derive(Debug, Clone)]
pub struct ShareEntry {
    /// Normalized public path: lower-case segments joined by `/`, no leading or
    /// trailing slash. The root share is the empty string.
    pub public_path: String,
    /// Canonical absolute path of the local resource.
    pub local_path: PathBuf,
    pub kind: ShareKind,
    pub allow_list: Option<HashSet<IpAddr>>,
    segments: Vec<String>,
}

impl ShareEntry {
    /// Whether `client` may read from this share.
    pub fn permits(&self, client: IpAddr) -> bool {
        match &self.allow_list {
            Some(allowed) => allowed.contains(&client) || allowed.contains(&client.to_canonical()),
            None => true,
        }
    }

    /// Number of public path segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub(crate) fn segments(&self) -> &[String] {
        &self.segments
    }
}

/// Normalize a configured public path into its lower-cased segments.
pub(crate) fn normalize_public_path(raw: &str) -> ShareResult<Vec<String>> {
    let mut segments = Vec::new();
    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." || segment.contains('\\') || segment.contains('\0') {
            return Err(ShareError::InvalidPublicPath(raw.to_string()));
        }
        segments.push(segment.to_lowercase());
    }
    Ok(segments)
}

pub(crate) fn build_entry(config: &ShareConfig) -> ShareResult<ShareEntry> {
    let segments = normalize_public_path(&config.public_path)?;

    let local_path =
        std::fs::canonicalize(&config.local_path).map_err(|source| ShareError::MissingPath {
            path: config.local_path.clone(),
            source,
        })?;
    let metadata = std::fs::metadata(&local_path).map_err(|source| ShareError::MissingPath {
        path: config.local_path.clone(),
        source,
    })?;
    let kind = if metadata.is_dir() {
        ShareKind::Directory
    } else if metadata.is_file() {
        ShareKind::File
    } else {
        return Err(ShareError::UnsupportedKind(local_path));
    };

    let allow_list = if config.allow.is_empty() {
        None
    } else {
        let parsed = config
            .allow
            .iter()
            .map(|raw| {
                raw.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| ShareError::InvalidClient(raw.clone()))
            })
            .collect::<ShareResult<HashSet<_>>>()?;
        Some(parsed)
    };

    Ok(ShareEntry {
        public_path: segments.join("/"),
        local_path,
        kind,
        allow_list,
        segments,
    })
}
