use std::io;
use std::path::{Path, PathBuf};

use crate::segment::header::Version;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io {
        path: PathBuf,
        context: &'static str,
        source: io::Error,
    },
    LockError(io::Error),
    // Corrupt header, bad layout, or a named object of the wrong type
    MalformedDb {
        path: PathBuf,
        component: &'static str,
        reason: String,
    },
    IncompatibleVersion {
        path: PathBuf,
        found: Version,
        min: Version,
        max: Version,
    },
    // Token pool exhausted or segment out of space
    ResourceExhausted {
        path: PathBuf,
        resource: &'static str,
    },
    KeyNotFound {
        path: PathBuf,
        key: String,
    },
    InvalidKey {
        key: String,
        reason: &'static str,
    },
    EmptyBuffer,
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn io(path: &Path, context: &'static str, source: io::Error) -> Self {
        Error::Io {
            path: path.to_path_buf(),
            context,
            source,
        }
    }

    pub(crate) fn malformed(path: &Path, component: &'static str, reason: impl Into<String>) -> Self {
        Error::MalformedDb {
            path: path.to_path_buf(),
            component,
            reason: reason.into(),
        }
    }

    pub(crate) fn exhausted(path: &Path, resource: &'static str) -> Self {
        Error::ResourceExhausted {
            path: path.to_path_buf(),
            resource,
        }
    }

    pub(crate) fn key_not_found(path: &Path, key: &str) -> Self {
        Error::KeyNotFound {
            path: path.to_path_buf(),
            key: key.to_string(),
        }
    }

    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Error::KeyNotFound { .. })
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Error::ResourceExhausted { .. })
    }

    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Error::MalformedDb { .. } | Error::IncompatibleVersion { .. }
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io {
                path,
                context,
                source,
            } => write!(f, "Failed to {} {}: {}", context, path.display(), source),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::MalformedDb {
                path,
                component,
                reason,
            } => write!(
                f,
                "Malformed database {} ({}): {}",
                path.display(),
                component,
                reason
            ),
            Error::IncompatibleVersion {
                path,
                found,
                min,
                max,
            } => write!(
                f,
                "Incompatible version {} in {}, supported range is {} to {}",
                found,
                path.display(),
                min,
                max
            ),
            Error::ResourceExhausted { path, resource } => {
                write!(f, "Resource exhausted in {}: {}", path.display(), resource)
            }
            Error::KeyNotFound { path, key } => {
                write!(f, "Key not found in {}: {}", path.display(), key)
            }
            Error::InvalidKey { key, reason } => write!(f, "Invalid key {:?}: {}", key, reason),
            Error::EmptyBuffer => write!(f, "Ring buffer is empty"),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::LockError(err) => Some(err),
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
