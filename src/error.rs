use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Transport or parse failure for a single listing page or detail fetch.
/// Never fatal: the harvest loop turns it into an empty page or an error-marker record.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("blocked by anti-bot interstitial at {0}")]
    Blocked(String),
    #[error("driver cannot {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return FetchError::Timeout(Duration::ZERO);
        }
        if let Some(status) = e.status() {
            return FetchError::Status {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        if e.is_decode() || e.is_body() {
            return FetchError::Decode(e.to_string());
        }
        FetchError::Connection(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process (usually the spreadsheet application) holds the file.
    #[error("{} is locked by another program; close it so the harvest can save", .0.display())]
    Locked(PathBuf),
    #[error("no output at {}", .0.display())]
    Missing(PathBuf),
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("unreadable spreadsheet {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },
}

impl StoreError {
    /// Classifies an I/O failure, separating a sharing/permission lock from everything else.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        // 32/33 are the Windows sharing and lock violations raised while Excel has the file open.
        let locked = source.kind() == io::ErrorKind::PermissionDenied
            || matches!(source.raw_os_error(), Some(32) | Some(33));
        if locked {
            StoreError::Locked(path)
        } else if source.kind() == io::ErrorKind::NotFound {
            StoreError::Missing(path)
        } else {
            StoreError::Io { path, source }
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, StoreError::Locked(_))
    }
}

/// Startup-only failures; the run stops before any network activity.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no output destination given (use --output)")]
    MissingOutput,
    #[error("unknown site '{0}'")]
    UnknownSite(String),
    #[error("unknown region '{name}' for {site}")]
    UnknownRegion { site: &'static str, name: String },
    #[error("unknown category '{name}' for {site}")]
    UnknownCategory { site: &'static str, name: String },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_is_a_lock() {
        let err = StoreError::from_io("out.xlsx", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(err.is_locked());
        assert!(err.to_string().contains("close it"));
    }

    #[test]
    fn other_io_errors_are_not_locks() {
        let err = StoreError::from_io("out.xlsx", io::Error::from(io::ErrorKind::WriteZero));
        assert!(!err.is_locked());
        let missing = StoreError::from_io("out.xlsx", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(missing, StoreError::Missing(_)));
    }
}
