//! Error types for the vclab crate.

use std::fmt;

/// Fault kinds reported by failed backend tasks (closed set).
///
/// The backend maps its version-specific fault identifier strings onto
/// these kinds; see `DriverConfig::power_fault_ids`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The VM is already in the requested power state.
    InvalidPowerState,
    /// An object with the requested name already exists.
    DuplicateName,
    /// The target resource is locked by another operation.
    ResourceInUse,
    /// Guest tools are not installed or not running.
    ToolsUnavailable,
    /// The task target no longer exists.
    NotFound,
    /// Any other backend fault.
    Other,
}

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverErrorKind {
    /// Zero matches on a name lookup
    NotFound,
    /// More than one match on a name lookup
    Ambiguous,
    /// Deadline elapsed while waiting or retrying
    Timeout,
    /// Pre-flight datastore capacity check failed
    InsufficientSpace,
    /// A backend task reported a fault
    Fault(FaultKind),
    /// Remote shell command returned a failure result
    Ssh,
    /// File upload reported failure
    Upload,
    /// File download reported failure
    Download,
    /// Remote-management script returned a non-zero status
    WinRm,
    /// Authentication failed (401)
    Auth,
    /// Backend or transport unreachable
    Connection,
    /// HTTP / API error with status code
    ApiError(u16),
    /// Response parse / deserialization error
    Parse,
    /// Missing or invalid configuration
    Config,
    /// Generic
    Other,
}

/// Crate error type carrying a kind + human-readable message, plus
/// optional captured output or the last underlying failure.
#[derive(Debug, Clone)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
    pub details: Option<String>,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            details: None,
        }
    }

    pub fn with_details(
        kind: DriverErrorKind,
        msg: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: msg.into(),
            details: Some(details.into()),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::NotFound, msg)
    }

    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Ambiguous, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, msg)
    }

    pub fn insufficient_space(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::InsufficientSpace, msg)
    }

    pub fn fault(kind: FaultKind, msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Fault(kind), msg)
    }

    pub fn ssh(msg: impl Into<String>, output: impl Into<String>) -> Self {
        Self::with_details(DriverErrorKind::Ssh, msg, output)
    }

    pub fn upload(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Upload, msg)
    }

    pub fn download(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Download, msg)
    }

    pub fn winrm(msg: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::with_details(DriverErrorKind::WinRm, msg, stderr)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Auth, msg)
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, msg)
    }

    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::ApiError(status), msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Parse, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Config, msg)
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Other, msg)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(ref d) = self.details {
            write!(f, ": {}", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for DriverError {}

impl From<DriverError> for String {
    fn from(e: DriverError) -> String {
        e.to_string()
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::connection(format!("HTTP timeout: {e}"))
        } else if e.is_connect() {
            Self::connection(format!("Connection failed: {e}"))
        } else {
            Self::other(format!("HTTP error: {e}"))
        }
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {e}"))
    }
}

/// Convenience alias.
pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_details() {
        let err = DriverError::ssh("command 'ls' failed", "no such file");
        assert_eq!(err.to_string(), "[Ssh] command 'ls' failed: no such file");
    }

    #[test]
    fn test_fault_kind_is_matchable() {
        let err = DriverError::fault(FaultKind::InvalidPowerState, "already powered on");
        assert_eq!(
            err.kind,
            DriverErrorKind::Fault(FaultKind::InvalidPowerState)
        );
        assert_ne!(err.kind, DriverErrorKind::Fault(FaultKind::Other));
    }
}
