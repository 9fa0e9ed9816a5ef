//! Unified error handling for the patcher
//!
//! Every pipeline step returns [`PatcherError`]. Variants carry enough context
//! to print a single actionable line for the operator, and [`ErrorKind`]
//! groups them the way the driver and the CLI reason about failures.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Coarse classification of a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid host, port, credentials or artifacts. Raised before the pipeline starts.
    Configuration,
    /// The input container or one of its descriptors is unusable.
    Input,
    /// The artifact was already processed by this tool.
    AlreadyPatched,
    /// A structural limit of the target that no retry can fix.
    FormatConstraint,
    /// An external tool failed, timed out or could not be found.
    ToolFailure,
    /// File-system or archive I/O failed.
    IoFailure,
}

/// Main error type for patcher operations
#[derive(Debug, Error)]
pub enum PatcherError {
    /// Invalid job configuration (host, port, credentials, conflicting options)
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A required SDK artifact could not be resolved
    #[error("{what} not found: {hint}")]
    ArtifactNotFound { what: &'static str, hint: String },

    /// An SDK artifact or supplied file has the wrong format
    #[error("Invalid {what} '{path}': {reason}")]
    InvalidArtifact {
        what: &'static str,
        path: String,
        reason: String,
    },

    /// Input container does not exist
    #[error("Input not found: {0}")]
    InputNotFound(PathBuf),

    /// Container is missing its root descriptor or bundle layout
    #[error("Unexpected container layout: {0}")]
    ContainerFormat(String),

    /// The executable declared by the bundle is missing on disk
    #[error("Main binary not found: {0}")]
    ExecutableNotFound(PathBuf),

    /// Supplied certificate does not exist and nothing else is usable
    #[error("Certificate file not found: {0}")]
    CertificateNotFound(PathBuf),

    /// `<manifest>` has no `package` attribute
    #[error("No 'package' attribute found in <manifest>")]
    MissingPackageAttribute,

    /// `<manifest>` has no `<application>` element
    #[error("No <application> element found in manifest")]
    MissingApplicationElement,

    /// Provisioning profile did not yield entitlements
    #[error("Failed to extract entitlements: {0}")]
    Entitlements(String),

    /// The artifact already carries the injected component
    #[error("{0} The package may already be patched.")]
    AlreadyPatched(String),

    /// No space left between the load commands and the first section
    #[error("Not enough Mach-O header padding: need {needed} bytes, {available} available")]
    InsufficientHeaderPadding { needed: usize, available: usize },

    /// Android package without `classes.dex`
    #[error("No classes.dex found in decoded APK")]
    MissingPrimaryDex,

    /// Mach-O structure could not be walked
    #[error("Malformed Mach-O: {0}")]
    MalformedMachO(String),

    /// External tool is not installed or not on PATH
    #[error("{tool} not found. {hint}")]
    ToolNotFound { tool: String, hint: String },

    /// External tool exited with a non-zero status
    #[error("{tool} failed (exit {code}): {output}")]
    ToolFailed {
        tool: String,
        code: i32,
        output: String,
    },

    /// External tool exceeded its deadline
    #[error("{tool} did not finish within {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    /// XML document could not be read or written
    #[error("XML error in {context}: {message}")]
    Xml { context: String, message: String },

    /// Property list could not be read or written
    #[error("Property list error for '{path}': {source}")]
    Plist {
        path: String,
        #[source]
        source: plist::Error,
    },

    /// Zip archive error
    #[error("Archive error for '{path}': {source}")]
    Zip {
        path: String,
        #[source]
        source: zip::result::ZipError,
    },

    /// File I/O error
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Result type alias for patcher operations
pub type Result<T> = std::result::Result<T, PatcherError>;

impl PatcherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PatcherError::Config(_) | PatcherError::ArtifactNotFound { .. } => {
                ErrorKind::Configuration
            }
            PatcherError::InputNotFound(_)
            | PatcherError::ContainerFormat(_)
            | PatcherError::ExecutableNotFound(_)
            | PatcherError::CertificateNotFound(_)
            | PatcherError::InvalidArtifact { .. }
            | PatcherError::MissingPackageAttribute
            | PatcherError::MissingApplicationElement
            | PatcherError::Entitlements(_) => ErrorKind::Input,
            PatcherError::AlreadyPatched(_) => ErrorKind::AlreadyPatched,
            PatcherError::InsufficientHeaderPadding { .. }
            | PatcherError::MissingPrimaryDex
            | PatcherError::MalformedMachO(_) => ErrorKind::FormatConstraint,
            PatcherError::ToolNotFound { .. }
            | PatcherError::ToolFailed { .. }
            | PatcherError::ToolTimeout { .. } => ErrorKind::ToolFailure,
            PatcherError::Xml { .. }
            | PatcherError::Plist { .. }
            | PatcherError::Zip { .. }
            | PatcherError::Io { .. } => ErrorKind::IoFailure,
        }
    }

    /// Check if this error was raised before any file was touched
    pub fn is_configuration_error(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    /// Whether an automatic retry could help. Every failure here needs the operator.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            PatcherError::InsufficientHeaderPadding { .. } => format!(
                "{self}. Relink the app with more load command space (-headerpad_max_install_names)."
            ),
            PatcherError::ToolNotFound { .. } | PatcherError::ToolTimeout { .. } => {
                format!("{self} (override the tool path with the AUTOPROXY_* environment variables)")
            }
            _ => self.to_string(),
        }
    }
}

/// Convert library errors with path context
impl PatcherError {
    pub fn from_io_error(path: impl AsRef<Path>, error: io::Error) -> Self {
        PatcherError::Io {
            path: path.as_ref().display().to_string(),
            source: error,
        }
    }

    pub fn from_zip_error(path: impl AsRef<Path>, error: zip::result::ZipError) -> Self {
        PatcherError::Zip {
            path: path.as_ref().display().to_string(),
            source: error,
        }
    }

    pub fn from_plist_error(path: impl AsRef<Path>, error: plist::Error) -> Self {
        PatcherError::Plist {
            path: path.as_ref().display().to_string(),
            source: error,
        }
    }

    pub fn xml(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        PatcherError::Xml {
            context: context.into(),
            message: message.to_string(),
        }
    }
}
