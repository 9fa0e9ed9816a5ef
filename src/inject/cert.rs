//! CA certificate placement

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::config::IOS_BUNDLE_PATH;
use crate::error::{PatcherError, Result};

pub const ANDROID_CERT_PATH: &str = "assets/auto_proxy/ca_cert.pem";
pub const CERT_FILE_NAME: &str = "ca_cert.pem";

const PEM_MARKER: &[u8] = b"-----BEGIN CERTIFICATE-----";
/// DER certificates start with a SEQUENCE tag.
const DER_SEQUENCE: u8 = 0x30;

static DEFAULT_CA_CERT: &[u8] = include_bytes!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/default_ca_cert.pem"
));

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertSource {
    Supplied(PathBuf),
    Default,
}

pub fn android_cert_target(decoded_dir: &Path) -> PathBuf {
    decoded_dir.join(ANDROID_CERT_PATH)
}

pub fn ios_cert_target(app_dir: &Path) -> PathBuf {
    app_dir.join(IOS_BUNDLE_PATH).join(CERT_FILE_NAME)
}

/// Copy the operator's CA (or the built-in one) to `target`, verbatim.
pub fn install_cert(target: &Path, supplied: Option<&Path>) -> Result<CertSource> {
    let (bytes, source) = match supplied {
        Some(path) => {
            if !path.is_file() {
                return Err(PatcherError::CertificateNotFound(path.to_path_buf()));
            }
            let bytes = fs::read(path).map_err(|e| PatcherError::from_io_error(path, e))?;
            if !looks_like_certificate(&bytes) {
                return Err(PatcherError::InvalidArtifact {
                    what: "CA certificate",
                    path: path.display().to_string(),
                    reason: "expected a PEM or DER encoded certificate".into(),
                });
            }
            (bytes, CertSource::Supplied(path.to_path_buf()))
        }
        None => (DEFAULT_CA_CERT.to_vec(), CertSource::Default),
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| PatcherError::from_io_error(parent, e))?;
    }
    fs::write(target, &bytes).map_err(|e| PatcherError::from_io_error(target, e))?;

    match &source {
        CertSource::Supplied(path) => info!("Installed CA certificate from {}", path.display()),
        CertSource::Default => info!("Installed default CA certificate"),
    }
    debug!(target = %target.display(), bytes = bytes.len(), "certificate written");
    Ok(source)
}

fn looks_like_certificate(bytes: &[u8]) -> bool {
    let trimmed = match bytes.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &bytes[start..],
        None => return false,
    };
    if trimmed.first() == Some(&DER_SEQUENCE) {
        return true;
    }
    trimmed
        .windows(PEM_MARKER.len())
        .any(|window| window == PEM_MARKER)
}
