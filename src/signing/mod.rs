//! Signing credentials and the signing order for both platforms.

pub mod apk;
pub mod ios;

pub use apk::{resolve_apk_key, KeystoreCredential, DEBUG_KEYSTORE_NAME};
pub use ios::{extract_entitlements, prepare_entitlements, sign_app, signing_targets, SignTarget};
