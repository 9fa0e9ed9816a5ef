//! Descriptor patching: AndroidManifest.xml, the network security config and
//! the iOS Info.plist.

pub mod android;
pub mod bundle;
pub mod nsc;
mod xml;

pub use android::{
    ensure_nsc_reference, network_security_config_ref, patch_manifest, read_package,
    ANDROID_NS, AUTHORITY_SUFFIX, PROVIDER_CLASS,
};
pub use bundle::{derive_bundle_id, patch_bundle_id, PATCHED_PREFIX};
pub use nsc::{default_policy, merge_user_trust, patch_trust_policy, TrustPolicyOutcome};
