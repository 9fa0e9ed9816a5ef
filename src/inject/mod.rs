//! Files the SDK reads at runtime: proxy config, CA certificate and, on iOS,
//! the framework itself.

pub mod cert;
pub mod config;
pub mod framework;

pub use cert::{install_cert, CertSource, ANDROID_CERT_PATH, CERT_FILE_NAME};
pub use config::{
    read_properties, write_android_config, write_ios_config, write_properties,
    ANDROID_CONFIG_PATH, IOS_BUNDLE_PATH, IOS_CONFIG_NAME,
};
pub use framework::install_framework;
