pub mod artifacts;
pub mod cli;
pub mod config;
pub mod container;
pub mod dex;
pub mod error;
pub mod inject;
pub mod logging;
pub mod macho;
pub mod manifest;
pub mod signing;
pub mod toolchain;
pub mod tools;
pub mod workdir;
pub mod workflow;

pub use config::PatchJob;
pub use error::{PatcherError, Result};
pub use toolchain::{SystemToolchain, Toolchain};
pub use workflow::{run_patch, PatchReport, Stage};
