pub mod archive;
pub mod cache;
pub mod certificate;
pub mod compile;
pub mod config;
pub mod dependency;
pub mod error;
pub mod http;
pub mod installer;
pub mod manifest;
pub mod plugin;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod version;

pub use config::{Config, StepOutput};
pub use error::SupplyError;
pub use registry::{SupplyReport, run};
