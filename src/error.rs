//! Fatal failure kinds of a supply run.
//!
//! Functions propagate `anyhow::Error`; the variants below are raised at the
//! failure site so callers can tell what failed with `downcast_ref`.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The three steps of a from-source build, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStep {
    Configure,
    Make,
    Install,
}

impl CompileStep {
    pub const ALL: [CompileStep; 3] = [CompileStep::Configure, CompileStep::Make, CompileStep::Install];
}

impl fmt::Display for CompileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileStep::Configure => write!(f, "configure"),
            CompileStep::Make => write!(f, "make"),
            CompileStep::Install => write!(f, "make install"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SupplyError {
    #[error("No version of {name} matches '{spec}'")]
    VersionResolution { name: String, spec: String },

    #[error("Cache root {} is unavailable: {reason}", path.display())]
    CacheRootUnavailable { path: PathBuf, reason: String },

    #[error("Failed to fetch {dependency}: {reason}")]
    Fetch { dependency: String, reason: String },

    #[error("Failed to extract {dependency}: {reason}")]
    Extract { dependency: String, reason: String },

    #[error("Compilation of {dependency} failed at step '{step}': {reason}")]
    Compile {
        dependency: String,
        step: CompileStep,
        reason: String,
    },

    #[error("Failed to copy {dependency} to the staging directory: {reason}")]
    CopyToStaging { dependency: String, reason: String },

    #[error("Failed to install plugin {plugin}:\n{output}")]
    PluginInstall { plugin: String, output: String },

    #[error("Certificate file {name}.crt not found in {}", dir.display())]
    CertificateMissing { name: String, dir: PathBuf },

    #[error("Helper script {script} failed: {reason}")]
    HelperScript { script: String, reason: String },

    #[error("Pipeline configuration check failed:\n{output}")]
    ConfigCheck { output: String },
}
