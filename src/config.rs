use log::debug;
use std::path::PathBuf;

use crate::runtime::Runtime;

/// Tag partitioning the cache root; bump it on incompatible layout changes.
pub const DEFAULT_CACHE_FORMAT_VERSION: &str = "v1";

/// How child-process output is surfaced while a step runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepOutput {
    /// Lines are drained and discarded.
    #[default]
    Quiet,
    /// Stdout lines are logged at info, stderr lines at warn.
    Verbose,
}

/// Everything a supply run needs to know up front.
#[derive(Debug, Clone)]
pub struct Config {
    pub build_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub deps_dir: PathBuf,
    pub deps_idx: String,
    /// Directory holding `manifest.yml`.
    pub buildpack_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub cache_format_version: String,
    pub no_cache: bool,
    pub step_output: StepOutput,
    pub retention: bool,
    /// Main runtime version specifier, empty for the manifest default.
    pub runtime_version: String,
    pub plugins: Vec<String>,
    pub certificates: Vec<String>,
    /// Validate the rendered pipeline configuration with the runtime.
    pub config_check: bool,
    /// Manifest entries are limited to this stack when set.
    pub stack: Option<String>,
}

impl Config {
    pub fn new<R: Runtime>(
        runtime: &R,
        build_dir: PathBuf,
        cache_dir: PathBuf,
        deps_dir: PathBuf,
        deps_idx: String,
        buildpack_dir: PathBuf,
    ) -> Self {
        let tmp_dir = runtime.temp_dir();
        debug!("Using temporary root {:?}", tmp_dir);
        Self {
            build_dir,
            cache_dir,
            deps_dir,
            deps_idx,
            buildpack_dir,
            tmp_dir,
            cache_format_version: DEFAULT_CACHE_FORMAT_VERSION.to_string(),
            no_cache: false,
            step_output: StepOutput::default(),
            retention: false,
            runtime_version: String::new(),
            plugins: Vec::new(),
            certificates: Vec::new(),
            config_check: false,
            stack: None,
        }
    }

    /// This run's staging root, `<deps_dir>/<deps_idx>`.
    pub fn staging_dir(&self) -> PathBuf {
        self.deps_dir.join(&self.deps_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    #[test]
    fn test_config_defaults() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_temp_dir()
            .returning(|| PathBuf::from("/tmp"));

        let config = Config::new(
            &runtime,
            PathBuf::from("/build"),
            PathBuf::from("/cache"),
            PathBuf::from("/deps"),
            "0".to_string(),
            PathBuf::from("/buildpack"),
        );

        assert_eq!(config.tmp_dir, PathBuf::from("/tmp"));
        assert_eq!(config.cache_format_version, "v1");
        assert_eq!(config.step_output, StepOutput::Quiet);
        assert!(!config.no_cache);
        assert!(config.runtime_version.is_empty());
        assert!(!config.config_check);
        assert_eq!(config.stack, None);
        assert_eq!(config.staging_dir(), PathBuf::from("/deps/0"));
    }
}
