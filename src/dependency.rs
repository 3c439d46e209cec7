//! Dependency model: what is requested, what it resolved to, and where it lives.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::Config;

/// How a fetched artifact becomes the cached artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// The extracted artifact is used as-is.
    Prebuilt,
    /// The extracted tree is a source tree built with configure/make/make install.
    CompileFromSource { configure_args: Vec<String> },
}

/// A dependency as registered, before its version is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRequest {
    pub name: String,
    /// Partial version specifier; empty means the manifest default.
    pub version_spec: String,
    pub version_parts: usize,
    pub strategy: Strategy,
}

impl DependencyRequest {
    pub fn prebuilt(name: &str, version_spec: &str, version_parts: usize) -> Self {
        Self {
            name: name.to_string(),
            version_spec: version_spec.to_string(),
            version_parts,
            strategy: Strategy::Prebuilt,
        }
    }

    pub fn compiled(name: &str, version_spec: &str, version_parts: usize, configure_args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            version_spec: version_spec.to_string(),
            version_parts,
            strategy: Strategy::CompileFromSource { configure_args },
        }
    }
}

/// Filesystem locations of one resolved dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    pub cache: PathBuf,
    pub staging: PathBuf,
    pub tmp_download: PathBuf,
    pub tmp_extract: PathBuf,
}

/// A dependency whose version has been resolved. Immutable from here on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub version: String,
    pub full_name: String,
    pub strategy: Strategy,
    pub locations: Locations,
}

impl Dependency {
    pub fn new(request: &DependencyRequest, version: &str, layout: &Layout) -> Self {
        let full_name = full_name(&request.name, version);
        let locations = layout.locations(&full_name);
        Self {
            name: request.name.clone(),
            version: version.to_string(),
            full_name,
            strategy: request.strategy.clone(),
            locations,
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// Canonical cache and staging key.
pub fn full_name(name: &str, version: &str) -> String {
    format!("{}-{}", name, version)
}

/// Roots from which every dependency's locations are derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// `<cacheRoot>/<cacheFormatVersion>`
    pub cache_dir: PathBuf,
    /// `<depsDir>/<depsIdx>`
    pub staging_dir: PathBuf,
    /// `<tmp>/dependencies/<cacheFormatVersion>`
    pub tmp_dir: PathBuf,
}

impl Layout {
    pub fn new(cache_dir: &Path, staging_dir: &Path, tmp_root: &Path, format_version: &str) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            staging_dir: staging_dir.to_path_buf(),
            tmp_dir: tmp_root.join("dependencies").join(format_version),
        }
    }

    /// Layout for `config`, with `cache_dir` being the opened cache's format directory.
    pub fn from_config(config: &Config, cache_dir: &Path) -> Self {
        Self::new(
            cache_dir,
            &config.staging_dir(),
            &config.tmp_dir,
            &config.cache_format_version,
        )
    }

    pub fn locations(&self, full_name: &str) -> Locations {
        Locations {
            cache: self.cache_dir.join(full_name),
            staging: self.staging_dir.join(full_name),
            tmp_download: self.tmp_dir.join(full_name),
            tmp_extract: self.tmp_dir.join("extracted").join(full_name),
        }
    }
}
