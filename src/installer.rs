//! Per-dependency pipeline: resolve, fetch, unpack, optionally compile,
//! publish to the cache, and copy into this run's staging directory.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::{ArchiveKind, Unpacker};
use crate::cache::CacheStore;
use crate::compile;
use crate::config::StepOutput;
use crate::dependency::{Dependency, DependencyRequest, Layout, Strategy};
use crate::error::SupplyError;
use crate::manifest::Manifest;
use crate::process::CommandRunner;
use crate::runtime::Runtime;
use crate::version::VersionResolver;

pub struct ArtifactInstaller<R: Runtime, M: Manifest, C: CommandRunner> {
    runtime: Arc<R>,
    manifest: Arc<M>,
    runner: Arc<C>,
    unpacker: Unpacker,
    layout: Layout,
    persistent: bool,
    step_output: StepOutput,
}

impl<R: Runtime, M: Manifest, C: CommandRunner> ArtifactInstaller<R, M, C> {
    pub fn new(runtime: Arc<R>, manifest: Arc<M>, runner: Arc<C>, layout: Layout) -> Self {
        Self {
            runtime,
            manifest,
            runner,
            unpacker: Unpacker::new(),
            layout,
            persistent: true,
            step_output: StepOutput::Quiet,
        }
    }

    /// Drop each cache entry once it has been copied to staging.
    pub fn with_persistent_cache(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_step_output(mut self, step_output: StepOutput) -> Self {
        self.step_output = step_output;
        self
    }

    /// Pin the request to one concrete version from the manifest.
    pub fn resolve(&self, request: &DependencyRequest) -> Result<Dependency> {
        let spec = if request.version_spec.trim().is_empty() {
            self.manifest.default_version(&request.name)?
        } else {
            request.version_spec.clone()
        };
        let candidates = self.manifest.all_versions(&request.name);
        let version = VersionResolver::resolve(&request.name, &spec, request.version_parts, &candidates)?;
        Ok(Dependency::new(request, &version, &self.layout))
    }

    /// Make `request` available in staging, reusing the cache when possible.
    #[tracing::instrument(skip(self, cache))]
    pub async fn install(&self, cache: &mut CacheStore<R>, request: &DependencyRequest) -> Result<Dependency> {
        let dependency = self.resolve(request)?;

        if cache.has(&dependency.full_name) {
            info!("Installing {} from application cache", dependency);
        } else {
            info!("Installing {}", dependency);
            self.populate(cache, &dependency).await?;
        }

        let cache_path = &dependency.locations.cache;
        self.runtime
            .copy_dir_all(cache_path, &dependency.locations.staging)
            .map_err(|e| SupplyError::CopyToStaging {
                dependency: dependency.full_name.clone(),
                reason: format!("{:#}", e),
            })?;
        debug!("Staged {} at {:?}", dependency, dependency.locations.staging);

        if !self.persistent
            && let Err(e) = self.runtime.remove_dir_all(cache_path)
        {
            warn!("Failed to remove cache entry {:?}: {:#}", cache_path, e);
        }

        cache.mark_in_use(&dependency.name, &dependency.full_name);
        Ok(dependency)
    }

    /// Fetch and build the cache entry for `dependency`, publishing it only on success.
    async fn populate(&self, cache: &CacheStore<R>, dependency: &Dependency) -> Result<()> {
        let fetch_error = |e: anyhow::Error| SupplyError::Fetch {
            dependency: dependency.full_name.clone(),
            reason: format!("{:#}", e),
        };

        let entry = self
            .manifest
            .entry(&dependency.name, &dependency.version)
            .map_err(fetch_error)?;
        let download = &dependency.locations.tmp_download;
        self.manifest
            .fetch(&dependency.name, &dependency.version, download)
            .await
            .map_err(fetch_error)?;

        self.manifest.warn_newer_patch(&dependency.name, &dependency.version);
        self.manifest.warn_end_of_life(&dependency.name, &dependency.version);

        let pending = cache.pending_path(&dependency.full_name);
        self.remove_if_present(&pending)?;

        let kind = ArchiveKind::from_uri(&entry.uri);
        let file_name = artifact_file_name(&entry.uri, &dependency.name);
        let extract_error = |e: anyhow::Error| SupplyError::Extract {
            dependency: dependency.full_name.clone(),
            reason: format!("{:#}", e),
        };

        match &dependency.strategy {
            Strategy::Prebuilt => {
                self.unpacker
                    .unpack(self.runtime.as_ref(), kind, download, &pending, &file_name)
                    .map_err(extract_error)?;
            }
            Strategy::CompileFromSource { configure_args } => {
                let extract_dir = &dependency.locations.tmp_extract;
                self.remove_if_present(extract_dir)?;
                self.unpacker
                    .unpack(self.runtime.as_ref(), kind, download, extract_dir, &file_name)
                    .map_err(extract_error)?;

                let source_dir = self.source_root(extract_dir)?;
                compile::compile(
                    self.runner.as_ref(),
                    &dependency.full_name,
                    &source_dir,
                    &pending,
                    configure_args,
                    self.step_output,
                )
                .await?;

                if let Err(e) = self.runtime.remove_dir_all(extract_dir) {
                    debug!("Failed to remove source tree {:?}: {:#}", extract_dir, e);
                }
            }
        }

        cache
            .publish(&dependency.full_name)
            .with_context(|| format!("Failed to publish {} to the cache", dependency))?;

        if self.runtime.exists(download)
            && let Err(e) = self.runtime.remove_file(download)
        {
            debug!("Failed to remove download {:?}: {:#}", download, e);
        }
        Ok(())
    }

    /// The single top-level directory of an extracted source archive, or the
    /// extraction directory itself when the archive has no such wrapper.
    fn source_root(&self, extract_dir: &Path) -> Result<PathBuf> {
        let children = self.runtime.read_dir(extract_dir)?;
        match children.as_slice() {
            [only] if self.runtime.is_dir(only) => Ok(only.clone()),
            _ => Ok(extract_dir.to_path_buf()),
        }
    }

    fn remove_if_present(&self, path: &Path) -> Result<()> {
        if self.runtime.exists(path) {
            debug!("Removing leftover {:?}", path);
            self.runtime.remove_dir_all(path)?;
        }
        Ok(())
    }
}

/// Last path segment of `uri`, without query or fragment.
fn artifact_file_name(uri: &str, fallback: &str) -> String {
    uri.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(fallback)
        .to_string()
}
